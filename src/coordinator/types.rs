// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the trending engine.

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::traits::{ScoreError, SinkError};

/// Engine lifecycle state.
///
/// Use [`super::TrendingEngine::state()`] to check the current state or
/// [`super::TrendingEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to Redis / SQL
    Connecting,
    /// Warming or seeding the fallback cache
    Bootstrapping,
    /// Serving requests, background tasks running
    Running,
    /// Shutdown in progress or complete
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Bootstrapping => write!(f, "Bootstrapping"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Score store unavailable: {0}")]
    Store(#[from] ScoreError),
    #[error("View count store unavailable: {0}")]
    Sql(String),
    #[error("Engine is not running (state: {0})")]
    NotRunning(EngineState),
}

impl From<SinkError> for EngineError {
    fn from(err: SinkError) -> Self {
        EngineError::Sql(err.to_string())
    }
}

/// Point-in-time health snapshot, suitable for `/health` endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Circuit state as a label (`closed`, `half_open`, `open`)
    pub circuit: String,
    /// `redis`, `memory` or `custom`
    pub primary_backend: &'static str,
    /// `None` when Redis is not configured
    pub redis_connected: Option<bool>,
    pub redis_latency_ms: Option<u64>,
    /// `None` when SQL is not configured
    pub sql_connected: Option<bool>,
    pub sql_latency_ms: Option<u64>,
    pub fallback_items: usize,
    pub fallback_evictions: u64,
    pub pending_deletions: usize,
    pub pending_view_items: usize,
    pub circuit_rejections: u64,
    /// Running with a closed circuit and every configured backend reachable
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
    }

    #[test]
    fn test_not_running_error_message() {
        let err = EngineError::NotRunning(EngineState::Created);
        assert_eq!(err.to_string(), "Engine is not running (state: Created)");
    }

    #[test]
    fn test_sink_error_maps_to_sql() {
        let err: EngineError = SinkError::Backend("no such table".into()).into();
        assert!(matches!(err, EngineError::Sql(msg) if msg.contains("no such table")));
    }
}
