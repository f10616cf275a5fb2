// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Trending engine coordinator.
//!
//! The [`TrendingEngine`] ties the components together:
//! - Primary sorted-score store (Redis, or in-memory without Redis)
//! - Circuit-breaking gate with the process-local fallback cache
//! - Decay, warm-up, recovery-replay and view-flush background tasks
//! - View buffer with dedup markers and durable SQL view counts
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Bootstrapping → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use trending_engine::{TrendingEngine, TrendingConfig, EngineState, ScoreEvent};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrendingConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     ..TrendingConfig::default()
//! };
//! let mut engine = TrendingEngine::new(config)?;
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await?;
//! engine.record(17, ScoreEvent::Like).await?;
//! let trending = engine.trending().await?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod types;
mod api;
mod lifecycle;

pub use types::{EngineError, EngineState, HealthCheck};

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::TrendingConfig;
use crate::fallback::FallbackStore;
use crate::gate::BreakerScoreStore;
use crate::resilience::circuit_breaker::CircuitState;
use crate::storage::redis::RedisScoreStore;
use crate::storage::sql::SqlViewStore;
use crate::storage::traits::{PopularitySeed, ScoreStore, ViewCountSink};
use crate::tasks::decay::DecayScheduler;
use crate::tasks::reconcile::ReconciliationManager;
use crate::tasks::view_flush::ViewFlusher;
use crate::tasks::BackgroundTasks;
use crate::views::dedup::ViewDedup;
use crate::views::ViewBuffer;

/// Components built by `start()`.
pub(super) struct Components {
    pub(super) gate: Arc<BreakerScoreStore>,
    pub(super) views: Arc<ViewBuffer>,
    pub(super) decay: Arc<DecayScheduler>,
    pub(super) reconciler: Arc<ReconciliationManager>,
    pub(super) flusher: Option<Arc<ViewFlusher>>,
    pub(super) primary_backend: &'static str,
}

/// Real-time popularity ranking engine.
///
/// Score writes and ranking reads go through the circuit-breaking gate, so
/// they are answered by the fallback cache while Redis is unavailable.
/// No method surfaces a primary store failure; only lifecycle errors
/// (invalid config, unreachable backends at startup, calls before
/// `start()`) are returned.
///
/// # Thread Safety
///
/// After `start()` the engine is used through `&self` and is `Send + Sync`.
pub struct TrendingEngine {
    pub(super) config: TrendingConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Fallback cache; exists from construction so it can be inspected
    pub(super) fallback: Arc<FallbackStore>,

    /// Injected collaborators (take precedence over configured URLs)
    pub(super) injected_primary: Option<Arc<dyn ScoreStore>>,
    pub(super) view_sink: Option<Arc<dyn ViewCountSink>>,
    pub(super) seed: Option<Arc<dyn PopularitySeed>>,
    pub(super) view_dedup: Option<Arc<dyn ViewDedup>>,

    /// Concrete backends, kept for health probes
    pub(super) redis_store: Option<Arc<RedisScoreStore>>,
    pub(super) sql_store: Option<Arc<SqlViewStore>>,

    pub(super) components: Option<Components>,
    pub(super) tasks: BackgroundTasks,
}

impl TrendingEngine {
    /// Create an engine in `Created` state. Fails fast on invalid config.
    pub fn new(config: TrendingConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let fallback = Arc::new(FallbackStore::new(config.fallback_max_size)?);

        Ok(Self {
            config,
            state: state_tx,
            state_rx,
            fallback,
            injected_primary: None,
            view_sink: None,
            seed: None,
            view_dedup: None,
            redis_store: None,
            sql_store: None,
            components: None,
            tasks: BackgroundTasks::new(),
        })
    }

    /// Use this primary instead of connecting to `redis_url`.
    #[must_use]
    pub fn with_primary(mut self, primary: Arc<dyn ScoreStore>) -> Self {
        self.injected_primary = Some(primary);
        self
    }

    /// Flush view counts here instead of `sql_url`.
    #[must_use]
    pub fn with_view_sink(mut self, sink: Arc<dyn ViewCountSink>) -> Self {
        self.view_sink = Some(sink);
        self
    }

    /// Cold-start seed used when both score stores are empty.
    #[must_use]
    pub fn with_seed(mut self, seed: Arc<dyn PopularitySeed>) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Shared view dedup markers (defaults to Redis when connected).
    #[must_use]
    pub fn with_view_dedup(mut self, dedup: Arc<dyn ViewDedup>) -> Self {
        self.view_dedup = Some(dedup);
        self
    }

    #[must_use]
    pub fn config(&self) -> &TrendingConfig {
        &self.config
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    pub(super) fn running(&self) -> Result<&Components, EngineError> {
        let state = self.state();
        match &self.components {
            Some(components) if state == EngineState::Running => Ok(components),
            _ => Err(EngineError::NotRunning(state)),
        }
    }

    /// The fallback cache.
    #[must_use]
    pub fn fallback(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }

    /// The circuit-breaking gate, once started.
    #[must_use]
    pub fn gate(&self) -> Option<&Arc<BreakerScoreStore>> {
        self.components.as_ref().map(|c| &c.gate)
    }

    /// Current circuit state (`Closed` before start).
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.gate().map_or(CircuitState::Closed, |gate| gate.state())
    }

    /// Comprehensive health snapshot, probing Redis (PING) and SQL (SELECT 1).
    pub async fn health(&self) -> HealthCheck {
        let state = self.state();
        let circuit = self.circuit_state();

        let (redis_result, sql_result) = tokio::join!(self.probe_redis(), self.probe_sql());
        let (redis_connected, redis_latency_ms) = redis_result;
        let (sql_connected, sql_latency_ms) = sql_result;

        let (primary_backend, pending_view_items, circuit_rejections) = match &self.components {
            Some(c) => (c.primary_backend, c.views.pending_items(), c.gate.breaker().rejections()),
            None => ("none", 0, 0),
        };

        let healthy = state == EngineState::Running
            && circuit == CircuitState::Closed
            && redis_connected != Some(false)
            && sql_connected != Some(false);

        HealthCheck {
            state,
            circuit: circuit.to_string(),
            primary_backend,
            redis_connected,
            redis_latency_ms,
            sql_connected,
            sql_latency_ms,
            fallback_items: self.fallback.size(),
            fallback_evictions: self.fallback.evictions(),
            pending_deletions: self.fallback.deletion_log_len(),
            pending_view_items,
            circuit_rejections,
            healthy,
        }
    }

    /// Probe Redis connectivity with PING.
    async fn probe_redis(&self) -> (Option<bool>, Option<u64>) {
        let Some(ref redis_store) = self.redis_store else {
            return (None, None);
        };

        let start = std::time::Instant::now();
        let mut conn = redis_store.connection();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;

        match result {
            Ok(_) => (Some(true), Some(start.elapsed().as_millis() as u64)),
            Err(_) => (Some(false), None),
        }
    }

    /// Probe SQL connectivity with SELECT 1.
    async fn probe_sql(&self) -> (Option<bool>, Option<u64>) {
        let Some(ref sql_store) = self.sql_store else {
            return (None, None);
        };

        let start = std::time::Instant::now();
        let pool = sql_store.pool();
        let result = sqlx::query("SELECT 1").fetch_one(&pool).await;

        match result {
            Ok(_) => (Some(true), Some(start.elapsed().as_millis() as u64)),
            Err(_) => (Some(false), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = TrendingConfig { decay_rate: 1.5, ..TrendingConfig::default() };
        assert!(matches!(
            TrendingEngine::new(config),
            Err(EngineError::Config(ConfigError::InvalidDecayRate(_)))
        ));
    }

    #[test]
    fn test_new_engine_is_created() {
        let engine = TrendingEngine::new(TrendingConfig::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert_eq!(engine.circuit_state(), CircuitState::Closed);
        assert!(engine.gate().is_none());
    }

    #[tokio::test]
    async fn test_calls_before_start_are_rejected() {
        let engine = TrendingEngine::new(TrendingConfig::default()).unwrap();
        assert!(matches!(engine.trending().await, Err(EngineError::NotRunning(EngineState::Created))));
    }

    #[tokio::test]
    async fn test_health_before_start() {
        let engine = TrendingEngine::new(TrendingConfig::default()).unwrap();
        let health = engine.health().await;

        assert_eq!(health.state, EngineState::Created);
        assert_eq!(health.primary_backend, "none");
        assert_eq!(health.redis_connected, None);
        assert!(!health.healthy);
    }
}
