// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic multiplicative decay of both score stores.
//!
//! Each run decays the fallback cache unconditionally, then the primary if
//! the circuit is closed. The primary is decayed by one server-side script,
//! so concurrent increments are neither lost nor decayed twice. A failure on
//! one store never stops the other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{validate_decay, ConfigError};
use crate::fallback::FallbackStore;
use crate::resilience::circuit_breaker::CircuitState;
use crate::score::DecayOutcome;
use crate::storage::traits::{ScoreError, ScoreStore};
use super::{spawn_periodic, SingleFlight};

/// What happened to the primary during one decay run.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryDecay {
    Applied(DecayOutcome),
    /// Circuit was not closed; the primary was left alone
    NotClosed(CircuitState),
    Failed(ScoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecayRun {
    /// A previous run was still in flight
    Skipped,
    Completed {
        primary: PrimaryDecay,
        fallback: DecayOutcome,
    },
}

pub struct DecayScheduler {
    primary: Arc<dyn ScoreStore>,
    fallback: Arc<FallbackStore>,
    circuit: watch::Receiver<CircuitState>,
    rate: f64,
    threshold: f64,
    interval: Duration,
    timeout: Duration,
    flight: SingleFlight,
}

impl DecayScheduler {
    /// Rejects a rate outside `(0, 1)`, a negative or non-finite threshold,
    /// and a zero interval or timeout.
    pub fn new(
        primary: Arc<dyn ScoreStore>,
        fallback: Arc<FallbackStore>,
        circuit: watch::Receiver<CircuitState>,
        rate: f64,
        threshold: f64,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        validate_decay(rate, threshold)?;
        if interval.is_zero() {
            return Err(ConfigError::NonPositive { field: "decay_interval" });
        }
        if timeout.is_zero() {
            return Err(ConfigError::NonPositive { field: "decay_timeout" });
        }
        Ok(Self {
            primary,
            fallback,
            circuit,
            rate,
            threshold,
            interval,
            timeout,
            flight: SingleFlight::new(),
        })
    }

    /// One decay pass over both stores.
    #[tracing::instrument(skip(self), fields(rate = self.rate, threshold = self.threshold))]
    pub async fn run_once(&self) -> DecayRun {
        let Some(_flight) = self.flight.try_begin() else {
            debug!("Previous decay run still in flight, skipping");
            crate::metrics::record_task_skipped("decay");
            return DecayRun::Skipped;
        };

        let fallback = self.fallback.apply_decay(self.rate, self.threshold);
        crate::metrics::record_decay_run("fallback", "success", fallback.removed);

        let primary = self.decay_primary().await;

        match &primary {
            PrimaryDecay::Applied(outcome) => info!(
                primary_retained = outcome.retained,
                primary_removed = outcome.removed,
                fallback_retained = fallback.retained,
                fallback_removed = fallback.removed,
                "Decay run complete"
            ),
            PrimaryDecay::NotClosed(state) => info!(
                circuit = %state,
                fallback_retained = fallback.retained,
                fallback_removed = fallback.removed,
                "Decay run complete (fallback only)"
            ),
            PrimaryDecay::Failed(_) => {}
        }

        DecayRun::Completed { primary, fallback }
    }

    async fn decay_primary(&self) -> PrimaryDecay {
        let state = *self.circuit.borrow();
        if state != CircuitState::Closed {
            crate::metrics::record_decay_run("primary", "skipped", 0);
            return PrimaryDecay::NotClosed(state);
        }

        let result = tokio::time::timeout(self.timeout, self.primary.apply_decay(self.rate, self.threshold)).await;
        match result {
            Ok(Ok(outcome)) => {
                crate::metrics::record_decay_run("primary", "success", outcome.removed);
                PrimaryDecay::Applied(outcome)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Primary decay failed, fallback decay unaffected");
                crate::metrics::record_decay_run("primary", "error", 0);
                PrimaryDecay::Failed(e)
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Primary decay timed out, fallback decay unaffected");
                crate::metrics::record_decay_run("primary", "timeout", 0);
                PrimaryDecay::Failed(ScoreError::Timeout(self.timeout))
            }
        }
    }

    /// Run every `interval` until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.interval;
        spawn_periodic("decay", interval, move || {
            let scheduler = Arc::clone(&self);
            async move {
                scheduler.run_once().await;
            }
        })
    }
}
