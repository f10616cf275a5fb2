// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Keeping the fallback cache and the primary store in step.
//!
//! - **Warm-up**: while the circuit is closed, copy the primary's top
//!   `warm_up_size` entries into the fallback on a timer, so it is never
//!   cold when the circuit next opens. Failures keep the previous snapshot.
//! - **Recovery replay**: on every HalfOpen→Closed, remove the fallback's
//!   logged deletions from the primary, then acknowledge them. Fallback
//!   scores are not merged back.
//!
//! A replay that fails leaves the log in place; the next warm-up tick
//! retries it while the circuit is closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gate::BreakerScoreStore;
use crate::resilience::circuit_breaker::CircuitState;
use super::{spawn_periodic, SingleFlight};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmUpRun {
    Skipped,
    NotClosed(CircuitState),
    /// Primary returned nothing; the fallback kept its snapshot
    Empty,
    Warmed(usize),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayRun {
    Skipped,
    /// Deletion log was empty
    Nothing,
    Replayed(usize),
    Failed,
}

pub struct ReconciliationManager {
    gate: Arc<BreakerScoreStore>,
    warm_up_size: usize,
    warm_up_interval: Duration,
    warm_flight: SingleFlight,
    replay_flight: SingleFlight,
}

impl ReconciliationManager {
    pub fn new(gate: Arc<BreakerScoreStore>, warm_up_size: usize, warm_up_interval: Duration) -> Self {
        Self {
            gate,
            warm_up_size,
            warm_up_interval,
            warm_flight: SingleFlight::new(),
            replay_flight: SingleFlight::new(),
        }
    }

    /// Copy the primary's current top entries into the fallback.
    #[tracing::instrument(skip(self), fields(size = self.warm_up_size))]
    pub async fn warm_up_once(&self) -> WarmUpRun {
        let Some(_flight) = self.warm_flight.try_begin() else {
            crate::metrics::record_task_skipped("warm_up");
            return WarmUpRun::Skipped;
        };

        let state = self.gate.state();
        if state != CircuitState::Closed {
            debug!(circuit = %state, "Circuit not closed, skipping warm-up");
            crate::metrics::record_warm_up("skipped", 0);
            return WarmUpRun::NotClosed(state);
        }

        let primary = self.gate.primary();
        let snapshot = match self
            .gate
            .call_primary("warm_up", || primary.top_n_with_scores(0, self.warm_up_size))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Warm-up failed, fallback keeps its previous snapshot");
                crate::metrics::record_warm_up("error", 0);
                return WarmUpRun::Failed;
            }
        };

        if snapshot.is_empty() {
            debug!("Primary is empty, nothing to warm");
            crate::metrics::record_warm_up("empty", 0);
            return WarmUpRun::Empty;
        }

        let written = self.gate.fallback().warm_up(&snapshot);
        debug!(written, cached = self.gate.fallback().size(), "Fallback warmed from primary");
        crate::metrics::record_warm_up("success", written);
        WarmUpRun::Warmed(written)
    }

    /// Remove every logged deletion from the primary and acknowledge it.
    #[tracing::instrument(skip(self))]
    pub async fn replay_deletions(&self) -> ReplayRun {
        let Some(_flight) = self.replay_flight.try_begin() else {
            crate::metrics::record_task_skipped("replay");
            return ReplayRun::Skipped;
        };

        let fallback = self.gate.fallback();
        let pending = fallback.get_deletion_log();
        if pending.is_empty() {
            return ReplayRun::Nothing;
        }

        let primary = self.gate.primary();
        match self
            .gate
            .call_primary("replay", || primary.remove_many(&pending))
            .await
        {
            Ok(_) => {
                fallback.acknowledge_deletions(&pending);
                info!(replayed = pending.len(), "Deletion log replayed into primary");
                crate::metrics::record_replay("success", pending.len());
                ReplayRun::Replayed(pending.len())
            }
            Err(e) => {
                warn!(pending = pending.len(), error = %e, "Deletion replay failed, log kept for retry");
                crate::metrics::record_replay("error", 0);
                ReplayRun::Failed
            }
        }
    }

    /// Warm-up timer. Pending deletions are replayed first.
    pub fn spawn_warm_up(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.warm_up_interval;
        spawn_periodic("warm_up", interval, move || {
            let manager = Arc::clone(&self);
            async move {
                if manager.gate.fallback().deletion_log_len() > 0 && manager.gate.state() == CircuitState::Closed {
                    manager.replay_deletions().await;
                }
                manager.warm_up_once().await;
            }
        })
    }

    /// Replay the deletion log after each recovery of the primary.
    pub fn spawn_recovery_listener(self: Arc<Self>) -> JoinHandle<()> {
        let mut recoveries = self.gate.subscribe_recoveries();
        tokio::spawn(async move {
            while recoveries.changed().await.is_ok() {
                let epoch = *recoveries.borrow_and_update();
                info!(epoch, "Primary recovered, replaying deletion log");
                self.replay_deletions().await;
            }
        })
    }
}
