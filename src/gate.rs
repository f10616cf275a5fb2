// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit-breaking decorator over the primary score store.
//!
//! [`BreakerScoreStore`] implements [`ScoreStore`] itself, so callers stay
//! polymorphic over a bare primary and a protected one. Every call is tried
//! against the primary while the circuit admits it; a rejection, error or
//! timeout is answered by the [`FallbackStore`] instead. Callers never see
//! a primary failure from this type.
//!
//! ```text
//! increment / top_n / remove / apply_decay / count
//!        │
//!        ▼
//!   breaker.admit() ──Rejected──────────────┐
//!        │ Primary                           │
//!        ▼                                   ▼
//!   primary (timeout) ──Err / Timeout──▶ FallbackStore
//!        │ Ok                                (remove: logged for replay)
//!        ▼
//!     result
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::fallback::FallbackStore;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use crate::score::{DecayOutcome, ItemId, ScoreEntry};
use crate::storage::traits::{ScoreError, ScoreStore};

pub struct BreakerScoreStore {
    primary: Arc<dyn ScoreStore>,
    fallback: Arc<FallbackStore>,
    breaker: Arc<CircuitBreaker>,
}

impl BreakerScoreStore {
    pub fn new(primary: Arc<dyn ScoreStore>, fallback: Arc<FallbackStore>, config: CircuitConfig) -> Self {
        Self {
            primary,
            fallback,
            breaker: Arc::new(CircuitBreaker::new("primary", config)),
        }
    }

    #[must_use]
    pub fn primary(&self) -> &Arc<dyn ScoreStore> {
        &self.primary
    }

    #[must_use]
    pub fn fallback(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CircuitState> {
        self.breaker.subscribe_state()
    }

    pub fn subscribe_recoveries(&self) -> watch::Receiver<u64> {
        self.breaker.subscribe_recoveries()
    }

    /// Run one primary call through the breaker, recording the outcome.
    pub async fn call_primary<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, CircuitError<ScoreError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ScoreError>>,
    {
        let _timer = crate::metrics::LatencyTimer::new("primary", operation);
        let result = self.breaker.call(f).await;
        match &result {
            Ok(_) => crate::metrics::record_operation("primary", operation, "success"),
            Err(CircuitError::Rejected) => {
                crate::metrics::record_operation("fallback", operation, "rejected");
            }
            Err(e) => {
                warn!(operation, error = %e, "Primary call failed, serving from fallback");
                crate::metrics::record_operation("fallback", operation, "error");
            }
        }
        result
    }
}

#[async_trait]
impl ScoreStore for BreakerScoreStore {
    async fn increment(&self, item_id: ItemId, delta: f64) -> Result<f64, ScoreError> {
        match self
            .call_primary("increment", || self.primary.increment(item_id, delta))
            .await
        {
            Ok(score) => Ok(score),
            Err(_) => Ok(self.fallback.increment_score(item_id, delta)),
        }
    }

    async fn top_n_with_scores(&self, offset: usize, limit: usize) -> Result<Vec<ScoreEntry>, ScoreError> {
        match self
            .call_primary("top_n", || self.primary.top_n_with_scores(offset, limit))
            .await
        {
            Ok(entries) => Ok(entries),
            Err(_) => Ok(self.fallback.get_top_n_with_scores(offset, limit)),
        }
    }

    async fn remove(&self, item_id: ItemId) -> Result<(), ScoreError> {
        match self.call_primary("remove", || self.primary.remove(item_id)).await {
            Ok(()) => {
                self.fallback.discard(item_id);
                debug!(item_id, "Item removed from primary and fallback");
            }
            Err(_) => self.fallback.remove_item(item_id),
        }
        Ok(())
    }

    /// Decays whichever store is authoritative for this call. The periodic
    /// scheduler does not go through here: it decays the fallback on every
    /// run regardless of the circuit.
    async fn apply_decay(&self, rate: f64, threshold: f64) -> Result<DecayOutcome, ScoreError> {
        match self
            .call_primary("decay", || self.primary.apply_decay(rate, threshold))
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(self.fallback.apply_decay(rate, threshold)),
        }
    }

    async fn count(&self) -> Result<usize, ScoreError> {
        match self.call_primary("count", || self.primary.count()).await {
            Ok(n) => Ok(n),
            Err(_) => Ok(self.fallback.size()),
        }
    }
}
