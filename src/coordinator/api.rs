// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Score and ranking API.
//!
//! - `record()` / `increment()` - apply a score delta
//! - `record_view()` - deduplicated view counting plus score bump
//! - `trending()` / `top_n()` / `top_n_with_scores()` - ranked reads
//! - `remove_item()` - content deletion
//! - `run_decay()` / `run_warm_up()` / `replay_deletions()` / `flush_views()` -
//!   run a background job now

use std::collections::HashMap;

use tracing::debug;

use crate::score::{ItemId, ScoreEntry, ScoreEvent};
use crate::storage::traits::ScoreStore;
use crate::tasks::decay::DecayRun;
use crate::tasks::reconcile::{ReplayRun, WarmUpRun};
use crate::tasks::view_flush::FlushRun;

use super::{EngineError, TrendingEngine};

impl TrendingEngine {
    /// Apply an application event's configured weight to an item.
    /// Returns the item's new score in the store that took the write.
    pub async fn record(&self, item_id: ItemId, event: ScoreEvent) -> Result<f64, EngineError> {
        let delta = event.weight(&self.config);
        crate::metrics::record_event(event.as_str());
        debug!(item_id, %event, delta, "Recording score event");
        self.increment(item_id, delta).await
    }

    /// Add an arbitrary delta (any sign) to an item's score.
    pub async fn increment(&self, item_id: ItemId, delta: f64) -> Result<f64, EngineError> {
        let components = self.running()?;
        Ok(components.gate.increment(item_id, delta).await?)
    }

    /// Record a raw view. The score is always bumped by the view weight;
    /// returns `true` when this viewer's view was counted durably (first
    /// within the dedup TTL).
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use trending_engine::TrendingEngine;
    /// # async fn example(engine: &TrendingEngine) -> Result<(), trending_engine::EngineError> {
    /// let counted = engine.record_view(42, "ip:1.2.3.4").await?;
    /// let again = engine.record_view(42, "ip:1.2.3.4").await?;
    /// assert!(counted && !again);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn record_view(&self, item_id: ItemId, viewer_key: &str) -> Result<bool, EngineError> {
        let components = self.running()?;
        Ok(components.views.mark_viewed_and_increment(item_id, viewer_key).await)
    }

    /// The configured number of top items.
    pub async fn trending(&self) -> Result<Vec<ItemId>, EngineError> {
        self.top_n(self.config.trending_size).await
    }

    /// Up to `limit` item ids, highest score first.
    pub async fn top_n(&self, limit: usize) -> Result<Vec<ItemId>, EngineError> {
        let entries = self.top_n_with_scores(limit).await?;
        Ok(entries.into_iter().map(|e| e.item_id).collect())
    }

    /// Up to `limit` entries with scores, highest first.
    ///
    /// An empty answer from a healthy primary (e.g. right after a flush of
    /// Redis) falls through to the fallback snapshot when it has data.
    pub async fn top_n_with_scores(&self, limit: usize) -> Result<Vec<ScoreEntry>, EngineError> {
        let components = self.running()?;
        let entries = components.gate.top_n_with_scores(0, limit).await?;
        if entries.is_empty() && limit > 0 && self.fallback.has_data() {
            debug!("Primary ranking empty, serving fallback snapshot");
            return Ok(self.fallback.get_top_n_with_scores(0, limit));
        }
        Ok(entries)
    }

    /// Remove a deleted item from the rankings. Logged for replay when the
    /// primary cannot be reached.
    pub async fn remove_item(&self, item_id: ItemId) -> Result<(), EngineError> {
        let components = self.running()?;
        components.gate.remove(item_id).await?;
        Ok(())
    }

    /// Take the buffered view counts (for hosts flushing them themselves).
    ///
    /// Without a view count sink nothing else drains the buffer: the counts
    /// keep one entry per viewed item until this is called.
    pub fn take_view_counts(&self) -> Result<HashMap<ItemId, u64>, EngineError> {
        let components = self.running()?;
        Ok(components.views.get_and_clear_view_counts())
    }

    /// Run one decay pass now.
    pub async fn run_decay(&self) -> Result<DecayRun, EngineError> {
        let components = self.running()?;
        Ok(components.decay.run_once().await)
    }

    /// Warm the fallback from the primary now.
    pub async fn run_warm_up(&self) -> Result<WarmUpRun, EngineError> {
        let components = self.running()?;
        Ok(components.reconciler.warm_up_once().await)
    }

    /// Replay pending deletions into the primary now.
    pub async fn replay_deletions(&self) -> Result<ReplayRun, EngineError> {
        let components = self.running()?;
        Ok(components.reconciler.replay_deletions().await)
    }

    /// Flush buffered view counts now. `None` without a view count sink.
    pub async fn flush_views(&self) -> Result<Option<FlushRun>, EngineError> {
        let components = self.running()?;
        match &components.flusher {
            Some(flusher) => Ok(Some(flusher.flush_once().await)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TrendingConfig;
    use crate::coordinator::{EngineError, EngineState, TrendingEngine};
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::score::ScoreEvent;
    use crate::storage::memory::InMemoryScoreStore;
    use crate::storage::traits::ScoreStore;
    use crate::tasks::view_flush::FlushRun;
    use std::sync::Arc;

    async fn running_engine() -> (Arc<InMemoryScoreStore>, TrendingEngine) {
        let primary = Arc::new(InMemoryScoreStore::new());
        let mut engine = TrendingEngine::new(TrendingConfig::default())
            .unwrap()
            .with_primary(primary.clone());
        engine.start().await.unwrap();
        (primary, engine)
    }

    #[tokio::test]
    async fn test_events_apply_weights() {
        let (primary, engine) = running_engine().await;

        engine.record(1, ScoreEvent::Comment).await.unwrap();
        engine.record(1, ScoreEvent::Like).await.unwrap();
        engine.record(2, ScoreEvent::Like).await.unwrap();
        engine.record(2, ScoreEvent::Unlike).await.unwrap();
        engine.record(3, ScoreEvent::View).await.unwrap();

        assert_eq!(primary.score(1), Some(7.0));
        assert_eq!(primary.score(2), Some(0.0));
        assert_eq!(primary.score(3), Some(2.0));
    }

    #[tokio::test]
    async fn test_trending_uses_configured_size() {
        let (_primary, engine) = running_engine().await;
        for id in 1..=8 {
            engine.increment(id, id as f64).await.unwrap();
        }

        assert_eq!(engine.trending().await.unwrap(), vec![8, 7, 6, 5, 4]);
        assert_eq!(engine.top_n(2).await.unwrap(), vec![8, 7]);
        assert!(engine.top_n(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_primary_serves_fallback_snapshot() {
        let (primary, engine) = running_engine().await;
        engine.increment(5, 9.0).await.unwrap();
        engine.run_warm_up().await.unwrap();
        primary.clear();

        assert_eq!(engine.top_n(5).await.unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_record_view_dedups_counter() {
        let (primary, engine) = running_engine().await;

        assert!(engine.record_view(42, "ip:1.2.3.4").await.unwrap());
        assert!(!engine.record_view(42, "ip:1.2.3.4").await.unwrap());

        assert_eq!(primary.score(42), Some(4.0));
        assert_eq!(engine.take_view_counts().unwrap().get(&42), Some(&1));
        assert_eq!(engine.flush_views().await.unwrap(), None::<FlushRun>);
    }

    #[tokio::test]
    async fn test_view_counts_without_sink_accumulate_until_taken() {
        let (_primary, engine) = running_engine().await;
        for viewer in ["ip:1", "ip:2", "ip:3"] {
            engine.record_view(7, viewer).await.unwrap();
        }
        engine.record_view(8, "ip:1").await.unwrap();

        // No sink, so a flush leaves the buffer alone
        assert_eq!(engine.flush_views().await.unwrap(), None::<FlushRun>);

        let taken = engine.take_view_counts().unwrap();
        assert_eq!(taken.get(&7), Some(&3));
        assert_eq!(taken.get(&8), Some(&1));
        assert!(engine.take_view_counts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_item_purges_primary() {
        let (primary, engine) = running_engine().await;
        engine.increment(3, 10.0).await.unwrap();

        engine.remove_item(3).await.unwrap();
        engine.remove_item(3).await.unwrap();

        assert_eq!(primary.count().await.unwrap(), 0);
        assert!(engine.fallback().get_deletion_log().is_empty());
        assert_eq!(engine.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_rejected() {
        let (_primary, mut engine) = running_engine().await;
        engine.shutdown().await;

        assert_eq!(engine.state(), EngineState::ShuttingDown);
        assert!(matches!(
            engine.increment(1, 1.0).await,
            Err(EngineError::NotRunning(EngineState::ShuttingDown))
        ));
    }
}
