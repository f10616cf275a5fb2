// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind view counting.
//!
//! Every raw view bumps the real-time score by the view weight. The durable
//! per-item view counter only counts the first view per viewer within the
//! dedup TTL, and is buffered here until [`ViewBuffer::get_and_clear_view_counts`]
//! hands the batch to a flusher. Counts taken but never written (a crash
//! mid-flush) are lost.

pub mod dedup;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::score::ItemId;
use crate::storage::traits::ScoreStore;
use dedup::{view_key, LocalViewDedup, ViewDedup};

pub struct ViewBuffer {
    scores: Arc<dyn ScoreStore>,
    remote_dedup: Option<Arc<dyn ViewDedup>>,
    local_dedup: LocalViewDedup,
    counts: Mutex<HashMap<ItemId, u64>>,
    view_weight: f64,
    dedup_ttl: Duration,
}

impl ViewBuffer {
    /// `scores` is normally the circuit-breaking gate.
    pub fn new(scores: Arc<dyn ScoreStore>, view_weight: f64, dedup_ttl: Duration) -> Self {
        Self {
            scores,
            remote_dedup: None,
            local_dedup: LocalViewDedup::new(),
            counts: Mutex::new(HashMap::new()),
            view_weight,
            dedup_ttl,
        }
    }

    /// Use a shared dedup store; the local one remains the fallback.
    #[must_use]
    pub fn with_dedup(mut self, dedup: Arc<dyn ViewDedup>) -> Self {
        self.remote_dedup = Some(dedup);
        self
    }

    /// Record one raw view. Returns `true` if it was the viewer's first
    /// within the dedup TTL (and so counted durably).
    pub async fn mark_viewed_and_increment(&self, item_id: ItemId, viewer_key: &str) -> bool {
        let key = view_key(item_id, viewer_key);
        let first_view = match &self.remote_dedup {
            Some(remote) => match remote.mark_if_absent(&key, self.dedup_ttl).await {
                Ok(created) => created,
                Err(e) => {
                    warn!(item_id, error = %e, "View dedup store unavailable, using local markers");
                    crate::metrics::record_dedup_error();
                    self.local_dedup.mark(&key, self.dedup_ttl)
                }
            },
            None => self.local_dedup.mark(&key, self.dedup_ttl),
        };

        if first_view {
            *self.counts.lock().entry(item_id).or_insert(0) += 1;
        }
        crate::metrics::record_view(!first_view);

        // The gate never fails; a bare store error is only logged
        if let Err(e) = self.scores.increment(item_id, self.view_weight).await {
            warn!(item_id, error = %e, "View score increment failed");
        }
        first_view
    }

    /// Take the buffered counts, leaving the buffer empty.
    pub fn get_and_clear_view_counts(&self) -> HashMap<ItemId, u64> {
        std::mem::take(&mut *self.counts.lock())
    }

    /// Merge a batch back after a failed flush.
    pub fn restore_view_counts(&self, batch: HashMap<ItemId, u64>) {
        if batch.is_empty() {
            return;
        }
        let restored = batch.len();
        let mut counts = self.counts.lock();
        for (item_id, count) in batch {
            *counts.entry(item_id).or_insert(0) += count;
        }
        debug!(restored, "View counts restored to buffer");
    }

    /// Items with buffered counts.
    #[must_use]
    pub fn pending_items(&self) -> usize {
        self.counts.lock().len()
    }

    /// Drop expired local markers.
    pub fn purge_expired_markers(&self) -> usize {
        self.local_dedup.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryScoreStore;
    use crate::storage::traits::ScoreError;
    use async_trait::async_trait;

    struct BrokenDedup;

    #[async_trait]
    impl ViewDedup for BrokenDedup {
        async fn mark_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, ScoreError> {
            Err(ScoreError::Backend("connection reset".into()))
        }
    }

    fn buffer() -> (Arc<InMemoryScoreStore>, ViewBuffer) {
        let scores = Arc::new(InMemoryScoreStore::new());
        let buffer = ViewBuffer::new(scores.clone(), 2.0, Duration::from_secs(600));
        (scores, buffer)
    }

    #[tokio::test]
    async fn test_duplicate_view_counts_once_but_scores_twice() {
        let (scores, buffer) = buffer();

        assert!(buffer.mark_viewed_and_increment(42, "ip:1.2.3.4").await);
        assert!(!buffer.mark_viewed_and_increment(42, "ip:1.2.3.4").await);

        assert_eq!(scores.score(42), Some(4.0));
        let counts = buffer.get_and_clear_view_counts();
        assert_eq!(counts.get(&42), Some(&1));
    }

    #[tokio::test]
    async fn test_distinct_viewers_count_separately() {
        let (_scores, buffer) = buffer();

        buffer.mark_viewed_and_increment(1, "a").await;
        buffer.mark_viewed_and_increment(1, "b").await;
        buffer.mark_viewed_and_increment(2, "a").await;

        let counts = buffer.get_and_clear_view_counts();
        assert_eq!(counts.get(&1), Some(&2));
        assert_eq!(counts.get(&2), Some(&1));
    }

    #[tokio::test]
    async fn test_get_and_clear_empties_buffer() {
        let (_scores, buffer) = buffer();
        buffer.mark_viewed_and_increment(1, "a").await;

        assert_eq!(buffer.get_and_clear_view_counts().len(), 1);
        assert!(buffer.get_and_clear_view_counts().is_empty());
        assert_eq!(buffer.pending_items(), 0);
    }

    #[tokio::test]
    async fn test_restore_merges_counts() {
        let (_scores, buffer) = buffer();
        buffer.mark_viewed_and_increment(1, "a").await;
        let taken = buffer.get_and_clear_view_counts();
        buffer.mark_viewed_and_increment(1, "b").await;

        buffer.restore_view_counts(taken);

        assert_eq!(buffer.get_and_clear_view_counts().get(&1), Some(&2));
    }

    #[tokio::test]
    async fn test_remote_dedup_error_uses_local() {
        let (scores, buffer) = buffer();
        let buffer = buffer.with_dedup(Arc::new(BrokenDedup));

        assert!(buffer.mark_viewed_and_increment(7, "u1").await);
        assert!(!buffer.mark_viewed_and_increment(7, "u1").await);
        assert_eq!(scores.score(7), Some(4.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_viewer_counts_once() {
        let (scores, buffer) = buffer();
        let buffer = Arc::new(buffer);

        let a = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.mark_viewed_and_increment(42, "ip:1.2.3.4").await })
        };
        let b = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.mark_viewed_and_increment(42, "ip:1.2.3.4").await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert!(a ^ b);
        assert_eq!(buffer.get_and_clear_view_counts().get(&42), Some(&1));
        assert_eq!(scores.score(42), Some(4.0));
    }
}
