// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::score::{page, sort_ranked, DecayOutcome, ItemId, ScoreEntry};
use super::traits::{ScoreError, ScoreStore};

/// Unbounded in-process sorted score store.
///
/// Stands in for Redis when no `redis_url` is configured, and serves as the
/// primary in tests. Unlike the fallback cache it has no capacity bound, no
/// deletion log and returns non-positive scores in rankings.
pub struct InMemoryScoreStore {
    scores: DashMap<ItemId, f64>,
}

impl InMemoryScoreStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scores: DashMap::new(),
        }
    }

    /// Get current item count
    #[must_use]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Current score of one item
    #[must_use]
    pub fn score(&self, item_id: ItemId) -> Option<f64> {
        self.scores.get(&item_id).map(|r| *r.value())
    }

    /// Clear all items
    pub fn clear(&self) {
        self.scores.clear();
    }
}

impl Default for InMemoryScoreStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScoreStore for InMemoryScoreStore {
    async fn increment(&self, item_id: ItemId, delta: f64) -> Result<f64, ScoreError> {
        // entry() holds the shard lock, so the add is atomic per key
        let mut score = self.scores.entry(item_id).or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    async fn top_n_with_scores(&self, offset: usize, limit: usize) -> Result<Vec<ScoreEntry>, ScoreError> {
        let mut entries: Vec<ScoreEntry> = self
            .scores
            .iter()
            .map(|r| ScoreEntry::new(*r.key(), *r.value()))
            .collect();
        sort_ranked(&mut entries);
        Ok(page(entries, offset, limit))
    }

    async fn remove(&self, item_id: ItemId) -> Result<(), ScoreError> {
        self.scores.remove(&item_id);
        Ok(())
    }

    async fn apply_decay(&self, rate: f64, threshold: f64) -> Result<DecayOutcome, ScoreError> {
        let mut outcome = DecayOutcome::default();
        self.scores.retain(|_, score| {
            *score *= rate;
            let keep = *score >= threshold;
            if keep {
                outcome.retained += 1;
            } else {
                outcome.removed += 1;
            }
            keep
        });
        Ok(outcome)
    }

    async fn count(&self) -> Result<usize, ScoreError> {
        Ok(self.scores.len())
    }
}
