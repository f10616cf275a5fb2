// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::score::{DecayOutcome, ItemId, ScoreEntry};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("Score store backend error: {0}")]
    Backend(String),
    #[error("Score store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unexpected data in '{key}': {detail}")]
    DataType { key: String, detail: String },
}

impl From<redis::RedisError> for ScoreError {
    fn from(err: redis::RedisError) -> Self {
        ScoreError::Backend(err.to_string())
    }
}

/// Failures of the durable (SQL) side: view counts and the cold-start seed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("View count store error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        SinkError::Backend(err.to_string())
    }
}

/// A sorted score structure: one score per item, ranked descending.
///
/// Implemented by the Redis primary, the in-memory store, and the breaker
/// gate that fronts the primary, so call sites stay polymorphic over them.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Add `delta` to the item's score (creating it at 0.0) and return the
    /// new score. Must be atomic with respect to concurrent increments.
    async fn increment(&self, item_id: ItemId, delta: f64) -> Result<f64, ScoreError>;

    /// One page of the ranking with scores.
    async fn top_n_with_scores(&self, offset: usize, limit: usize) -> Result<Vec<ScoreEntry>, ScoreError>;

    /// One page of the ranking, ids only.
    async fn top_n(&self, offset: usize, limit: usize) -> Result<Vec<ItemId>, ScoreError> {
        let entries = self.top_n_with_scores(offset, limit).await?;
        Ok(entries.into_iter().map(|e| e.item_id).collect())
    }

    /// Remove an item. Removing an absent item is not an error.
    async fn remove(&self, item_id: ItemId) -> Result<(), ScoreError>;

    /// Remove several items, returning how many were requested.
    /// Default implementation falls back to sequential removes.
    async fn remove_many(&self, item_ids: &[ItemId]) -> Result<usize, ScoreError> {
        for item_id in item_ids {
            self.remove(*item_id).await?;
        }
        Ok(item_ids.len())
    }

    /// Multiply every score by `rate` and drop entries that end below
    /// `threshold`, atomically with respect to concurrent increments.
    async fn apply_decay(&self, rate: f64, threshold: f64) -> Result<DecayOutcome, ScoreError>;

    /// Number of ranked items.
    async fn count(&self) -> Result<usize, ScoreError>;
}

/// Durable destination for buffered view counts.
#[async_trait]
pub trait ViewCountSink: Send + Sync {
    /// Add every count to the stored totals. Returns the number of items written.
    async fn flush(&self, counts: &HashMap<ItemId, u64>) -> Result<usize, SinkError>;
}

/// Durable "recently popular" list used when both score stores are empty.
#[async_trait]
pub trait PopularitySeed: Send + Sync {
    /// Most popular item ids, best first.
    async fn recent_popular(&self, limit: usize) -> Result<Vec<ItemId>, SinkError>;
}
