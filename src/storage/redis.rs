// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis sorted-set backend: the primary score store.
//!
//! Layout is a single sorted set (default key `realtime:score`):
//! - **member** → item id as a decimal string
//! - **score** → Redis' native double score
//!
//! ```text
//! ZINCRBY realtime:score 4 "1017"          -- like on post 1017
//! ZREVRANGE realtime:score 0 4 WITHSCORES  -- trending page
//! ZREM realtime:score "1017"               -- post deleted
//! ```
//!
//! Decay runs as one Lua script so the read-multiply-remove sweep is atomic
//! with respect to concurrent `ZINCRBY`s: an increment lands either before
//! the sweep (and is decayed) or after it (and is not), never in between.
//!
//! Redis breaks score ties by member bytes, descending ("4" > "30" > "17"),
//! which is not id order. Ranked reads therefore fetch every member scoring
//! at least the score at the page's last rank, order them by score then
//! ascending id, and slice the page out of that.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Client, Script};
use tracing::{debug, warn};

use crate::resilience::retry::{retry, RetryConfig};
use crate::score::{sort_ranked, DecayOutcome, ItemId, ScoreEntry};
use super::traits::{ScoreError, ScoreStore};

/// Multiply every score by ARGV[1]; ZREM members that end below ARGV[2].
/// Returns `{retained, removed}`.
const DECAY_SCRIPT: &str = r"
local entries = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
local rate = tonumber(ARGV[1])
local threshold = tonumber(ARGV[2])
local retained = 0
local removed = 0
for i = 1, #entries, 2 do
    local member = entries[i]
    local score = tonumber(entries[i + 1])
    if score ~= nil then
        local decayed = score * rate
        if decayed < threshold then
            redis.call('ZREM', KEYS[1], member)
            removed = removed + 1
        else
            redis.call('ZADD', KEYS[1], string.format('%.17g', decayed), member)
            retained = retained + 1
        end
    end
end
return {retained, removed}
";

/// Everything ranked at or above rank ARGV[1], ties at that rank included.
const RANKED_SCRIPT: &str = r"
local edge = redis.call('ZREVRANGE', KEYS[1], ARGV[1], ARGV[1], 'WITHSCORES')
if #edge == 0 then
    return redis.call('ZREVRANGE', KEYS[1], 0, -1, 'WITHSCORES')
end
return redis.call('ZREVRANGEBYSCORE', KEYS[1], '+inf', edge[2], 'WITHSCORES')
";

pub struct RedisScoreStore {
    connection: ConnectionManager,
    /// Fully prefixed sorted-set key
    key: String,
    decay_script: Script,
    ranked_script: Script,
}

impl RedisScoreStore {
    /// Connect and rank under `key` without a namespace prefix.
    pub async fn new(connection_string: &str, key: &str) -> Result<Self, ScoreError> {
        Self::with_prefix(connection_string, key, None).await
    }

    /// Connect and rank under `{prefix}{key}`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use trending_engine::storage::redis::RedisScoreStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Scores live in "blog:realtime:score"
    /// let store = RedisScoreStore::with_prefix("redis://localhost", "realtime:score", Some("blog:")).await?;
    /// assert_eq!(store.key(), "blog:realtime:score");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(
        connection_string: &str,
        key: &str,
        prefix: Option<&str>,
    ) -> Result<Self, ScoreError> {
        let client = Client::open(connection_string)
            .map_err(|e| ScoreError::Backend(e.to_string()))?;

        // Fast-fail at startup so a bad URL surfaces instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| ScoreError::Backend(e.to_string()))?;

        Ok(Self::from_connection(connection, key, prefix))
    }

    /// Wrap an existing connection (shared with the view dedup markers).
    #[must_use]
    pub fn from_connection(connection: ConnectionManager, key: &str, prefix: Option<&str>) -> Self {
        Self {
            connection,
            key: format!("{}{}", prefix.unwrap_or(""), key),
            decay_script: Script::new(DECAY_SCRIPT),
            ranked_script: Script::new(RANKED_SCRIPT),
        }
    }

    /// Get a clone of the connection manager
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// The sorted-set key scores are stored under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Turn raw `WITHSCORES` pairs into ranked entries, skipping members
    /// that are not item ids or scores that are not numbers.
    fn parse_ranked(&self, raw: Vec<(String, String)>) -> Vec<ScoreEntry> {
        let mut entries = Vec::with_capacity(raw.len());
        for (member, score) in raw {
            let item_id = match member.parse::<ItemId>() {
                Ok(id) => id,
                Err(e) => {
                    let err = ScoreError::DataType {
                        key: self.key.clone(),
                        detail: format!("member '{}' is not an item id: {}", member, e),
                    };
                    warn!(error = %err, "Skipping malformed ranking entry");
                    crate::metrics::record_data_type_error("primary");
                    continue;
                }
            };
            let score = match score.parse::<f64>() {
                Ok(s) => s,
                Err(e) => {
                    let err = ScoreError::DataType {
                        key: self.key.clone(),
                        detail: format!("score '{}' of member {} is not a number: {}", score, item_id, e),
                    };
                    warn!(error = %err, "Skipping malformed ranking entry");
                    crate::metrics::record_data_type_error("primary");
                    continue;
                }
            };
            entries.push(ScoreEntry::new(item_id, score));
        }
        sort_ranked(&mut entries);
        entries
    }
}

#[async_trait]
impl ScoreStore for RedisScoreStore {
    async fn increment(&self, item_id: ItemId, delta: f64) -> Result<f64, ScoreError> {
        let mut conn = self.connection.clone();
        let score: f64 = cmd("ZINCRBY")
            .arg(&self.key)
            .arg(delta)
            .arg(item_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn top_n_with_scores(&self, offset: usize, limit: usize) -> Result<Vec<ScoreEntry>, ScoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let stop = offset + limit - 1;
        let raw: Vec<(String, String)> = self
            .ranked_script
            .key(&self.key)
            .arg(stop)
            .invoke_async(&mut conn)
            .await?;
        let ranked = self.parse_ranked(raw);
        Ok(ranked.into_iter().skip(offset).take(limit).collect())
    }

    async fn remove(&self, item_id: ItemId) -> Result<(), ScoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = cmd("ZREM")
            .arg(&self.key)
            .arg(item_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_many(&self, item_ids: &[ItemId]) -> Result<usize, ScoreError> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let members: Vec<String> = item_ids.iter().map(ToString::to_string).collect();
        let mut conn = self.connection.clone();
        let removed: i64 = cmd("ZREM")
            .arg(&self.key)
            .arg(&members)
            .query_async(&mut conn)
            .await?;
        debug!(requested = item_ids.len(), removed, "Batch removed from primary ranking");
        Ok(item_ids.len())
    }

    async fn apply_decay(&self, rate: f64, threshold: f64) -> Result<DecayOutcome, ScoreError> {
        let mut conn = self.connection.clone();
        let (retained, removed): (usize, usize) = self
            .decay_script
            .key(&self.key)
            .arg(rate)
            .arg(threshold)
            .invoke_async(&mut conn)
            .await?;
        Ok(DecayOutcome { retained, removed })
    }

    async fn count(&self) -> Result<usize, ScoreError> {
        let mut conn = self.connection.clone();
        let count: usize = cmd("ZCARD").arg(&self.key).query_async(&mut conn).await?;
        Ok(count)
    }
}
