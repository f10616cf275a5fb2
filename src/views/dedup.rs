// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Short-lived "already viewed" markers.
//!
//! A marker for `(item, viewer)` is set atomically if absent and expires
//! after a TTL. Redis (`SET NX EX`) shares markers across processes; the
//! local map is used without Redis and whenever Redis errors.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;

use crate::score::ItemId;
use crate::storage::traits::ScoreError;

/// Marker key for one viewer of one item.
#[must_use]
pub fn view_key(item_id: ItemId, viewer_key: &str) -> String {
    format!("view:{item_id}:{viewer_key}")
}

#[async_trait]
pub trait ViewDedup: Send + Sync {
    /// Set the marker if it does not exist. Returns `true` when this call
    /// created it (a first view within the TTL).
    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, ScoreError>;
}

/// Process-local markers with lazy expiry.
#[derive(Default)]
pub struct LocalViewDedup {
    markers: DashMap<String, Instant>,
}

impl LocalViewDedup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous form of [`ViewDedup::mark_if_absent`].
    pub fn mark(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if *existing.get() > now {
                    false
                } else {
                    existing.insert(now + ttl);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                true
            }
        }
    }

    /// Drop expired markers. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.markers.len();
        self.markers.retain(|_, expires| *expires > now);
        before.saturating_sub(self.markers.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[async_trait]
impl ViewDedup for LocalViewDedup {
    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, ScoreError> {
        Ok(self.mark(key, ttl))
    }
}

/// Markers in Redis, shared by every process.
pub struct RedisViewDedup {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisViewDedup {
    pub fn new(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        }
    }
}

#[async_trait]
impl ViewDedup for RedisViewDedup {
    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, ScoreError> {
        let mut conn = self.connection.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(format!("{}{}", self.prefix, key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        // OK when set, nil when the key already existed
        Ok(set.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_view_key_layout() {
        assert_eq!(view_key(42, "ip:1.2.3.4"), "view:42:ip:1.2.3.4");
    }

    #[test]
    fn test_local_mark_once_within_ttl() {
        let dedup = LocalViewDedup::new();
        assert!(dedup.mark("view:1:a", Duration::from_secs(60)));
        assert!(!dedup.mark("view:1:a", Duration::from_secs(60)));
        assert!(dedup.mark("view:1:b", Duration::from_secs(60)));
    }

    #[test]
    fn test_local_mark_after_expiry() {
        let dedup = LocalViewDedup::new();
        assert!(dedup.mark("k", Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(15));
        assert!(dedup.mark("k", Duration::from_millis(5)));
    }

    #[test]
    fn test_purge_expired() {
        let dedup = LocalViewDedup::new();
        dedup.mark("short", Duration::from_millis(1));
        dedup.mark("long", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(dedup.purge_expired(), 1);
        assert_eq!(dedup.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_marks_admit_one() {
        let dedup = Arc::new(LocalViewDedup::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let dedup = Arc::clone(&dedup);
            handles.push(tokio::spawn(async move {
                dedup.mark_if_absent("view:42:ip:1.2.3.4", Duration::from_secs(60)).await.unwrap()
            }));
        }

        let mut created = 0;
        for h in handles {
            if h.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }
}
