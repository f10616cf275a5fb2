// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for durable view counts.
//!
//! The write-behind view buffer flushes into one additive counter table,
//! which doubles as the "recently popular" seed for cold starts:
//!
//! ```sql
//! CREATE TABLE item_view_counts (
//!   item_id BIGINT PRIMARY KEY,
//!   view_count BIGINT NOT NULL DEFAULT 0
//! )
//! ```
//!
//! Works on MySQL and SQLite through sqlx's `Any` driver; only the upsert
//! statement differs between the two.

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use tracing::{debug, info};

use crate::resilience::retry::{retry, RetryConfig};
use crate::score::ItemId;
use super::traits::{PopularitySeed, SinkError, ViewCountSink};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SQLITE_UPSERT: &str = "INSERT INTO item_view_counts (item_id, view_count) VALUES (?, ?) \
     ON CONFLICT(item_id) DO UPDATE SET view_count = view_count + excluded.view_count";

const MYSQL_UPSERT: &str = "INSERT INTO item_view_counts (item_id, view_count) VALUES (?, ?) \
     ON DUPLICATE KEY UPDATE view_count = view_count + VALUES(view_count)";

pub struct SqlViewStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlViewStore {
    /// Connect with startup-mode retry and create the table if missing.
    pub async fn new(connection_string: &str) -> Result<Self, SinkError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        // Every connection to an in-memory SQLite database is a new database
        let max_connections = if connection_string.contains(":memory:") { 1 } else { 10 };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(SinkError::from)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        store.init_schema().await?;
        info!(sqlite = is_sqlite, "View count store ready");
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), SinkError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS item_view_counts (
                item_id BIGINT PRIMARY KEY,
                view_count BIGINT NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stored total for one item (0 when never flushed).
    pub async fn view_count(&self, item_id: ItemId) -> Result<u64, SinkError> {
        let row = sqlx::query("SELECT view_count FROM item_view_counts WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let count: i64 = row.try_get("view_count")?;
                Ok(count.max(0) as u64)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl ViewCountSink for SqlViewStore {
    async fn flush(&self, counts: &HashMap<ItemId, u64>) -> Result<usize, SinkError> {
        if counts.is_empty() {
            return Ok(0);
        }
        let upsert = if self.is_sqlite { SQLITE_UPSERT } else { MYSQL_UPSERT };

        // One transaction: a failed flush leaves no partial batch behind
        let mut tx = self.pool.begin().await?;
        for (item_id, count) in counts {
            sqlx::query(upsert)
                .bind(*item_id)
                .bind(i64::try_from(*count).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(items = counts.len(), "View counts flushed to SQL");
        Ok(counts.len())
    }
}

#[async_trait]
impl PopularitySeed for SqlViewStore {
    async fn recent_popular(&self, limit: usize) -> Result<Vec<ItemId>, SinkError> {
        let rows = sqlx::query(
            "SELECT item_id FROM item_view_counts WHERE view_count > 0 \
             ORDER BY view_count DESC, item_id ASC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get::<i64, _>("item_id")?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqlViewStore {
        SqlViewStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_flush_is_additive() {
        let store = memory_store().await;

        let first: HashMap<ItemId, u64> = [(1, 3), (2, 1)].into_iter().collect();
        let second: HashMap<ItemId, u64> = [(1, 2)].into_iter().collect();

        assert_eq!(store.flush(&first).await.unwrap(), 2);
        assert_eq!(store.flush(&second).await.unwrap(), 1);

        assert_eq!(store.view_count(1).await.unwrap(), 5);
        assert_eq!(store.view_count(2).await.unwrap(), 1);
        assert_eq!(store.view_count(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let store = memory_store().await;
        assert_eq!(store.flush(&HashMap::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recent_popular_orders_by_views() {
        let store = memory_store().await;
        let counts: HashMap<ItemId, u64> = [(10, 5), (11, 50), (12, 5), (13, 1)].into_iter().collect();
        store.flush(&counts).await.unwrap();

        let ids = store.recent_popular(3).await.unwrap();
        assert_eq!(ids, vec![11, 10, 12]);
    }
}
