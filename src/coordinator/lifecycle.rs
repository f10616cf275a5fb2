// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: startup, cold-start bootstrap and shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{Components, EngineError, EngineState, TrendingEngine};
use crate::gate::BreakerScoreStore;
use crate::score::ScoreEntry;
use crate::storage::memory::InMemoryScoreStore;
use crate::storage::redis::RedisScoreStore;
use crate::storage::sql::SqlViewStore;
use crate::storage::traits::{PopularitySeed, ScoreStore, ViewCountSink};
use crate::tasks::decay::DecayScheduler;
use crate::tasks::reconcile::{ReconciliationManager, WarmUpRun};
use crate::tasks::spawn_periodic;
use crate::tasks::view_flush::ViewFlusher;
use crate::views::dedup::{RedisViewDedup, ViewDedup};
use crate::views::ViewBuffer;

impl TrendingEngine {
    /// Connect backends, bootstrap the fallback cache and start the
    /// background tasks.
    ///
    /// Redis and SQL are only contacted when configured and not replaced by
    /// an injected collaborator. A configured backend that cannot be reached
    /// (after startup retries) fails the start.
    #[tracing::instrument(skip(self), fields(has_redis, has_sql))]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.state() != EngineState::Created {
            warn!(state = %self.state(), "Engine already started");
            return Ok(());
        }
        let startup = Instant::now();
        info!("Starting trending engine...");
        self.set_state(EngineState::Connecting);

        // Primary score store
        let phase = Instant::now();
        let (primary, primary_backend): (Arc<dyn ScoreStore>, &'static str) =
            match (self.injected_primary.clone(), self.config.redis_url.clone()) {
                (Some(primary), _) => {
                    info!("Using injected primary score store");
                    (primary, "custom")
                }
                (None, Some(url)) => {
                    info!(key = %self.config.redis_key, prefix = ?self.config.redis_prefix, "Connecting to Redis (primary)...");
                    let store = RedisScoreStore::with_prefix(
                        &url,
                        &self.config.redis_key,
                        self.config.redis_prefix.as_deref(),
                    )
                    .await?;
                    let store = Arc::new(store);
                    self.redis_store = Some(Arc::clone(&store));
                    info!("Redis (primary) connected");
                    (store, "redis")
                }
                (None, None) => {
                    warn!("No Redis URL configured - ranking is process-local only");
                    (Arc::new(InMemoryScoreStore::new()), "memory")
                }
            };
        tracing::Span::current().record("has_redis", self.redis_store.is_some());

        // Durable view counts and cold-start seed
        if let Some(url) = self.config.sql_url.clone() {
            if self.view_sink.is_none() || self.seed.is_none() {
                info!("Connecting to SQL (view counts)...");
                let sql = Arc::new(SqlViewStore::new(&url).await?);
                self.sql_store = Some(Arc::clone(&sql));
                if self.view_sink.is_none() {
                    self.view_sink = Some(Arc::clone(&sql) as Arc<dyn ViewCountSink>);
                }
                if self.seed.is_none() {
                    self.seed = Some(sql as Arc<dyn PopularitySeed>);
                }
                info!("SQL (view counts) connected");
            }
        }
        tracing::Span::current().record("has_sql", self.sql_store.is_some());

        if self.view_dedup.is_none() {
            if let Some(redis) = &self.redis_store {
                self.view_dedup = Some(Arc::new(RedisViewDedup::new(
                    redis.connection(),
                    self.config.redis_prefix.as_deref(),
                )) as Arc<dyn ViewDedup>);
            }
        }
        crate::metrics::record_startup_phase("connect", phase.elapsed());

        // Components
        self.set_state(EngineState::Bootstrapping);
        let phase = Instant::now();
        let components = self.build_components(primary, primary_backend)?;
        self.bootstrap(&components).await;
        crate::metrics::record_startup_phase("bootstrap", phase.elapsed());

        self.spawn_tasks(&components);
        self.components = Some(components);
        self.set_state(EngineState::Running);

        info!(
            elapsed_ms = startup.elapsed().as_millis() as u64,
            backend = primary_backend,
            fallback_items = self.fallback.size(),
            "Trending engine running"
        );
        Ok(())
    }

    fn build_components(
        &self,
        primary: Arc<dyn ScoreStore>,
        primary_backend: &'static str,
    ) -> Result<Components, EngineError> {
        let config = &self.config;
        let gate = Arc::new(BreakerScoreStore::new(
            Arc::clone(&primary),
            Arc::clone(&self.fallback),
            config.circuit_config(),
        ));

        let mut views = ViewBuffer::new(
            Arc::clone(&gate) as Arc<dyn ScoreStore>,
            config.view_weight,
            config.view_dedup_ttl(),
        );
        if let Some(dedup) = &self.view_dedup {
            views = views.with_dedup(Arc::clone(dedup));
        }
        let views = Arc::new(views);

        let decay = Arc::new(DecayScheduler::new(
            primary,
            Arc::clone(&self.fallback),
            gate.subscribe_state(),
            config.decay_rate,
            config.decay_threshold,
            config.decay_interval(),
            Duration::from_millis(config.decay_timeout_ms),
        )?);

        let reconciler = Arc::new(ReconciliationManager::new(
            Arc::clone(&gate),
            config.warm_up_size,
            config.warm_up_interval(),
        ));

        let flusher = self.view_sink.as_ref().map(|sink| {
            Arc::new(ViewFlusher::new(
                Arc::clone(&views),
                Arc::clone(sink),
                config.view_flush_interval(),
            ))
        });

        Ok(Components {
            gate,
            views,
            decay,
            reconciler,
            flusher,
            primary_backend,
        })
    }

    /// Fill an empty fallback: from the primary if it has data, otherwise
    /// from the popularity seed. Failures leave the fallback empty.
    #[tracing::instrument(skip(self, components))]
    async fn bootstrap(&self, components: &Components) {
        if self.fallback.has_data() {
            return;
        }

        match components.reconciler.warm_up_once().await {
            WarmUpRun::Warmed(written) => {
                info!(written, "Fallback warmed from primary");
                return;
            }
            WarmUpRun::Empty => debug!("Primary is empty"),
            other => warn!(result = ?other, "Initial warm-up did not complete"),
        }

        let Some(seed) = &self.seed else {
            debug!("No popularity seed configured, starting cold");
            return;
        };
        match seed.recent_popular(self.config.seed_size).await {
            Ok(ids) if !ids.is_empty() => {
                let written = self.fallback.warm_up(&seed_entries(&ids));
                info!(written, "Fallback seeded from recently popular items");
            }
            Ok(_) => debug!("Popularity seed is empty, starting cold"),
            Err(e) => warn!(error = %e, "Failed to load popularity seed, starting cold"),
        }
    }

    fn spawn_tasks(&self, components: &Components) {
        self.tasks.push("decay", Arc::clone(&components.decay).spawn());
        self.tasks.push("warm_up", Arc::clone(&components.reconciler).spawn_warm_up());
        self.tasks.push("recovery_replay", Arc::clone(&components.reconciler).spawn_recovery_listener());

        match &components.flusher {
            Some(flusher) => self.tasks.push("view_flush", Arc::clone(flusher).spawn()),
            None => {
                warn!("No view count sink configured - view counts accumulate until taken with take_view_counts");
                // Nobody drains the counts; still expire local markers
                let views = Arc::clone(&components.views);
                let handle = spawn_periodic("view_marker_purge", self.config.view_dedup_ttl(), move || {
                    let views = Arc::clone(&views);
                    async move {
                        views.purge_expired_markers();
                    }
                });
                self.tasks.push("view_marker_purge", handle);
            }
        }
        debug!(tasks = self.tasks.len(), "Background tasks started");
    }

    /// Stop background tasks and flush buffered view counts once more.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        if self.state() == EngineState::ShuttingDown {
            return;
        }
        info!("Initiating trending engine shutdown...");
        self.set_state(EngineState::ShuttingDown);
        self.tasks.abort_all();

        if let Some(flusher) = self.components.as_ref().and_then(|c| c.flusher.as_ref()) {
            let run = flusher.flush_once().await;
            info!(result = ?run, "Final view count flush");
        }

        info!(
            fallback_items = self.fallback.size(),
            pending_deletions = self.fallback.deletion_log_len(),
            "Trending engine shutdown complete"
        );
    }
}

/// Rank-derived scores for seed ids (best first): `n - i`.
fn seed_entries(ids: &[crate::score::ItemId]) -> Vec<ScoreEntry> {
    let n = ids.len();
    ids.iter()
        .enumerate()
        .map(|(i, id)| ScoreEntry::new(*id, (n - i) as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_entries_keep_rank() {
        let entries = seed_entries(&[30, 10, 20]);
        assert_eq!(
            entries,
            vec![ScoreEntry::new(30, 3.0), ScoreEntry::new(10, 2.0), ScoreEntry::new(20, 1.0)]
        );
    }
}
