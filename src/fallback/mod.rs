// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local fallback score cache.
//!
//! Serves every score read and write while the primary store's circuit is
//! not closed, and is kept warm from the primary while it is healthy.
//!
//! # State
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  entries: DashMap<ItemId, Slot { score, touched }>          │
//! │  └─ bounded by max_size, oldest-touched evicted in batches  │
//! │  └─ rankings only list score > 0                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  deletion_log: DashSet<ItemId>                              │
//! │  └─ every remove_item() while the primary is unreachable    │
//! │  └─ replayed into the primary on recovery, then acked       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cache is lost on restart; it re-warms from the primary once healthy.
//! Scores are never merged back into the primary: events seen only here
//! during an outage are an accepted loss.

pub mod eviction;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::score::{page, sort_ranked, DecayOutcome, ItemId, ScoreEntry};
use eviction::{eviction_batch, select_victims};

#[derive(Debug, Clone, Copy)]
struct Slot {
    score: f64,
    /// Logical time of the last write
    touched: u64,
}

pub struct FallbackStore {
    entries: DashMap<ItemId, Slot>,
    deletion_log: DashSet<ItemId>,
    max_size: usize,
    clock: AtomicU64,
    evictions: AtomicU64,
    evicting: AtomicBool,
}

impl FallbackStore {
    /// Create an empty cache holding at most `max_size` items.
    pub fn new(max_size: usize) -> Result<Self, ConfigError> {
        if max_size == 0 {
            return Err(ConfigError::NonPositive { field: "fallback_max_size" });
        }
        Ok(Self {
            entries: DashMap::new(),
            deletion_log: DashSet::new(),
            max_size,
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            evicting: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `delta` to the item's score, creating it if absent.
    /// Returns the new score.
    pub fn increment_score(&self, item_id: ItemId, delta: f64) -> f64 {
        let touched = self.tick();
        let score = {
            let mut slot = self
                .entries
                .entry(item_id)
                .or_insert(Slot { score: 0.0, touched });
            slot.score += delta;
            slot.touched = touched;
            slot.score
        };
        self.evict_if_over_capacity();
        score
    }

    /// Ranked ids with score > 0.
    #[must_use]
    pub fn get_top_n(&self, offset: usize, limit: usize) -> Vec<ItemId> {
        self.get_top_n_with_scores(offset, limit)
            .into_iter()
            .map(|e| e.item_id)
            .collect()
    }

    /// Ranked entries with score > 0.
    #[must_use]
    pub fn get_top_n_with_scores(&self, offset: usize, limit: usize) -> Vec<ScoreEntry> {
        let mut ranked: Vec<ScoreEntry> = self
            .entries
            .iter()
            .filter(|r| r.value().score > 0.0)
            .map(|r| ScoreEntry::new(*r.key(), r.value().score))
            .collect();
        sort_ranked(&mut ranked);
        page(ranked, offset, limit)
    }

    /// Current score of one item, if cached.
    #[must_use]
    pub fn score(&self, item_id: ItemId) -> Option<f64> {
        self.entries.get(&item_id).map(|r| r.value().score)
    }

    /// Multiply every score by `rate`, dropping entries that end below
    /// `threshold`. Each key is updated under its shard lock, so concurrent
    /// increments land either before or after the multiply, never lost.
    pub fn apply_decay(&self, rate: f64, threshold: f64) -> DecayOutcome {
        let mut removed = 0;
        self.entries.retain(|_, slot| {
            slot.score *= rate;
            let keep = slot.score >= threshold;
            if !keep {
                removed += 1;
            }
            keep
        });
        let outcome = DecayOutcome {
            retained: self.entries.len(),
            removed,
        };
        crate::metrics::set_fallback_entries(outcome.retained);
        outcome
    }

    /// Delete the item and log it for replay into the primary.
    pub fn remove_item(&self, item_id: ItemId) {
        // Log before removing so a concurrent warm_up re-check sees it
        self.deletion_log.insert(item_id);
        self.entries.remove(&item_id);
        crate::metrics::set_deletion_log_size(self.deletion_log.len());
        debug!(item_id, "Item removed from fallback, logged for replay");
    }

    /// Delete the item without logging it (the primary already has it gone).
    pub fn discard(&self, item_id: ItemId) {
        self.entries.remove(&item_id);
    }

    /// Upsert a snapshot of primary scores. Items absent from the snapshot
    /// are left alone; items pending deletion are skipped so a stale primary
    /// cannot bring them back. Returns the number of entries written.
    pub fn warm_up(&self, snapshot: &[ScoreEntry]) -> usize {
        let mut written = 0;
        for entry in snapshot {
            if self.deletion_log.contains(&entry.item_id) {
                continue;
            }
            let touched = self.tick();
            self.entries.insert(
                entry.item_id,
                Slot {
                    score: entry.score,
                    touched,
                },
            );
            // A removal may have landed between the check and the insert
            if self.deletion_log.contains(&entry.item_id) {
                self.entries.remove(&entry.item_id);
                continue;
            }
            written += 1;
        }
        self.evict_if_over_capacity();
        crate::metrics::set_fallback_entries(self.entries.len());
        written
    }

    /// Pending removals, ascending by id.
    #[must_use]
    pub fn get_deletion_log(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.deletion_log.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear_deletion_log(&self) {
        self.deletion_log.clear();
        crate::metrics::set_deletion_log_size(0);
    }

    /// Drop only the given ids from the log. Removals logged after the
    /// replay read its snapshot stay pending.
    pub fn acknowledge_deletions(&self, item_ids: &[ItemId]) {
        for item_id in item_ids {
            self.deletion_log.remove(item_id);
        }
        crate::metrics::set_deletion_log_size(self.deletion_log.len());
    }

    #[must_use]
    pub fn deletion_log_len(&self) -> usize {
        self.deletion_log.len()
    }

    /// Number of cached items (including non-positive scores).
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Reset scores and the deletion log.
    pub fn clear(&self) {
        self.entries.clear();
        self.deletion_log.clear();
        crate::metrics::set_fallback_entries(0);
        crate::metrics::set_deletion_log_size(0);
    }

    /// Total entries evicted for capacity.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn evict_if_over_capacity(&self) {
        if self.entries.len() <= self.max_size {
            return;
        }
        // One evictor at a time; others overshoot briefly and move on
        if self.evicting.swap(true, Ordering::AcqRel) {
            return;
        }

        let overflow = self.entries.len().saturating_sub(self.max_size);
        if overflow > 0 {
            let mut stamps: Vec<(ItemId, u64)> = self
                .entries
                .iter()
                .map(|r| (*r.key(), r.value().touched))
                .collect();
            let count = overflow.max(eviction_batch(self.max_size));
            let victims = select_victims(&mut stamps, count);

            let mut evicted = 0;
            for item_id in &victims {
                if self.entries.remove(item_id).is_some() {
                    evicted += 1;
                }
            }
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_evictions(evicted);
            crate::metrics::set_fallback_entries(self.entries.len());
            info!(evicted, remaining = self.entries.len(), "Fallback cache over capacity, evicted oldest entries");
        }

        self.evicting.store(false, Ordering::Release);
    }
}
