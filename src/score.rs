// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Score data types shared by every store.
//!
//! A [`ScoreEntry`] is created lazily by the first increment for an item and
//! holds the algebraic sum of every delta applied since, scaled by decay.
//! There is no floor: negative scores are valid and observable.
//!
//! # Ordering
//!
//! All ranked reads use [`rank_order`]: score descending, ties broken by
//! ascending item id. Stores whose native tie order differs re-sort.
//!
//! ```
//! use trending_engine::{ScoreEntry, score::sort_ranked};
//!
//! let mut entries = vec![
//!     ScoreEntry::new(7, 3.0),
//!     ScoreEntry::new(2, 9.5),
//!     ScoreEntry::new(4, 3.0),
//! ];
//! sort_ranked(&mut entries);
//!
//! let ids: Vec<i64> = entries.iter().map(|e| e.item_id).collect();
//! assert_eq!(ids, vec![2, 4, 7]);
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::TrendingConfig;

/// Identifier of a rankable content item (post id).
pub type ItemId = i64;

/// One ranked item and its current score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub item_id: ItemId,
    pub score: f64,
}

impl ScoreEntry {
    #[must_use]
    pub fn new(item_id: ItemId, score: f64) -> Self {
        Self { item_id, score }
    }
}

/// Score descending, then item id ascending.
#[must_use]
pub fn rank_order(a: &ScoreEntry, b: &ScoreEntry) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.item_id.cmp(&b.item_id))
}

/// Sort entries in ranked order.
pub fn sort_ranked(entries: &mut [ScoreEntry]) {
    entries.sort_unstable_by(rank_order);
}

/// Slice a fully ranked list into one page.
#[must_use]
pub fn page(mut ranked: Vec<ScoreEntry>, offset: usize, limit: usize) -> Vec<ScoreEntry> {
    if offset >= ranked.len() || limit == 0 {
        return Vec::new();
    }
    ranked.drain(..offset);
    ranked.truncate(limit);
    ranked
}

/// Result of one decay pass over a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecayOutcome {
    /// Entries still present after the pass
    pub retained: usize,
    /// Entries dropped because their decayed score fell below the threshold
    pub removed: usize,
}

/// Application events that move an item's popularity.
///
/// Content deletion is not an event: it goes through `remove_item`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreEvent {
    View,
    Comment,
    Like,
    Unlike,
}

impl ScoreEvent {
    /// Score delta for this event under the given weights.
    #[must_use]
    pub fn weight(&self, config: &TrendingConfig) -> f64 {
        match self {
            Self::View => config.view_weight,
            Self::Comment => config.comment_weight,
            Self::Like => config.like_weight,
            Self::Unlike => -config.like_weight,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Comment => "comment",
            Self::Like => "like",
            Self::Unlike => "unlike",
        }
    }
}

impl std::fmt::Display for ScoreEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_order_breaks_ties_by_id() {
        let mut entries = vec![
            ScoreEntry::new(9, 1.0),
            ScoreEntry::new(3, 1.0),
            ScoreEntry::new(5, 4.0),
            ScoreEntry::new(1, -2.0),
        ];
        sort_ranked(&mut entries);

        let ids: Vec<ItemId> = entries.iter().map(|e| e.item_id).collect();
        assert_eq!(ids, vec![5, 3, 9, 1]);
    }

    #[test]
    fn test_page_bounds() {
        let ranked: Vec<ScoreEntry> = (1..=5).map(|i| ScoreEntry::new(i, 10.0 - i as f64)).collect();

        assert_eq!(page(ranked.clone(), 0, 2).len(), 2);
        assert_eq!(page(ranked.clone(), 3, 10).len(), 2);
        assert_eq!(page(ranked.clone(), 3, 10)[0].item_id, 4);
        assert!(page(ranked.clone(), 5, 1).is_empty());
        assert!(page(ranked, 0, 0).is_empty());
    }

    #[test]
    fn test_event_weights() {
        let config = TrendingConfig::default();
        assert_eq!(ScoreEvent::View.weight(&config), 2.0);
        assert_eq!(ScoreEvent::Comment.weight(&config), 3.0);
        assert_eq!(ScoreEvent::Like.weight(&config), 4.0);
        assert_eq!(ScoreEvent::Unlike.weight(&config), -4.0);
    }

    #[test]
    fn test_event_display_and_serde() {
        assert_eq!(format!("{}", ScoreEvent::Unlike), "unlike");
        let json = serde_json::to_string(&ScoreEvent::Comment).unwrap();
        assert_eq!(json, "\"comment\"");
    }
}
