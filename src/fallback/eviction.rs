// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capacity eviction for the fallback cache.
//!
//! Every slot carries a logical touch stamp taken from a process-wide
//! counter on each write. When the cache overflows, the entries with the
//! oldest stamps go first. Victims are chosen in batches so the O(n) scan
//! runs once per ~1% of capacity rather than on every insert.

use crate::score::ItemId;

/// Entries evicted per overflow: 1% of capacity, at least one.
#[must_use]
pub fn eviction_batch(max_size: usize) -> usize {
    (max_size / 100).max(1)
}

/// Pick the `count` least-recently-touched items.
///
/// Stamps are unique in practice; equal stamps fall back to item id so the
/// choice is deterministic.
#[must_use]
pub fn select_victims(stamps: &mut [(ItemId, u64)], count: usize) -> Vec<ItemId> {
    if count == 0 || stamps.is_empty() {
        return Vec::new();
    }
    let key = |e: &(ItemId, u64)| (e.1, e.0);
    if count < stamps.len() {
        stamps.select_nth_unstable_by_key(count - 1, key);
    }
    let take = count.min(stamps.len());
    stamps[..take].iter().map(|(id, _)| *id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size() {
        assert_eq!(eviction_batch(10_000), 100);
        assert_eq!(eviction_batch(250), 2);
        assert_eq!(eviction_batch(50), 1);
        assert_eq!(eviction_batch(1), 1);
    }

    #[test]
    fn test_select_oldest() {
        let mut stamps = vec![(1, 40), (2, 10), (3, 30), (4, 20), (5, 50)];

        let mut victims = select_victims(&mut stamps, 2);
        victims.sort_unstable();

        assert_eq!(victims, vec![2, 4]);
    }

    #[test]
    fn test_select_more_than_available() {
        let mut stamps = vec![(7, 3), (8, 1)];
        let mut victims = select_victims(&mut stamps, 5);
        victims.sort_unstable();
        assert_eq!(victims, vec![7, 8]);
    }

    #[test]
    fn test_select_none() {
        let mut stamps = vec![(1, 1)];
        assert!(select_victims(&mut stamps, 0).is_empty());
        assert!(select_victims(&mut [], 3).is_empty());
    }
}
