//! # Distance Cache
//!
//! Memoizes `distance_traveled(from, to)` per track. Entries are keyed by
//! `to` first: live tracking keeps asking for "from the leg start until
//! now", so `from` values are few while `to` values sweep forward. Keying by
//! `to` makes "everything at or after t" a single `split_off`.
//!
//! A lookup for `(from, to)` returns the entry with the latest `to' <= to`
//! and, within it, the earliest `from' >= from`. The caller sums
//! `distance(from, from') + cached + distance(to', to)`, so only the short
//! boundary stretches get recomputed.

use std::collections::BTreeMap;

use crate::geo_utils::{Distance, TimePoint};

/// Cached sub-interval that can be extended to answer a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedDistance {
    pub from: TimePoint,
    pub to: TimePoint,
    pub distance: Distance,
}

#[derive(Debug, Default)]
pub struct DistanceCache {
    /// to -> (from -> distance)
    entries: BTreeMap<TimePoint, BTreeMap<TimePoint, Distance>>,
}

impl DistanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best cached interval nested in `[from, to]`, see module docs.
    pub fn lookup(&self, from: TimePoint, to: TimePoint) -> Option<CachedDistance> {
        let (&entry_to, froms) = self.entries.range(..=to).next_back()?;
        let (&entry_from, &distance) = froms.range(from..).next()?;
        Some(CachedDistance {
            from: entry_from,
            to: entry_to,
            distance,
        })
    }

    /// Exact entry, if present.
    pub fn get(&self, from: TimePoint, to: TimePoint) -> Option<Distance> {
        self.entries.get(&to)?.get(&from).copied()
    }

    pub fn cache(&mut self, from: TimePoint, to: TimePoint, distance: Distance) {
        if from < to {
            self.entries.entry(to).or_default().insert(from, distance);
        }
    }

    /// Drop every entry whose `to` is at or after `t`.
    pub fn invalidate_all_at_or_later_than(&mut self, t: TimePoint) {
        drop(self.entries.split_off(&t));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached `(from, to)` pairs.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: i64) -> TimePoint {
        TimePoint::from_millis(ms)
    }

    fn d(m: f64) -> Distance {
        Distance::from_meters(m)
    }

    #[test]
    fn test_lookup_picks_latest_to_and_earliest_from() {
        let mut cache = DistanceCache::new();
        cache.cache(t(0), t(100), d(10.0));
        cache.cache(t(20), t(100), d(8.0));
        cache.cache(t(0), t(200), d(25.0));

        let hit = cache.lookup(t(10), t(150)).unwrap();
        assert_eq!(hit.to, t(100));
        assert_eq!(hit.from, t(20));
        assert_eq!(hit.distance, d(8.0));

        let exact = cache.lookup(t(0), t(200)).unwrap();
        assert_eq!((exact.from, exact.to), (t(0), t(200)));

        assert!(cache.lookup(t(0), t(50)).is_none());
        assert!(cache.lookup(t(150), t(180)).is_none());
    }

    #[test]
    fn test_invalidate_at_or_later() {
        let mut cache = DistanceCache::new();
        cache.cache(t(0), t(100), d(1.0));
        cache.cache(t(0), t(200), d(2.0));
        cache.cache(t(0), t(300), d(3.0));
        cache.invalidate_all_at_or_later_than(t(200));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(t(0), t(100)).is_some());
        assert!(cache.get(t(0), t(200)).is_none());
    }

    #[test]
    fn test_empty_intervals_not_cached() {
        let mut cache = DistanceCache::new();
        cache.cache(t(5), t(5), d(0.0));
        assert!(cache.is_empty());
    }
}
