//! # Max-Speed Cache
//!
//! Memoizes `maximum_speed_over_ground(from, to)` as
//! `from -> (to -> fix at maximum speed)`. A request is answered from the
//! entry with the latest `to' <= to` for the same `from`; the caller resolves
//! the tail `[to', to]` and keeps the larger maximum.
//!
//! Invalidation gets the time window whose estimated speeds may have changed.
//! Entries that end before the window or start after it stay. Overlapping
//! entries are dropped, and re-added cropped to end just before the window
//! when their maximum lies before it, since the maximum of the cropped
//! interval is then unchanged.

use std::collections::BTreeMap;

use crate::geo_utils::{Speed, TimePoint};

use super::Fix;

/// Maximum-speed answer: the fix where it occurs and the estimated speed there.
pub type MaxSpeed<F> = Option<(F, Speed)>;

#[derive(Debug)]
pub struct MaxSpeedCache<F> {
    entries: BTreeMap<TimePoint, BTreeMap<TimePoint, MaxSpeed<F>>>,
}

impl<F> Default for MaxSpeedCache<F> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<F: Fix> MaxSpeedCache<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `from` with the latest `to' <= to`. Only entries that
    /// match `to` exactly or cover more than the single instant `from`
    /// are returned.
    pub fn lookup(&self, from: TimePoint, to: TimePoint) -> Option<(TimePoint, MaxSpeed<F>)> {
        let (&entry_to, value) = self.entries.get(&from)?.range(..=to).next_back()?;
        if entry_to == to || entry_to > from {
            Some((entry_to, value.clone()))
        } else {
            None
        }
    }

    pub fn get(&self, from: TimePoint, to: TimePoint) -> Option<MaxSpeed<F>> {
        self.entries.get(&from)?.get(&to).cloned()
    }

    pub fn cache(&mut self, from: TimePoint, to: TimePoint, value: MaxSpeed<F>) {
        if from <= to {
            self.entries.entry(from).or_default().insert(to, value);
        }
    }

    /// Drop entries touching `[start, end]`, keeping cropped versions where
    /// the cached maximum lies before `start`.
    pub fn invalidate(&mut self, start: TimePoint, end: TimePoint) {
        let crop_to = start.minus(1);
        for (&from, tos) in self.entries.range_mut(..=end) {
            let overlapping = tos.split_off(&start);
            for value in overlapping.into_values() {
                let max_before_window = match &value {
                    Some((fix, _)) => fix.time_point() < start,
                    None => true,
                };
                if max_before_window && from <= crop_to {
                    tos.entry(crop_to).or_insert(value);
                }
            }
        }
        self.entries.retain(|_, tos| !tos.is_empty());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
