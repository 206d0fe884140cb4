//! # Tracks
//!
//! Time-ordered fix store for one tracked entity (competitor, mark, wind
//! sensor) with a smoothed view, estimated position and speed at arbitrary
//! times, distance traveled and maximum speed.
//!
//! ## Storage
//!
//! Fixes live in an arena (`Vec<F>`) indexed by an ordered set of
//! `(time point, arena index)`. The arena index doubles as insertion order,
//! so fixes sharing a time point keep the order they arrived in. Validity
//! (the outlier filter) is memoized in a side table of atomics parallel to
//! the arena, so read-locked queries can fill it in lazily.
//!
//! ## Locking
//!
//! One `RwLock` per track guards the fixes. Queries hold the read lock for
//! their whole traversal, including cache reads. `add` holds the write lock
//! while it invalidates the caches, so no reader can observe a cache entry
//! older than the fixes it sees. Caches sit behind their own mutexes that
//! are only ever taken while the fix lock is held, never the other way round.
//! Internal computations go through [`TrackView`], which works on an already
//! acquired guard; nothing re-enters the lock.

pub mod distance_cache;
mod fix;
pub mod max_speed_cache;

pub use distance_cache::{CachedDistance, DistanceCache};
pub use fix::{Fix, GpsFix, GpsFixMoving};
pub use max_speed_cache::{MaxSpeed, MaxSpeedCache};

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::confidence::{
    average_speed_with_bearing, ExponentialTimeWeigher, SpeedSample, Weigher, WithConfidence,
};
use crate::geo_utils::{Distance, Position, Speed, SpeedWithBearing, TimePoint};
use crate::listeners::{GpsTrackListener, Listeners};
use crate::sync;

/// Base confidence of a single fix-derived speed sample
pub const DEFAULT_FIX_CONFIDENCE: f64 = 0.9;

/// Floor of the exponential weigher used for speed estimation
pub const MIN_SPEED_WEIGHT: f64 = 1e-8;

const VALIDITY_UNKNOWN: u8 = 0;
const VALIDITY_VALID: u8 = 1;
const VALIDITY_INVALID: u8 = 2;

type FixKey = (TimePoint, usize);

// ============================================================================
// Configuration and statistics
// ============================================================================

/// Smoothing and averaging parameters of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Width of the speed averaging window. Half of it on each side of a
    /// query time contributes to an estimate; validity checks look at
    /// neighbours within the full window.
    pub millis_over_which_to_average_speed: i64,
    /// Fixes that can only be reached from all of their in-window neighbours
    /// faster than this are outliers. `None` disables smoothing.
    pub max_speed_for_smoothing: Option<Speed>,
    /// A pair of moving fixes is implausible when the inferred speed exceeds
    /// this factor times the larger measured speed.
    pub speed_disagreement_factor: f64,
    /// Inferred speeds below this never count as disagreeing.
    pub min_speed_for_disagreement_check: Speed,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            millis_over_which_to_average_speed: 5000,
            max_speed_for_smoothing: Some(Speed::from_knots(50.0)),
            speed_disagreement_factor: 2.0,
            min_speed_for_disagreement_check: Speed::from_knots(2.0),
        }
    }
}

/// Cache effectiveness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackStats {
    pub fix_count: usize,
    pub distance_cache_entries: usize,
    pub distance_cache_hits: u64,
    /// Walks over the smoothed fixes done by distance computations
    pub distance_iterations: u64,
    pub max_speed_cache_entries: usize,
    pub max_speed_cache_hits: u64,
    pub max_speed_computations: u64,
    pub speed_cache_hits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    distance_cache_hits: AtomicU64,
    distance_iterations: AtomicU64,
    max_speed_cache_hits: AtomicU64,
    max_speed_computations: AtomicU64,
    speed_cache_hits: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Closed time interval whose derived values may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvalidationWindow {
    pub start: TimePoint,
    pub end: TimePoint,
}

impl InvalidationWindow {
    pub fn union(self, other: InvalidationWindow) -> InvalidationWindow {
        InvalidationWindow {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn contains(&self, t: TimePoint) -> bool {
        self.start <= t && t <= self.end
    }
}

// ============================================================================
// Storage
// ============================================================================

struct FixStore<F> {
    fixes: Vec<F>,
    order: BTreeSet<FixKey>,
    validity: Vec<AtomicU8>,
    config: TrackConfig,
}

impl<F: Fix> FixStore<F> {
    fn new(config: TrackConfig) -> Self {
        Self {
            fixes: Vec::new(),
            order: BTreeSet::new(),
            validity: Vec::new(),
            config,
        }
    }

    fn reset_validity(&self) {
        for v in &self.validity {
            v.store(VALIDITY_UNKNOWN, Ordering::Release);
        }
    }
}

type SpeedCache = BTreeMap<TimePoint, Option<WithConfidence<SpeedWithBearing>>>;

// ============================================================================
// Track
// ============================================================================

pub struct Track<F: Fix> {
    name: String,
    store: RwLock<FixStore<F>>,
    speed_cache: Mutex<SpeedCache>,
    distance_cache: Mutex<DistanceCache>,
    max_speed_cache: Mutex<MaxSpeedCache<F>>,
    listeners: Listeners<dyn GpsTrackListener<F>>,
    counters: Counters,
}

impl<F: Fix> Track<F> {
    pub fn new(name: impl Into<String>, config: TrackConfig) -> Self {
        Self {
            name: name.into(),
            store: RwLock::new(FixStore::new(config)),
            speed_cache: Mutex::new(BTreeMap::new()),
            distance_cache: Mutex::new(DistanceCache::new()),
            max_speed_cache: Mutex::new(MaxSpeedCache::new()),
            listeners: Listeners::new("Track"),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> TrackConfig {
        sync::read(&self.store).config.clone()
    }

    pub fn millis_over_which_to_average_speed(&self) -> i64 {
        sync::read(&self.store).config.millis_over_which_to_average_speed
    }

    pub fn add_listener(&self, listener: Arc<dyn GpsTrackListener<F>>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn GpsTrackListener<F>>) -> bool {
        self.listeners.remove(listener)
    }

    /// Run `f` against a consistent snapshot of the track.
    fn with_view<R>(&self, f: impl FnOnce(TrackView<'_, F>) -> R) -> R {
        let store = sync::read(&self.store);
        f(TrackView {
            store: &store,
            track: self,
        })
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Insert a fix. Returns `false` if an identical fix is already present.
    pub fn add(&self, fix: F) -> bool {
        let first_fix = {
            let mut store = sync::write(&self.store);
            let t = fix.time_point();
            let duplicate = store
                .order
                .range((t, 0)..=(t, usize::MAX))
                .any(|&(_, i)| store.fixes[i] == fix);
            if duplicate {
                return false;
            }

            // Validity of neighbours within the averaging window depends on
            // the new fix. Remember what was known so flips can be detected.
            let window = store.config.millis_over_which_to_average_speed;
            let previously_known: Vec<(usize, u8)> = store
                .order
                .range((t.minus(window), 0)..=(t.plus(window), usize::MAX))
                .map(|&(_, i)| (i, store.validity[i].swap(VALIDITY_UNKNOWN, Ordering::AcqRel)))
                .filter(|&(_, was)| was != VALIDITY_UNKNOWN)
                .collect();

            let idx = store.fixes.len();
            let first_fix = idx == 0;
            store.fixes.push(fix.clone());
            store.validity.push(AtomicU8::new(VALIDITY_UNKNOWN));
            store.order.insert((t, idx));

            let view = TrackView {
                store: &store,
                track: self,
            };
            let mut window = view.zone_of_influence(idx);
            for (i, was) in previously_known {
                if view.is_valid(i) != (was == VALIDITY_VALID) {
                    window = window.union(view.zone_of_influence(i));
                }
            }
            self.invalidate(window);
            debug!(
                "[Track] {}: fix at {} invalidates {} .. {}",
                self.name, t, window.start, window.end
            );
            first_fix
        };

        self.listeners
            .notify(|l| l.fix_received(&fix, &self.name, first_fix));
        true
    }

    /// Change the speed averaging window. All derived values depend on it,
    /// so every cache is cleared.
    pub fn set_millis_over_which_to_average_speed(&self, millis: i64) {
        let old = {
            let mut store = sync::write(&self.store);
            let old = store.config.millis_over_which_to_average_speed;
            if old == millis {
                return;
            }
            store.config.millis_over_which_to_average_speed = millis;
            store.reset_validity();
            self.clear_caches();
            old
        };
        self.listeners
            .notify(|l| l.speed_averaging_changed(old, millis));
    }

    fn invalidate(&self, window: InvalidationWindow) {
        sync::lock(&self.speed_cache).retain(|t, _| !window.contains(*t));
        sync::lock(&self.distance_cache).invalidate_all_at_or_later_than(window.start);
        sync::lock(&self.max_speed_cache).invalidate(window.start, window.end);
    }

    /// Drop all derived values. They are recomputed on demand.
    pub fn clear_caches(&self) {
        sync::lock(&self.speed_cache).clear();
        sync::lock(&self.distance_cache).clear();
        sync::lock(&self.max_speed_cache).clear();
    }

    // ------------------------------------------------------------------------
    // Fix access
    // ------------------------------------------------------------------------

    pub fn len(&self) -> usize {
        sync::read(&self.store).fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All fixes in time order, outliers included.
    pub fn raw_fixes(&self) -> Vec<F> {
        self.with_view(|v| v.raw_at_or_after(TimePoint::MIN).map(|i| v.fix(i).clone()).collect())
    }

    /// Smoothed fixes in time order.
    pub fn fixes(&self) -> Vec<F> {
        self.fixes_between(TimePoint::MIN, TimePoint::MAX)
    }

    /// Smoothed fixes with `from <= t <= to`.
    pub fn fixes_between(&self, from: TimePoint, to: TimePoint) -> Vec<F> {
        self.with_view(|v| {
            v.valid_at_or_after(from)
                .map(|i| v.fix(i))
                .take_while(|f| f.time_point() <= to)
                .cloned()
                .collect()
        })
    }

    pub fn first_raw_fix(&self) -> Option<F> {
        self.with_view(|v| v.raw_at_or_after(TimePoint::MIN).next().map(|i| v.fix(i).clone()))
    }

    pub fn last_raw_fix(&self) -> Option<F> {
        self.with_view(|v| v.raw_at_or_before(TimePoint::MAX).next().map(|i| v.fix(i).clone()))
    }

    /// Latest smoothed fix at or before `t`.
    pub fn last_fix_at_or_before(&self, t: TimePoint) -> Option<F> {
        self.with_view(|v| v.valid_at_or_before(t).next().map(|i| v.fix(i).clone()))
    }

    /// Earliest smoothed fix at or after `t`.
    pub fn first_fix_at_or_after(&self, t: TimePoint) -> Option<F> {
        self.with_view(|v| v.valid_at_or_after(t).next().map(|i| v.fix(i).clone()))
    }

    // ------------------------------------------------------------------------
    // Estimation
    // ------------------------------------------------------------------------

    /// Position at `t`, interpolated along the great circle between the
    /// surrounding smoothed fixes. Before the first fix this is the first
    /// fix's position. After the last fix it is `None` unless `extrapolate`
    /// is set, in which case the estimated speed at the last fix is used.
    pub fn estimated_position(&self, t: TimePoint, extrapolate: bool) -> Option<Position> {
        self.with_view(|v| v.estimated_position(t, extrapolate))
    }

    /// Like [`Self::estimated_position`] without extrapolation, but falling
    /// back to the last smoothed fix at or before `t`.
    pub fn last_known_position(&self, t: TimePoint) -> Option<Position> {
        self.with_view(|v| v.last_known_position(t))
    }

    pub fn estimated_speed(&self, t: TimePoint) -> Option<SpeedWithBearing> {
        self.estimated_speed_with_confidence(t).map(|s| s.value)
    }

    /// Speed estimate using the track's exponential weigher, cached when a
    /// fix sits exactly at `t`.
    pub fn estimated_speed_with_confidence(
        &self,
        t: TimePoint,
    ) -> Option<WithConfidence<SpeedWithBearing>> {
        self.with_view(|v| v.estimated_speed(t))
    }

    /// Uncached speed estimate with a caller-chosen weigher.
    pub fn estimated_speed_with_weigher<W: Weigher<TimePoint>>(
        &self,
        t: TimePoint,
        weigher: &W,
    ) -> Option<WithConfidence<SpeedWithBearing>> {
        self.with_view(|v| v.estimated_speed_with(t, weigher))
    }

    /// Distance sailed between two instants along the smoothed fixes.
    pub fn distance_traveled(&self, from: TimePoint, to: TimePoint) -> Distance {
        self.with_view(|v| v.distance(from, to))
    }

    /// Uncached sum over consecutive raw fixes in `[from, to]`.
    pub fn raw_distance_traveled(&self, from: TimePoint, to: TimePoint) -> Distance {
        self.with_view(|v| {
            let mut total = Distance::ZERO;
            let mut previous: Option<Position> = None;
            for f in v
                .raw_at_or_after(from)
                .map(|i| v.fix(i))
                .take_while(|f| f.time_point() <= to)
            {
                if let Some(p) = previous {
                    total += p.distance_to(f.position());
                }
                previous = Some(f.position());
            }
            total
        })
    }

    /// Smoothed fix in `[from, to]` with the highest estimated speed.
    pub fn maximum_speed_over_ground(&self, from: TimePoint, to: TimePoint) -> MaxSpeed<F> {
        self.with_view(|v| v.max_speed(from, to))
    }

    /// Whether the estimated course changes by more than `min_degrees`
    /// within one averaging window around `at`.
    pub fn has_direction_change(&self, at: TimePoint, min_degrees: f64) -> bool {
        self.with_view(|v| {
            let window = v.averaging_millis();
            let step = (window / 2).max(1000);
            let Some(reference) = v.estimated_speed(at.minus(window)) else {
                return false;
            };
            let mut t = at.minus(window).plus(step);
            while t <= at.plus(window) {
                if let Some(s) = v.estimated_speed(t) {
                    if reference.value.bearing.difference_to(s.value.bearing).abs() > min_degrees {
                        return true;
                    }
                }
                t = t.plus(step);
            }
            false
        })
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> TrackStats {
        TrackStats {
            fix_count: self.len(),
            distance_cache_entries: sync::lock(&self.distance_cache).len(),
            distance_cache_hits: self.counters.distance_cache_hits.load(Ordering::Relaxed),
            distance_iterations: self.counters.distance_iterations.load(Ordering::Relaxed),
            max_speed_cache_entries: sync::lock(&self.max_speed_cache).len(),
            max_speed_cache_hits: self.counters.max_speed_cache_hits.load(Ordering::Relaxed),
            max_speed_computations: self.counters.max_speed_computations.load(Ordering::Relaxed),
            speed_cache_hits: self.counters.speed_cache_hits.load(Ordering::Relaxed),
        }
    }

    pub fn is_distance_cached(&self, from: TimePoint, to: TimePoint) -> bool {
        sync::lock(&self.distance_cache).get(from, to).is_some()
    }

    pub fn is_max_speed_cached(&self, from: TimePoint, to: TimePoint) -> bool {
        sync::lock(&self.max_speed_cache).get(from, to).is_some()
    }
}

// ============================================================================
// Unlocked computations
// ============================================================================

/// Read access to a track whose fix lock is already held.
struct TrackView<'a, F: Fix> {
    store: &'a FixStore<F>,
    track: &'a Track<F>,
}

impl<F: Fix> Clone for TrackView<'_, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: Fix> Copy for TrackView<'_, F> {}

impl<'a, F: Fix> TrackView<'a, F> {
    fn fix(&self, idx: usize) -> &'a F {
        &self.store.fixes[idx]
    }

    fn averaging_millis(&self) -> i64 {
        self.store.config.millis_over_which_to_average_speed
    }

    // ------------------------------------------------------------------------
    // Ordered traversal
    // ------------------------------------------------------------------------

    fn raw_at_or_after(&self, t: TimePoint) -> impl Iterator<Item = usize> + 'a {
        let store = self.store;
        store.order.range((t, 0)..).map(|&(_, i)| i)
    }

    fn raw_after(&self, t: TimePoint) -> impl Iterator<Item = usize> + 'a {
        let store = self.store;
        store
            .order
            .range((Excluded((t, usize::MAX)), Unbounded))
            .map(|&(_, i)| i)
    }

    fn raw_at_or_before(&self, t: TimePoint) -> impl Iterator<Item = usize> + 'a {
        let store = self.store;
        store.order.range(..=(t, usize::MAX)).rev().map(|&(_, i)| i)
    }

    fn raw_before(&self, t: TimePoint) -> impl Iterator<Item = usize> + 'a {
        let store = self.store;
        store.order.range(..(t, 0)).rev().map(|&(_, i)| i)
    }

    fn valid_at_or_after(&self, t: TimePoint) -> impl Iterator<Item = usize> + 'a {
        let view = *self;
        self.raw_at_or_after(t).filter(move |&i| view.is_valid(i))
    }

    fn valid_after(&self, t: TimePoint) -> impl Iterator<Item = usize> + 'a {
        let view = *self;
        self.raw_after(t).filter(move |&i| view.is_valid(i))
    }

    fn valid_at_or_before(&self, t: TimePoint) -> impl Iterator<Item = usize> + 'a {
        let view = *self;
        self.raw_at_or_before(t).filter(move |&i| view.is_valid(i))
    }

    fn valid_before(&self, t: TimePoint) -> impl Iterator<Item = usize> + 'a {
        let view = *self;
        self.raw_before(t).filter(move |&i| view.is_valid(i))
    }

    fn has_raw_fix_at(&self, t: TimePoint) -> bool {
        self.store.order.range((t, 0)..=(t, usize::MAX)).next().is_some()
    }

    // ------------------------------------------------------------------------
    // Smoothing
    // ------------------------------------------------------------------------

    fn is_valid(&self, idx: usize) -> bool {
        let cell = &self.store.validity[idx];
        match cell.load(Ordering::Acquire) {
            VALIDITY_VALID => true,
            VALIDITY_INVALID => false,
            _ => {
                let valid = self.compute_validity(idx);
                let flag = if valid { VALIDITY_VALID } else { VALIDITY_INVALID };
                cell.store(flag, Ordering::Release);
                valid
            }
        }
    }

    /// A fix is valid if, on each side, it has no raw neighbour within the
    /// averaging window or at least one that is plausibly reachable.
    fn compute_validity(&self, idx: usize) -> bool {
        let Some(max_speed) = self.store.config.max_speed_for_smoothing else {
            return true;
        };
        let fix = self.fix(idx);
        let t = fix.time_point();
        let window = self.averaging_millis();
        let key = (t, idx);

        let side_ok = |neighbours: &mut dyn Iterator<Item = &FixKey>| {
            let mut any_in_window = false;
            for &(other_t, j) in neighbours {
                if t.millis_since(other_t).abs() > window {
                    break;
                }
                any_in_window = true;
                if self.plausible(self.fix(j), fix, max_speed) {
                    return true;
                }
            }
            !any_in_window
        };

        side_ok(&mut self.store.order.range(..key).rev())
            && side_ok(&mut self.store.order.range((Excluded(key), Unbounded)))
    }

    fn plausible(&self, a: &F, b: &F, max_speed: Speed) -> bool {
        let millis = b.time_point().millis_since(a.time_point()).abs().max(1);
        let Some(inferred) = a.position().distance_to(b.position()).in_time(millis) else {
            return true;
        };
        if inferred > max_speed {
            return false;
        }
        if let (Some(ma), Some(mb)) = (a.measured_speed(), b.measured_speed()) {
            let config = &self.store.config;
            let measured = ma.knots().max(mb.knots());
            if inferred > config.min_speed_for_disagreement_check
                && inferred.knots() > config.speed_disagreement_factor * measured
            {
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------------
    // Position and speed
    // ------------------------------------------------------------------------

    fn estimated_position(&self, t: TimePoint, extrapolate: bool) -> Option<Position> {
        let before = self.valid_at_or_before(t).next().map(|i| self.fix(i));
        if let Some(b) = before {
            if b.time_point() == t {
                return Some(b.position());
            }
        }
        let after = self.valid_at_or_after(t).next().map(|i| self.fix(i));
        match (before, after) {
            (None, None) => None,
            (None, Some(a)) => Some(a.position()),
            (Some(b), Some(a)) => {
                let total = a.time_point().millis_since(b.time_point());
                if total <= 0 {
                    return Some(b.position());
                }
                let fraction = t.millis_since(b.time_point()) as f64 / total as f64;
                let start = b.position();
                let end = a.position();
                Some(start.translate(start.bearing_to(end), start.distance_to(end).scale(fraction)))
            }
            (Some(b), None) => {
                if !extrapolate {
                    return None;
                }
                let elapsed = t.millis_since(b.time_point());
                Some(match self.estimated_speed(b.time_point()) {
                    Some(speed) => speed.value.travel(b.position(), elapsed),
                    None => b.position(),
                })
            }
        }
    }

    fn last_known_position(&self, t: TimePoint) -> Option<Position> {
        self.estimated_position(t, false)
            .or_else(|| self.valid_at_or_before(t).next().map(|i| self.fix(i).position()))
    }

    /// Smoothed fixes that contribute to the speed estimate at `at`, in
    /// time order.
    ///
    /// Fixes with a measured speed: those within half the averaging window,
    /// or else the single nearest one. Position-only fixes: those within half
    /// the window, but at least the nearest one on each side, topped up
    /// from whichever side has more until there are two.
    fn relevant_fixes(&self, at: TimePoint) -> Vec<usize> {
        let half = self.averaging_millis() / 2;

        if F::CARRIES_SPEED {
            let within: Vec<usize> = self
                .valid_at_or_after(at.minus(half))
                .take_while(|&i| self.fix(i).time_point() <= at.plus(half))
                .collect();
            if !within.is_empty() {
                return within;
            }
            let before = self.valid_before(at).next();
            let after = self.valid_at_or_after(at).next();
            return match (before, after) {
                (Some(b), Some(a)) => {
                    let to_before = at.millis_since(self.fix(b).time_point());
                    let to_after = self.fix(a).time_point().millis_since(at);
                    vec![if to_before <= to_after { b } else { a }]
                }
                (Some(only), None) | (None, Some(only)) => vec![only],
                (None, None) => Vec::new(),
            };
        }

        let mut before = Vec::new();
        for i in self.valid_before(at) {
            if before.is_empty() || at.millis_since(self.fix(i).time_point()) <= half {
                before.push(i);
            } else {
                break;
            }
        }
        let mut after = Vec::new();
        for i in self.valid_at_or_after(at) {
            if after.is_empty() || self.fix(i).time_point().millis_since(at) <= half {
                after.push(i);
            } else {
                break;
            }
        }

        if before.len() + after.len() < 2 {
            // Only one side has fixes at all
            if after.is_empty() {
                before = self.valid_before(at).take(2).collect();
            } else if before.is_empty() {
                after = self.valid_at_or_after(at).take(2).collect();
            }
        }

        before.reverse();
        before.extend(after);
        before
    }

    fn estimated_speed_with<W: Weigher<TimePoint> + ?Sized>(
        &self,
        at: TimePoint,
        weigher: &W,
    ) -> Option<WithConfidence<SpeedWithBearing>> {
        let relevant = self.relevant_fixes(at);
        let mut samples = Vec::with_capacity(relevant.len() * 2);
        for pair in relevant.windows(2) {
            let (a, b) = (self.fix(pair[0]), self.fix(pair[1]));
            if let Some(inferred) =
                SpeedWithBearing::between(a.position(), a.time_point(), b.position(), b.time_point())
            {
                samples.push(SpeedSample::new(
                    inferred,
                    DEFAULT_FIX_CONFIDENCE,
                    a.time_point().middle(b.time_point()),
                ));
            }
        }
        for &i in &relevant {
            let fix = self.fix(i);
            if let Some(measured) = fix.measured_speed() {
                samples.push(SpeedSample::new(measured, DEFAULT_FIX_CONFIDENCE, fix.time_point()));
            }
        }
        average_speed_with_bearing(&samples, weigher, at)
    }

    fn estimated_speed(&self, at: TimePoint) -> Option<WithConfidence<SpeedWithBearing>> {
        let cacheable = self.has_raw_fix_at(at);
        if cacheable {
            let cached = sync::lock(&self.track.speed_cache).get(&at).copied();
            if let Some(hit) = cached {
                bump(&self.track.counters.speed_cache_hits);
                return hit;
            }
        }
        let weigher = ExponentialTimeWeigher::new(self.averaging_millis() / 2, MIN_SPEED_WEIGHT);
        let result = self.estimated_speed_with(at, &weigher);
        if cacheable {
            sync::lock(&self.track.speed_cache).insert(at, result);
        }
        result
    }

    // ------------------------------------------------------------------------
    // Distance
    // ------------------------------------------------------------------------

    fn distance(&self, from: TimePoint, to: TimePoint) -> Distance {
        if from >= to {
            return Distance::ZERO;
        }
        let cached = sync::lock(&self.track.distance_cache).lookup(from, to);
        let result = match cached {
            Some(hit) => {
                bump(&self.track.counters.distance_cache_hits);
                if hit.from == from && hit.to == to {
                    return hit.distance;
                }
                let head = self.distance(from, hit.from);
                let tail = self.distance(hit.to, to);
                head + hit.distance + tail
            }
            None => self.iterate_distance(from, to),
        };
        sync::lock(&self.track.distance_cache).cache(from, to, result);
        result
    }

    fn iterate_distance(&self, from: TimePoint, to: TimePoint) -> Distance {
        bump(&self.track.counters.distance_iterations);
        let Some(mut previous) = self.last_known_position(from) else {
            return Distance::ZERO;
        };
        let mut total = Distance::ZERO;
        for fix in self
            .valid_after(from)
            .map(|i| self.fix(i))
            .take_while(|f| f.time_point() < to)
        {
            total += previous.distance_to(fix.position());
            previous = fix.position();
        }
        if let Some(end) = self.last_known_position(to) {
            total += previous.distance_to(end);
        }
        total
    }

    // ------------------------------------------------------------------------
    // Maximum speed
    // ------------------------------------------------------------------------

    fn max_speed(&self, from: TimePoint, to: TimePoint) -> MaxSpeed<F> {
        if from > to {
            return None;
        }
        let cached = sync::lock(&self.track.max_speed_cache).lookup(from, to);
        let result = match cached {
            Some((entry_to, value)) => {
                bump(&self.track.counters.max_speed_cache_hits);
                if entry_to == to {
                    return value;
                }
                faster(value, self.max_speed(entry_to, to))
            }
            None => self.compute_max_speed(from, to),
        };
        sync::lock(&self.track.max_speed_cache).cache(from, to, result.clone());
        result
    }

    fn compute_max_speed(&self, from: TimePoint, to: TimePoint) -> MaxSpeed<F> {
        bump(&self.track.counters.max_speed_computations);
        let mut best: MaxSpeed<F> = None;
        for fix in self
            .valid_at_or_after(from)
            .map(|i| self.fix(i))
            .take_while(|f| f.time_point() <= to)
        {
            if let Some(estimate) = self.estimated_speed(fix.time_point()) {
                let speed = estimate.value.speed;
                if best.as_ref().map_or(true, |(_, max)| speed > *max) {
                    best = Some((fix.clone(), speed));
                }
            }
        }
        best
    }

    // ------------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------------

    /// Times whose estimated speed, estimated position or validity may
    /// involve the fix at `idx`.
    ///
    /// Left of the fix: everything after the previous smoothed fix, and
    /// everything within half a window. With fewer than two smoothed fixes
    /// before it, the top-up rule can reach it from any earlier time.
    /// Symmetric on the right, where the next smoothed fix itself is included.
    fn zone_of_influence(&self, idx: usize) -> InvalidationWindow {
        let t = self.fix(idx).time_point();
        let half = self.averaging_millis() / 2;

        let mut before = self.valid_before(t);
        let start = match (before.next(), before.next()) {
            (Some(p1), Some(_)) => self.fix(p1).time_point().plus(1).min(t.minus(half)),
            _ => TimePoint::MIN,
        };
        let mut after = self.valid_after(t);
        let end = match (after.next(), after.next()) {
            (Some(n1), Some(_)) => self.fix(n1).time_point().max(t.plus(half)),
            _ => TimePoint::MAX,
        };
        InvalidationWindow { start, end }
    }
}

fn faster<F>(a: MaxSpeed<F>, b: MaxSpeed<F>) -> MaxSpeed<F> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if y.1 > x.1 { y } else { x }),
        (x, None) => x,
        (None, y) => y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::Bearing;
    use std::sync::atomic::AtomicUsize;

    fn t(ms: i64) -> TimePoint {
        TimePoint::from_millis(ms)
    }

    fn origin() -> Position {
        Position::new(54.43, 10.19)
    }

    /// Position-only fixes heading north, `meters_per_second` apart each second.
    fn straight_track(count: i64, meters_per_second: f64) -> Track<GpsFix> {
        let track = Track::new("test", TrackConfig::default());
        for i in 0..count {
            let p = origin().translate(
                Bearing::from_degrees(0.0),
                Distance::from_meters(meters_per_second * i as f64),
            );
            track.add(GpsFix::new(p, t(i * 1000)));
        }
        track
    }

    fn moving(lat: f64, ms: i64, knots: f64, bearing: f64) -> GpsFixMoving {
        GpsFixMoving::new(
            Position::new(lat, 0.0),
            t(ms),
            SpeedWithBearing::new(Speed::from_knots(knots), Bearing::from_degrees(bearing)),
        )
    }

    #[test]
    fn test_empty_track() {
        let track: Track<GpsFix> = Track::new("empty", TrackConfig::default());
        assert_eq!(track.distance_traveled(t(0), t(10_000)), Distance::ZERO);
        assert!(track.estimated_position(t(5_000), false).is_none());
        assert!(track.estimated_position(t(5_000), true).is_none());
        assert!(track.estimated_speed(t(5_000)).is_none());
        assert!(track.maximum_speed_over_ground(t(0), t(10_000)).is_none());
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let track: Track<GpsFix> = Track::new("dup", TrackConfig::default());
        let fix = GpsFix::new(origin(), t(1000));
        assert!(track.add(fix));
        assert!(!track.add(fix));
        // same time, different position is a distinct fix
        assert!(track.add(GpsFix::new(Position::new(54.0, 10.0), t(1000))));
        assert_eq!(track.len(), 2);
    }

    #[test]
    fn test_estimated_speed_of_moving_fixes() {
        let track: Track<GpsFixMoving> = Track::new("boat", TrackConfig::default());
        track.add(moving(0.0, 0, 5.0, 0.0));
        track.add(moving(0.001, 10_000, 5.0, 0.0));

        let estimate = track.estimated_speed_with_confidence(t(5_000)).unwrap();
        assert!((estimate.value.knots() - 5.0).abs() < 0.01, "got {}", estimate.value.knots());
        let bearing = estimate.value.bearing.degrees();
        assert!(bearing < 0.01 || bearing > 359.99, "got {}", bearing);
        assert!(estimate.confidence > 0.0);
    }

    #[test]
    fn test_estimated_speed_grows_window_for_plain_fixes() {
        let track: Track<GpsFix> = Track::new("mark", TrackConfig::default());
        track.add(GpsFix::new(Position::new(0.0, 0.0), t(0)));
        assert!(track.estimated_speed(t(0)).is_none());

        track.add(GpsFix::new(Position::new(0.001, 0.0), t(60_000)));
        let estimate = track.estimated_speed(t(30_000)).unwrap();
        // 111.2 m in 60 s
        assert!((estimate.knots() - 3.6).abs() < 0.05, "got {}", estimate.knots());
        // after the last fix the top-up rule takes the last two fixes
        assert!(track.estimated_speed(t(120_000)).is_some());
    }

    #[test]
    fn test_estimated_position() {
        let track: Track<GpsFix> = Track::new("p", TrackConfig::default());
        let a = Position::new(0.0, 0.0);
        let b = Position::new(0.001, 0.0);
        track.add(GpsFix::new(a, t(0)));
        track.add(GpsFix::new(b, t(10_000)));

        assert_eq!(track.estimated_position(t(0), false), Some(a));
        assert_eq!(track.estimated_position(t(-5_000), false), Some(a));
        let mid = track.estimated_position(t(5_000), false).unwrap();
        assert!((mid.lat_deg - 0.0005).abs() < 1e-7);

        assert!(track.estimated_position(t(20_000), false).is_none());
        assert_eq!(track.last_known_position(t(20_000)), Some(b));
        let ahead = track.estimated_position(t(20_000), true).unwrap();
        assert!(ahead.lat_deg > b.lat_deg);
    }

    #[test]
    fn test_outlier_excluded_from_smoothed_view() {
        let track = straight_track(10, 2.5);
        let spike = GpsFix::new(
            origin().translate(Bearing::from_degrees(90.0), Distance::from_meters(2000.0)),
            t(4_500),
        );
        track.add(spike);
        assert_eq!(track.raw_fixes().len(), 11);
        assert_eq!(track.fixes().len(), 10);
        assert!(!track.fixes().contains(&spike));
    }

    #[test]
    fn test_no_smoothing_keeps_everything() {
        let config = TrackConfig {
            max_speed_for_smoothing: None,
            ..TrackConfig::default()
        };
        let track: Track<GpsFix> = Track::new("raw", config);
        track.add(GpsFix::new(Position::new(0.0, 0.0), t(0)));
        track.add(GpsFix::new(Position::new(1.0, 0.0), t(1000)));
        assert_eq!(track.fixes().len(), 2);
    }

    #[test]
    fn test_distance_cached_on_second_call() {
        let track = straight_track(10, 10.0);
        let first = track.distance_traveled(t(0), t(9_000));
        assert!((first.meters() - 90.0).abs() < 0.01, "got {}", first.meters());
        let iterations = track.stats().distance_iterations;

        let second = track.distance_traveled(t(0), t(9_000));
        assert_eq!(first.meters().to_bits(), second.meters().to_bits());
        assert_eq!(track.stats().distance_iterations, iterations);
        assert!(track.is_distance_cached(t(0), t(9_000)));
    }

    #[test]
    fn test_distance_composes_cached_intervals() {
        let track = straight_track(10, 10.0);
        let (a, b, c) = (t(1_000), t(4_000), t(8_000));
        let ab = track.distance_traveled(a, b);
        let bc = track.distance_traveled(b, c);
        let iterations = track.stats().distance_iterations;
        let ac = track.distance_traveled(a, c);
        assert_eq!(ac, ab + bc);
        assert_eq!(track.stats().distance_iterations, iterations);
    }

    #[test]
    fn test_distance_extends_live_interval() {
        let track = straight_track(10, 10.0);
        track.distance_traveled(t(0), t(5_000));
        let extended = track.distance_traveled(t(0), t(9_000));
        assert!((extended.meters() - 90.0).abs() < 0.01);
        assert!(track.stats().distance_cache_hits >= 1);
    }

    #[test]
    fn test_add_invalidates_later_distances() {
        let track = straight_track(10, 10.0);
        track.distance_traveled(t(0), t(2_000));
        track.distance_traveled(t(0), t(9_000));

        let kink = GpsFix::new(
            origin()
                .translate(Bearing::from_degrees(0.0), Distance::from_meters(85.0))
                .translate(Bearing::from_degrees(90.0), Distance::from_meters(5.0)),
            t(8_500),
        );
        track.add(kink);
        assert!(!track.is_distance_cached(t(0), t(9_000)));
        assert!(track.is_distance_cached(t(0), t(2_000)));

        let fresh = straight_track(10, 10.0);
        fresh.add(kink);
        let cached = track.distance_traveled(t(0), t(9_000)).meters();
        let expected = fresh.distance_traveled(t(0), t(9_000)).meters();
        assert!((cached - expected).abs() < 1e-9);
        assert!(cached > 90.0);
    }

    #[test]
    fn test_max_speed_and_invalidation() {
        let track: Track<GpsFix> = Track::new("accelerating", TrackConfig::default());
        let mut p = origin();
        for i in 0..10 {
            track.add(GpsFix::new(p, t(i * 1000)));
            p = p.translate(Bearing::from_degrees(0.0), Distance::from_meters(2.0 + i as f64));
        }
        let (fix, speed) = track.maximum_speed_over_ground(t(0), t(9_000)).unwrap();
        assert!(fix.time_point >= t(7_000));
        assert!(track.is_max_speed_cached(t(0), t(9_000)));
        let computations = track.stats().max_speed_computations;
        track.maximum_speed_over_ground(t(0), t(9_000));
        assert_eq!(track.stats().max_speed_computations, computations);

        // a faster stretch at the end
        let far = p.translate(Bearing::from_degrees(0.0), Distance::from_meters(20.0));
        track.add(GpsFix::new(far, t(10_000)));
        assert!(!track.is_max_speed_cached(t(0), t(9_000)));
        let (_, new_speed) = track.maximum_speed_over_ground(t(0), t(10_000)).unwrap();
        assert!(new_speed > speed);
    }

    #[test]
    fn test_max_speed_extends_cached_interval() {
        let track = straight_track(20, 3.0);
        track.maximum_speed_over_ground(t(0), t(10_000));
        let computations = track.stats().max_speed_computations;
        let extended = track.maximum_speed_over_ground(t(0), t(19_000));
        assert!(extended.is_some());
        // only the tail was computed
        assert_eq!(track.stats().max_speed_computations, computations + 1);
    }

    #[test]
    fn test_direction_change() {
        let track: Track<GpsFix> = Track::new("turn", TrackConfig::default());
        let mut p = origin();
        for i in 0..=20 {
            track.add(GpsFix::new(p, t(i * 1000)));
            let course = if i < 10 { 0.0 } else { 90.0 };
            p = p.translate(Bearing::from_degrees(course), Distance::from_meters(3.0));
        }
        assert!(track.has_direction_change(t(10_000), 45.0));
        assert!(!track.has_direction_change(t(3_000), 45.0));
    }

    #[test]
    fn test_set_averaging_clears_caches() {
        let track = straight_track(10, 10.0);
        track.distance_traveled(t(0), t(9_000));
        track.set_millis_over_which_to_average_speed(10_000);
        assert_eq!(track.stats().distance_cache_entries, 0);
        assert_eq!(track.millis_over_which_to_average_speed(), 10_000);
    }

    struct CountingListener(AtomicUsize);

    impl GpsTrackListener<GpsFix> for CountingListener {
        fn fix_received(&self, _fix: &GpsFix, _name: &str, _first: bool) -> crate::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_listener_notified_for_new_fixes_only() {
        let track: Track<GpsFix> = Track::new("l", TrackConfig::default());
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        track.add_listener(listener.clone());
        let fix = GpsFix::new(origin(), t(0));
        track.add(fix);
        track.add(fix);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }
}

#[cfg(all(test, feature = "property-tests"))]
mod proptests {
    use super::*;
    use crate::geo_utils::Bearing;
    use proptest::prelude::*;

    fn build(fixes: &[(i64, f64, f64)]) -> Track<GpsFix> {
        let track = Track::new("p", TrackConfig::default());
        for &(ms, north, east) in fixes {
            let p = Position::new(54.0, 10.0)
                .translate(Bearing::from_degrees(0.0), Distance::from_meters(north))
                .translate(Bearing::from_degrees(90.0), Distance::from_meters(east));
            track.add(GpsFix::new(p, TimePoint::from_millis(ms)));
        }
        track
    }

    proptest! {
        /// Cached answers after incremental insertion equal a fresh track's.
        #[test]
        fn prop_caches_match_fresh_track(
            initial in prop::collection::vec((0i64..120_000, 0.0f64..500.0, 0.0f64..500.0), 2..30),
            later in prop::collection::vec((0i64..120_000, 0.0f64..500.0, 0.0f64..500.0), 1..10),
            queries in prop::collection::vec((0i64..120_000, 0i64..120_000), 1..8),
        ) {
            let live = build(&initial);
            for &(a, b) in &queries {
                let (from, to) = (TimePoint::from_millis(a.min(b)), TimePoint::from_millis(a.max(b)));
                live.distance_traveled(from, to);
                live.maximum_speed_over_ground(from, to);
            }
            for &(ms, north, east) in &later {
                let p = Position::new(54.0, 10.0)
                    .translate(Bearing::from_degrees(0.0), Distance::from_meters(north))
                    .translate(Bearing::from_degrees(90.0), Distance::from_meters(east));
                live.add(GpsFix::new(p, TimePoint::from_millis(ms)));
            }
            let all: Vec<_> = initial.iter().chain(later.iter()).copied().collect();
            let fresh = build(&all);
            for &(a, b) in &queries {
                let (from, to) = (TimePoint::from_millis(a.min(b)), TimePoint::from_millis(a.max(b)));
                let cached = live.distance_traveled(from, to).meters();
                let expected = fresh.distance_traveled(from, to).meters();
                prop_assert!((cached - expected).abs() < 1e-3, "distance {} vs {}", cached, expected);

                let cached_max = live.maximum_speed_over_ground(from, to).map(|(_, s)| s.knots());
                let expected_max = fresh.maximum_speed_over_ground(from, to).map(|(_, s)| s.knots());
                match (cached_max, expected_max) {
                    (Some(c), Some(e)) => prop_assert!((c - e).abs() < 1e-6, "max {} vs {}", c, e),
                    (c, e) => prop_assert_eq!(c, e),
                }
            }
        }
    }
}
