//! # Tracked Race
//!
//! Owns every track of a race (competitors, marks, wind sources), the mark
//! passings and the leg list, and derives rankings, wind and maneuvers from
//! them.
//!
//! ## Locking
//!
//! Each entity has its own lock; no guard is held while another race method
//! is called. Where the course and the mark passings are needed together the
//! course lock is taken first.
//!
//! ## Cache clearing
//!
//! Every update clears the leg rank caches and the wind cache right away.
//! Race rankings and maneuvers are cleared by a timer that fires
//! `cache_clear_delay_millis` after the first update since the last clear,
//! so a burst of live fixes costs one recomputation.
//!
//! A value computed while an update or a clear happened is returned to its
//! caller but not cached. Immediate caches compare the update count, the
//! deferred ones the clearing generation.

pub mod state;

mod analytics;
mod ranking;
mod wind_estimation;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::boat_class::BoatClass;
use crate::course::{Competitor, CompetitorId, Course, MarkId, Waypoint, WaypointId};
use crate::error::{OptionExt, RaceError, Result};
use crate::geo_utils::{Position, TimePoint};
use crate::leg::{TrackedLeg, TrackedLegRef};
use crate::leg_of_competitor::TrackedLegOfCompetitor;
use crate::listeners::{Listeners, RaceChangeEvent, RaceChangeListener};
use crate::maneuver::{self, Maneuver, ManeuverContext};
use crate::mark_passing::{MarkPassing, MarkPassingStore};
use crate::sync;
use crate::track::{GpsFix, GpsFixMoving, Track, TrackConfig};
use crate::wind::{Wind, WindConfig, WindSource, WindTrack, WindWithConfidence};
use crate::wind_store::WindStore;

// ============================================================================
// Configuration and status
// ============================================================================

/// Race-wide parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceConfig {
    /// Applied to every competitor and mark track
    pub track: TrackConfig,
    /// Applied to every wind track and to combining wind sources
    pub wind: WindConfig,
    /// Delay between the first update and clearing rankings and maneuvers.
    /// Zero clears synchronously on every update.
    pub cache_clear_delay_millis: i64,
    /// Entries of the short-time combined wind cache
    pub wind_cache_capacity: usize,
    /// Fraction of the boat class maneuver threshold above which a course
    /// change disqualifies a competitor from wind estimation
    pub direction_change_threshold_factor: f64,
    /// How long before the start the race counts as live
    pub pre_start_phase_millis: i64,
    /// How long after the end of the race, or after the newest event, the
    /// race still counts as live
    pub live_grace_period_millis: i64,
    /// Delay between receiving data and showing it as live
    pub delay_to_live_millis: i64,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            track: TrackConfig::default(),
            wind: WindConfig::default(),
            cache_clear_delay_millis: 7500,
            wind_cache_capacity: 1000,
            direction_change_threshold_factor: 0.5,
            pre_start_phase_millis: 180_000,
            live_grace_period_millis: 180_000,
            delay_to_live_millis: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaceStatus {
    Prepared,
    Loading,
    Tracking,
    Finished,
    Removed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRaceStatus {
    pub status: RaceStatus,
    /// In [0, 1], meaningful while loading
    pub loading_progress: f64,
}

impl TrackedRaceStatus {
    pub fn new(status: RaceStatus, loading_progress: f64) -> Self {
        Self {
            status,
            loading_progress,
        }
    }
}

impl Default for TrackedRaceStatus {
    fn default() -> Self {
        Self::new(RaceStatus::Prepared, 0.0)
    }
}

/// Time points received from the race organisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceTimes {
    pub start_of_tracking: Option<TimePoint>,
    pub end_of_tracking: Option<TimePoint>,
    pub start_of_race: Option<TimePoint>,
}

/// Summary counters of one race.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaceStats {
    pub competitor_count: usize,
    pub mark_count: usize,
    pub wind_source_count: usize,
    pub fix_count: usize,
    pub wind_fix_count: usize,
    pub update_count: u64,
    pub cached_rankings: usize,
    pub cached_maneuver_competitors: usize,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone)]
struct ManeuverCacheEntry {
    from: TimePoint,
    to: TimePoint,
    maneuvers: Vec<Maneuver>,
}

impl ManeuverCacheEntry {
    fn within(&self, from: TimePoint, to: TimePoint) -> Vec<Maneuver> {
        self.maneuvers
            .iter()
            .filter(|m| m.time_point >= from && m.time_point <= to)
            .cloned()
            .collect()
    }
}

/// Derived values shared with the deferred clearing timer. The timer only
/// holds a weak reference, so a dropped race is never kept alive by it.
#[derive(Default)]
struct DerivedCaches {
    legs: RwLock<Vec<Arc<TrackedLeg>>>,
    rankings: Mutex<HashMap<TimePoint, Vec<CompetitorId>>>,
    maneuvers: Mutex<HashMap<CompetitorId, ManeuverCacheEntry>>,
    clear_scheduled: AtomicBool,
    /// Bumped by every clear; a timer armed in an older generation is void
    generation: AtomicU64,
}

impl DerivedCaches {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The generation is bumped before the scheduled flag is reset, so a
    /// timer armed after the reset always sees the new generation.
    fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.clear_scheduled.store(false, Ordering::SeqCst);
        sync::lock(&self.rankings).clear();
        sync::lock(&self.maneuvers).clear();
        debug!("[TrackedRace] Cleared rankings and maneuvers");
    }

    /// Clear unless another clear happened since the timer was armed in
    /// generation `armed`. Returns whether it cleared.
    fn clear_if_generation(&self, armed: u64) -> bool {
        if self.generation() != armed {
            return false;
        }
        self.clear();
        true
    }

    fn cache_ranking(&self, at: TimePoint, ranking: Vec<CompetitorId>, generation: u64) {
        let mut rankings = sync::lock(&self.rankings);
        if self.generation() == generation {
            rankings.insert(at, ranking);
        }
    }

    fn cache_maneuvers(&self, competitor: &CompetitorId, entry: ManeuverCacheEntry, generation: u64) {
        let mut maneuvers = sync::lock(&self.maneuvers);
        if self.generation() == generation {
            maneuvers.insert(competitor.clone(), entry);
        }
    }

    fn clear_leg_ranks(&self) {
        for leg in sync::read(&self.legs).iter() {
            leg.clear_rank_cache();
        }
    }

    fn rebuild_legs(&self, course: &Course) {
        *sync::write(&self.legs) = course
            .legs()
            .into_iter()
            .map(|leg| Arc::new(TrackedLeg::new(leg)))
            .collect();
    }
}

#[derive(Debug, Default)]
struct UpdateState {
    count: u64,
    newest_event: Option<TimePoint>,
    oldest_event: Option<TimePoint>,
}

/// Position bits, time point and sorted exclusions.
type WindCacheKey = (Option<(u64, u64)>, TimePoint, Vec<WindSource>);

// ============================================================================
// Tracked race
// ============================================================================

pub struct TrackedRace {
    event: String,
    id: String,
    boat_class: BoatClass,
    competitors: Vec<Competitor>,
    competitor_tracks: HashMap<CompetitorId, Arc<Track<GpsFixMoving>>>,
    mark_tracks: RwLock<HashMap<MarkId, Arc<Track<GpsFix>>>>,
    course: RwLock<Course>,
    mark_passings: RwLock<MarkPassingStore>,
    wind_tracks: RwLock<BTreeMap<WindSource, Arc<WindTrack>>>,
    wind_sources_to_exclude: RwLock<HashSet<WindSource>>,
    wind_cache: Mutex<LruCache<WindCacheKey, Option<WindWithConfidence>>>,
    config: RwLock<RaceConfig>,
    times: RwLock<RaceTimes>,
    status: RwLock<TrackedRaceStatus>,
    derived: Arc<DerivedCaches>,
    updates: Mutex<UpdateState>,
    update_signal: Condvar,
    loading: Mutex<bool>,
    loading_signal: Condvar,
    listeners: Listeners<dyn RaceChangeListener>,
}

impl TrackedRace {
    /// Create a race with empty tracks for every competitor and every mark
    /// of the course. Competitors listed twice are kept once.
    pub fn new(
        event: impl Into<String>,
        id: impl Into<String>,
        boat_class: BoatClass,
        competitors: Vec<Competitor>,
        course: Course,
        config: RaceConfig,
    ) -> Self {
        let id = id.into();
        let mut unique: Vec<Competitor> = Vec::with_capacity(competitors.len());
        for competitor in competitors {
            if unique.iter().any(|c| c.id == competitor.id) {
                warn!("[TrackedRace] Competitor {} listed twice in {}", competitor.id, id);
                continue;
            }
            unique.push(competitor);
        }

        let competitor_tracks = unique
            .iter()
            .map(|c| {
                let track = Track::new(c.id.as_str(), config.track.clone());
                (c.id.clone(), Arc::new(track))
            })
            .collect();
        let mark_tracks = course
            .marks()
            .into_iter()
            .map(|m| {
                let track = Track::new(m.as_str(), config.track.clone());
                (m, Arc::new(track))
            })
            .collect();

        let derived = Arc::new(DerivedCaches::default());
        derived.rebuild_legs(&course);
        let capacity = NonZeroUsize::new(config.wind_cache_capacity).unwrap_or(NonZeroUsize::MIN);

        info!(
            "[TrackedRace] Created {} with {} competitors and {} legs",
            id,
            unique.len(),
            course.leg_count()
        );

        Self {
            event: event.into(),
            id,
            boat_class,
            competitors: unique,
            competitor_tracks,
            mark_tracks: RwLock::new(mark_tracks),
            course: RwLock::new(course),
            mark_passings: RwLock::new(MarkPassingStore::new()),
            wind_tracks: RwLock::new(BTreeMap::new()),
            wind_sources_to_exclude: RwLock::new(HashSet::new()),
            wind_cache: Mutex::new(LruCache::new(capacity)),
            config: RwLock::new(config),
            times: RwLock::new(RaceTimes::default()),
            status: RwLock::new(TrackedRaceStatus::default()),
            derived,
            updates: Mutex::new(UpdateState::default()),
            update_signal: Condvar::new(),
            loading: Mutex::new(false),
            loading_signal: Condvar::new(),
            listeners: Listeners::new("TrackedRace"),
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn boat_class(&self) -> &BoatClass {
        &self.boat_class
    }

    pub fn competitors(&self) -> &[Competitor] {
        &self.competitors
    }

    pub fn competitor_ids(&self) -> Vec<CompetitorId> {
        self.competitors.iter().map(|c| c.id.clone()).collect()
    }

    pub fn has_competitor(&self, competitor: &CompetitorId) -> bool {
        self.competitor_tracks.contains_key(competitor)
    }

    pub fn config(&self) -> RaceConfig {
        sync::read(&self.config).clone()
    }

    // ========================================================================
    // Tracks
    // ========================================================================

    pub fn competitor_track(&self, competitor: &CompetitorId) -> Result<Arc<Track<GpsFixMoving>>> {
        self.competitor_tracks
            .get(competitor)
            .cloned()
            .ok_or_unknown_competitor(competitor.as_str())
    }

    pub fn mark_track(&self, mark: &MarkId) -> Result<Arc<Track<GpsFix>>> {
        sync::read(&self.mark_tracks)
            .get(mark)
            .cloned()
            .ok_or_else(|| RaceError::UnknownMark {
                mark: mark.to_string(),
            })
    }

    fn mark_track_or_create(&self, mark: &MarkId) -> Arc<Track<GpsFix>> {
        if let Ok(track) = self.mark_track(mark) {
            return track;
        }
        let config = self.config().track;
        sync::write(&self.mark_tracks)
            .entry(mark.clone())
            .or_insert_with(|| Arc::new(Track::new(mark.as_str(), config)))
            .clone()
    }

    pub fn mark_position(&self, mark: &MarkId, at: TimePoint) -> Option<Position> {
        self.mark_track(mark).ok()?.last_known_position(at)
    }

    /// Known positions of the marks making up `waypoint`.
    pub fn waypoint_mark_positions(&self, waypoint: &WaypointId, at: TimePoint) -> Vec<Position> {
        let marks = sync::read(&self.course)
            .waypoint(waypoint)
            .map(|w| w.marks.clone())
            .unwrap_or_default();
        marks
            .iter()
            .filter_map(|m| self.mark_position(m, at))
            .collect()
    }

    /// Center of the marks of `waypoint`; the middle of a gate or line.
    pub fn approximate_position(&self, waypoint: &WaypointId, at: TimePoint) -> Option<Position> {
        let positions = self.waypoint_mark_positions(waypoint, at);
        Position::average(positions.into_iter().map(|p| (p, 1.0)))
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Returns whether the fix was new.
    pub fn record_fix(&self, competitor: &CompetitorId, fix: GpsFixMoving) -> Result<bool> {
        let track = self.competitor_track(competitor)?;
        let added = track.add(fix);
        if added {
            self.updated(Some(fix.time_point));
            self.notify(RaceChangeEvent::CompetitorPositionChanged {
                competitor: competitor.clone(),
                fix,
            });
        }
        Ok(added)
    }

    /// Marks not yet known get a track on their first fix.
    pub fn record_mark_fix(&self, mark: &MarkId, fix: GpsFix) -> bool {
        let added = self.mark_track_or_create(mark).add(fix);
        if added {
            self.updated(Some(fix.time_point));
            self.notify(RaceChangeEvent::MarkPositionChanged {
                mark: mark.clone(),
                fix,
            });
        }
        added
    }

    /// Record an observation of a measured source. Derived sources cannot
    /// be recorded.
    pub fn record_wind(&self, source: &WindSource, wind: Wind) -> bool {
        if !source.source_type.can_be_stored() {
            warn!("[TrackedRace] Ignoring wind for derived source {}", source);
            return false;
        }
        let track = self.wind_track_or_create(source);
        let added = track.add(wind);
        if added {
            self.updated(Some(wind.time_point));
            self.notify(RaceChangeEvent::WindDataReceived {
                source: source.clone(),
                wind,
            });
        }
        added
    }

    pub fn remove_wind(&self, source: &WindSource, wind: &Wind) -> bool {
        let Some(track) = self.wind_track(source) else {
            return false;
        };
        let removed = track.remove(wind);
        if removed {
            self.updated(None);
            self.notify(RaceChangeEvent::WindDataRemoved {
                source: source.clone(),
                wind: *wind,
            });
        }
        removed
    }

    /// Replace all mark passings of `competitor`. Passings of waypoints that
    /// are not on the course are logged and dropped.
    pub fn update_mark_passings(&self, competitor: &CompetitorId, passings: Vec<MarkPassing>) -> Result<()> {
        if !self.has_competitor(competitor) {
            return Err(RaceError::UnknownCompetitor {
                competitor: competitor.to_string(),
            });
        }
        let (old, new) = {
            let course = sync::read(&self.course);
            let mut store = sync::write(&self.mark_passings);
            let old = store.update(competitor, passings, &course);
            (old, store.passings_of(competitor).to_vec())
        };
        self.updated(new.iter().map(|p| p.time_point).max());
        self.notify(RaceChangeEvent::MarkPassingsChanged {
            competitor: competitor.clone(),
            old,
            new,
        });
        Ok(())
    }

    // ========================================================================
    // Mark passings
    // ========================================================================

    pub fn mark_passing(&self, competitor: &CompetitorId, waypoint: &WaypointId) -> Option<MarkPassing> {
        sync::read(&self.mark_passings)
            .passing(competitor, waypoint)
            .cloned()
    }

    pub fn mark_passings_of(&self, competitor: &CompetitorId) -> Vec<MarkPassing> {
        sync::read(&self.mark_passings).passings_of(competitor).to_vec()
    }

    pub fn mark_passings_in_order(&self, waypoint: &WaypointId) -> Vec<MarkPassing> {
        sync::read(&self.mark_passings)
            .passings_in_order(waypoint)
            .to_vec()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_millis_over_which_to_average_speed(&self, millis: i64) {
        let old = {
            let mut config = sync::write(&self.config);
            std::mem::replace(&mut config.track.millis_over_which_to_average_speed, millis)
        };
        if old == millis {
            return;
        }
        for track in self.competitor_tracks.values() {
            track.set_millis_over_which_to_average_speed(millis);
        }
        let marks: Vec<_> = sync::read(&self.mark_tracks).values().cloned().collect();
        for track in marks {
            track.set_millis_over_which_to_average_speed(millis);
        }
        self.updated(None);
        self.notify(RaceChangeEvent::SpeedAveragingChanged {
            old_millis: old,
            new_millis: millis,
        });
    }

    pub fn set_millis_over_which_to_average_wind(&self, millis: i64) {
        let old = {
            let mut config = sync::write(&self.config);
            std::mem::replace(&mut config.wind.millis_over_which_to_average_wind, millis)
        };
        if old == millis {
            return;
        }
        let tracks: Vec<_> = sync::read(&self.wind_tracks).values().cloned().collect();
        for track in tracks {
            track.set_millis_over_which_to_average(millis);
        }
        self.updated(None);
        self.notify(RaceChangeEvent::WindAveragingChanged {
            old_millis: old,
            new_millis: millis,
        });
    }

    /// Sources left out of every combined wind query.
    pub fn set_wind_sources_to_exclude<I>(&self, sources: I)
    where
        I: IntoIterator<Item = WindSource>,
    {
        let sources: HashSet<WindSource> = sources.into_iter().collect();
        let mut listed: Vec<WindSource> = sources.iter().cloned().collect();
        listed.sort();
        *sync::write(&self.wind_sources_to_exclude) = sources;
        self.updated(None);
        self.notify(RaceChangeEvent::WindSourcesToExcludeChanged { sources: listed });
    }

    pub fn wind_sources_to_exclude(&self) -> Vec<WindSource> {
        let mut sources: Vec<WindSource> = sync::read(&self.wind_sources_to_exclude)
            .iter()
            .cloned()
            .collect();
        sources.sort();
        sources
    }

    pub fn status(&self) -> TrackedRaceStatus {
        sync::read(&self.status).clone()
    }

    pub fn set_status(&self, status: TrackedRaceStatus) {
        let old = std::mem::replace(&mut *sync::write(&self.status), status.clone());
        if old == status {
            return;
        }
        info!(
            "[TrackedRace] {} status {:?} -> {:?}",
            self.id, old.status, status.status
        );
        self.notify(RaceChangeEvent::StatusChanged { old, new: status });
    }

    pub fn times(&self) -> RaceTimes {
        sync::read(&self.times).clone()
    }

    fn update_times<F: FnOnce(&mut RaceTimes)>(&self, f: F) {
        let times = {
            let mut times = sync::write(&self.times);
            let before = times.clone();
            f(&mut times);
            if *times == before {
                return;
            }
            times.clone()
        };
        self.updated(None);
        self.notify(RaceChangeEvent::RaceTimesChanged { times });
    }

    pub fn set_start_of_tracking(&self, start: Option<TimePoint>) {
        self.update_times(|t| t.start_of_tracking = start);
    }

    pub fn set_end_of_tracking(&self, end: Option<TimePoint>) {
        self.update_times(|t| t.end_of_tracking = end);
    }

    pub fn set_start_of_race(&self, start: Option<TimePoint>) {
        self.update_times(|t| t.start_of_race = start);
    }

    pub fn end_of_tracking(&self) -> Option<TimePoint> {
        sync::read(&self.times).end_of_tracking
    }

    /// The received start time, or else the first passing of the start
    /// waypoint.
    pub fn start_of_race(&self) -> Option<TimePoint> {
        if let Some(start) = sync::read(&self.times).start_of_race {
            return Some(start);
        }
        let first = sync::read(&self.course).first_waypoint()?.id.clone();
        sync::read(&self.mark_passings)
            .first_passing(&first)
            .map(|p| p.time_point)
    }

    // ========================================================================
    // Course and legs
    // ========================================================================

    pub fn course(&self) -> Course {
        sync::read(&self.course).clone()
    }

    pub fn leg_count(&self) -> usize {
        sync::read(&self.derived.legs).len()
    }

    pub fn legs(&self) -> Vec<TrackedLegRef<'_>> {
        sync::read(&self.derived.legs)
            .iter()
            .map(|leg| TrackedLegRef::new(self, Arc::clone(leg)))
            .collect()
    }

    pub fn tracked_leg(&self, index: usize) -> Result<TrackedLegRef<'_>> {
        let leg = sync::read(&self.derived.legs)
            .get(index)
            .cloned()
            .ok_or(RaceError::UnknownLeg { index })?;
        Ok(TrackedLegRef::new(self, leg))
    }

    pub fn tracked_leg_of_competitor(
        &self,
        competitor: &CompetitorId,
        leg_index: usize,
    ) -> Result<TrackedLegOfCompetitor<'_>> {
        self.tracked_leg(leg_index)?.competitor(competitor)
    }

    /// Index of the leg the competitor sails at `at`: the one starting at
    /// the last waypoint passed. `None` before the start and after the finish.
    pub fn current_leg_index(&self, competitor: &CompetitorId, at: TimePoint) -> Option<usize> {
        let course = sync::read(&self.course);
        let passed = sync::read(&self.mark_passings)
            .last_passing_at_or_before(competitor, at)?
            .waypoint
            .clone();
        course.leg_starting_at(&passed).map(|leg| leg.index)
    }

    pub fn current_leg(&self, competitor: &CompetitorId, at: TimePoint) -> Option<TrackedLegOfCompetitor<'_>> {
        let index = self.current_leg_index(competitor, at)?;
        self.tracked_leg_of_competitor(competitor, index).ok()
    }

    pub fn add_waypoint(&self, index: usize, waypoint: Waypoint) -> Result<()> {
        let marks = waypoint.marks.clone();
        {
            let mut course = sync::write(&self.course);
            course.add_waypoint(index, waypoint)?;
            self.derived.rebuild_legs(&course);
        }
        for mark in &marks {
            self.mark_track_or_create(mark);
        }
        self.course_changed();
        Ok(())
    }

    /// Passings of the removed waypoint are dropped with it.
    pub fn remove_waypoint(&self, waypoint: &WaypointId) -> Result<()> {
        {
            let mut course = sync::write(&self.course);
            course.remove_waypoint(waypoint)?;
            sync::write(&self.mark_passings).remove_waypoint(waypoint);
            self.derived.rebuild_legs(&course);
        }
        self.course_changed();
        Ok(())
    }

    fn course_changed(&self) {
        info!("[TrackedRace] Course of {} now has {} legs", self.id, self.leg_count());
        self.derived.clear();
        self.updated(None);
        self.notify(RaceChangeEvent::CourseChanged);
    }

    // ========================================================================
    // Maneuvers
    // ========================================================================

    /// Maneuvers of `competitor` between `from` and `to`. Detection runs over
    /// the widest interval requested so far and is reused until the next
    /// cache clearing.
    pub fn maneuvers(&self, competitor: &CompetitorId, from: TimePoint, to: TimePoint) -> Result<Vec<Maneuver>> {
        let track = self.competitor_track(competitor)?;
        let generation = self.derived.generation();
        let cached = sync::lock(&self.derived.maneuvers).get(competitor).cloned();
        let (detect_from, detect_to) = match &cached {
            Some(entry) if entry.from <= from && entry.to >= to => return Ok(entry.within(from, to)),
            Some(entry) => (entry.from.min(from), entry.to.max(to)),
            None => (from, to),
        };

        let context = CompetitorManeuvers {
            race: self,
            competitor,
        };
        let maneuvers = maneuver::detect_maneuvers(&track, &self.boat_class, &context, detect_from, detect_to);
        debug!(
            "[TrackedRace] Detected {} maneuvers of {} in [{}, {}]",
            maneuvers.len(),
            competitor,
            detect_from,
            detect_to
        );
        let entry = ManeuverCacheEntry {
            from: detect_from,
            to: detect_to,
            maneuvers,
        };
        let result = entry.within(from, to);
        self.derived.cache_maneuvers(competitor, entry, generation);
        Ok(result)
    }

    // ========================================================================
    // Update protocol
    // ========================================================================

    /// The count is raised before the caches are cleared. A reader that
    /// saw the old count either stores before the clear or not at all.
    fn updated(&self, time_of_event: Option<TimePoint>) {
        {
            let mut state = sync::lock(&self.updates);
            state.count += 1;
            if let Some(t) = time_of_event {
                state.newest_event = Some(state.newest_event.map_or(t, |n| n.max(t)));
                state.oldest_event = Some(state.oldest_event.map_or(t, |o| o.min(t)));
            }
        }
        sync::lock(&self.wind_cache).clear();
        self.derived.clear_leg_ranks();
        self.schedule_cache_clearing();
        self.update_signal.notify_all();
    }

    fn schedule_cache_clearing(&self) {
        let delay = sync::read(&self.config).cache_clear_delay_millis;
        if delay <= 0 {
            self.derived.clear();
            return;
        }
        if self.derived.clear_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let armed = self.derived.generation();
        let caches = Arc::downgrade(&self.derived);
        let spawned = thread::Builder::new()
            .name(format!("cache-clear-{}", self.id))
            .spawn(move || {
                thread::sleep(Duration::from_millis(delay.unsigned_abs()));
                if let Some(caches) = caches.upgrade() {
                    if !caches.clear_if_generation(armed) {
                        debug!("[TrackedRace] Cache clearing timer outdated by an earlier clear");
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("[TrackedRace] Clearing caches synchronously, timer unavailable: {}", e);
            self.derived.clear();
        }
    }

    /// Clear rankings and maneuvers now instead of waiting for the timer.
    /// A pending timer is disarmed; the next update arms a fresh one.
    pub fn flush_deferred_cache_clearing(&self) {
        self.derived.clear();
    }

    /// Monotonically increasing count of updates.
    pub fn update_count(&self) -> u64 {
        sync::lock(&self.updates).count
    }

    /// Block until the update count exceeds `since` and return the new
    /// count. There is no timeout.
    pub fn wait_for_next_update(&self, since: u64) -> u64 {
        let mut state = sync::lock(&self.updates);
        while state.count <= since {
            state = sync::wait(&self.update_signal, state);
        }
        state.count
    }

    pub fn time_point_of_newest_event(&self) -> Option<TimePoint> {
        sync::lock(&self.updates).newest_event
    }

    pub fn time_point_of_oldest_event(&self) -> Option<TimePoint> {
        sync::lock(&self.updates).oldest_event
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn add_listener(&self, listener: Arc<dyn RaceChangeListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RaceChangeListener>) -> bool {
        self.listeners.remove(listener)
    }

    fn notify(&self, event: RaceChangeEvent) {
        self.listeners.notify(|l| l.race_changed(&event));
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load stored wind in a background thread. The race keeps accepting
    /// fixes meanwhile; its status is `Loading` until the load is done.
    pub fn load_wind_from_store(self: &Arc<Self>, store: Arc<dyn WindStore>) -> Result<()> {
        *sync::lock(&self.loading) = true;
        let previous = self.status();
        self.set_status(TrackedRaceStatus::new(RaceStatus::Loading, 0.0));

        let race = Arc::clone(self);
        let restore = previous.clone();
        let spawned = thread::Builder::new()
            .name(format!("wind-loader-{}", self.id))
            .spawn(move || {
                race.load_wind_tracks(store.as_ref());
                race.set_status(restore);
                race.finish_loading();
            });
        if let Err(e) = spawned {
            self.set_status(previous);
            self.finish_loading();
            return Err(RaceError::WindStore {
                message: format!("cannot start loader: {}", e),
            });
        }
        Ok(())
    }

    fn load_wind_tracks(&self, store: &dyn WindStore) {
        let millis = self.config().wind.millis_over_which_to_average_wind;
        match store.load_wind_tracks(&self.event, &self.id, millis) {
            Ok(tracks) => {
                let mut loaded = 0;
                for (source, track) in tracks {
                    for wind in track.winds() {
                        if self.record_wind(&source, wind) {
                            loaded += 1;
                        }
                    }
                }
                info!("[TrackedRace] Loaded {} wind fixes for {}", loaded, self.id);
            }
            Err(e) => warn!("[TrackedRace] Loading wind for {} failed: {}", self.id, e),
        }
    }

    fn finish_loading(&self) {
        *sync::lock(&self.loading) = false;
        self.loading_signal.notify_all();
    }

    pub fn is_loading(&self) -> bool {
        *sync::lock(&self.loading)
    }

    pub fn wait_until_loading_complete(&self) {
        let mut loading = sync::lock(&self.loading);
        while *loading {
            loading = sync::wait(&self.loading_signal, loading);
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> RaceStats {
        let wind_tracks: Vec<_> = sync::read(&self.wind_tracks).values().cloned().collect();
        RaceStats {
            competitor_count: self.competitors.len(),
            mark_count: sync::read(&self.mark_tracks).len(),
            wind_source_count: wind_tracks.len(),
            fix_count: self.competitor_tracks.values().map(|t| t.len()).sum(),
            wind_fix_count: wind_tracks.iter().map(|t| t.len()).sum(),
            update_count: self.update_count(),
            cached_rankings: sync::lock(&self.derived.rankings).len(),
            cached_maneuver_competitors: sync::lock(&self.derived.maneuvers).len(),
        }
    }
}

/// Race knowledge handed to maneuver detection for one competitor.
struct CompetitorManeuvers<'a> {
    race: &'a TrackedRace,
    competitor: &'a CompetitorId,
}

impl ManeuverContext for CompetitorManeuvers<'_> {
    fn wind(&self, position: Option<Position>, at: TimePoint) -> Option<Wind> {
        self.race.wind(position, at)
    }

    fn leg_index(&self, at: TimePoint) -> Option<usize> {
        self.race.current_leg_index(self.competitor, at)
    }

    fn leg_start_time(&self, leg_index: usize) -> Option<TimePoint> {
        let from = sync::read(&self.race.course).leg(leg_index)?.from;
        self.race
            .mark_passing(self.competitor, &from)
            .map(|p| p.time_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::{Bearing, Speed, SpeedWithBearing};
    use crate::wind::WindSourceType;
    use std::sync::atomic::AtomicUsize;

    fn course() -> Course {
        Course::new(
            "windward-leeward",
            vec![
                Waypoint::mark("start", "pin".into()),
                Waypoint::mark("top", "windward".into()),
                Waypoint::mark("finish", "leeward".into()),
            ],
        )
        .unwrap()
    }

    fn race(delay: i64) -> TrackedRace {
        let config = RaceConfig {
            cache_clear_delay_millis: delay,
            ..RaceConfig::default()
        };
        TrackedRace::new(
            "worlds",
            "race-1",
            BoatClass::default(),
            vec![Competitor::new("a", "Alpha"), Competitor::new("b", "Bravo")],
            course(),
            config,
        )
    }

    fn moving(lat: f64, secs: i64) -> GpsFixMoving {
        GpsFixMoving::new(
            Position::new(lat, 0.0),
            TimePoint::from_seconds(secs as f64),
            SpeedWithBearing::new(Speed::from_knots(5.0), Bearing::from_degrees(0.0)),
        )
    }

    #[test]
    fn test_unknown_competitor_is_an_error() {
        let race = race(0);
        let err = race.record_fix(&"zulu".into(), moving(0.0, 0)).unwrap_err();
        assert!(matches!(err, RaceError::UnknownCompetitor { .. }));
    }

    #[test]
    fn test_update_count_and_event_times() {
        let race = race(0);
        assert_eq!(race.update_count(), 0);
        race.record_fix(&"a".into(), moving(0.0, 10)).unwrap();
        race.record_fix(&"a".into(), moving(0.001, 5)).unwrap();
        assert_eq!(race.update_count(), 2);
        assert_eq!(race.wait_for_next_update(1), 2);
        assert_eq!(race.time_point_of_newest_event(), Some(TimePoint::from_seconds(10.0)));
        assert_eq!(race.time_point_of_oldest_event(), Some(TimePoint::from_seconds(5.0)));
    }

    #[test]
    fn test_wait_for_next_update_wakes_up() {
        let race = Arc::new(race(0));
        let waiter = {
            let race = Arc::clone(&race);
            thread::spawn(move || race.wait_for_next_update(0))
        };
        thread::sleep(Duration::from_millis(20));
        race.record_mark_fix(&"pin".into(), GpsFix::new(Position::new(0.0, 0.0), TimePoint::from_millis(0)));
        assert!(waiter.join().unwrap() >= 1);
    }

    #[test]
    fn test_derived_wind_sources_cannot_be_recorded() {
        let race = race(0);
        let wind = Wind::from_direction(None, TimePoint::from_millis(0), 10.0, 0.0);
        assert!(!race.record_wind(&WindSource::new(WindSourceType::CourseBased), wind));
        assert!(race.record_wind(&WindSource::new(WindSourceType::RaceCommittee), wind));
        assert_eq!(race.stats().wind_fix_count, 1);
    }

    #[test]
    fn test_deferred_clearing_is_coalesced() {
        let race = race(60_000);
        race.record_fix(&"a".into(), moving(0.0, 0)).unwrap();
        race.record_fix(&"a".into(), moving(0.001, 10)).unwrap();
        race.maneuvers(&"a".into(), TimePoint::from_millis(0), TimePoint::from_seconds(10.0))
            .unwrap();
        assert_eq!(race.stats().cached_maneuver_competitors, 1);

        // Still cached: the timer has not fired yet
        race.record_fix(&"a".into(), moving(0.002, 20)).unwrap();
        assert_eq!(race.stats().cached_maneuver_competitors, 1);
        assert!(race.derived.clear_scheduled.load(Ordering::SeqCst));

        race.flush_deferred_cache_clearing();
        assert_eq!(race.stats().cached_maneuver_competitors, 0);
    }

    #[test]
    fn test_flush_disarms_pending_timer() {
        let race = race(60_000);
        let armed = race.derived.generation();
        race.record_fix(&"a".into(), moving(0.0, 0)).unwrap();
        assert!(race.derived.clear_scheduled.load(Ordering::SeqCst));

        race.flush_deferred_cache_clearing();
        assert!(!race.derived.clear_scheduled.load(Ordering::SeqCst));

        // Next burst arms a fresh timer and fills the cache
        race.record_fix(&"a".into(), moving(0.001, 10)).unwrap();
        race.maneuvers(&"a".into(), TimePoint::from_millis(0), TimePoint::from_seconds(10.0))
            .unwrap();
        assert_eq!(race.stats().cached_maneuver_competitors, 1);

        // The first timer waking up now leaves the new burst alone
        assert!(!race.derived.clear_if_generation(armed));
        assert_eq!(race.stats().cached_maneuver_competitors, 1);
        assert!(race.derived.clear_if_generation(race.derived.generation()));
        assert_eq!(race.stats().cached_maneuver_competitors, 0);
    }

    #[test]
    fn test_ranking_computed_across_a_clear_is_not_cached() {
        let race = race(60_000);
        let generation = race.derived.generation();
        race.flush_deferred_cache_clearing();
        race.derived
            .cache_ranking(TimePoint::from_millis(0), race.competitor_ids(), generation);
        assert_eq!(race.stats().cached_rankings, 0);

        race.competitors_from_best_to_worst(TimePoint::from_millis(0));
        assert_eq!(race.stats().cached_rankings, 1);
    }

    #[test]
    fn test_wind_computed_before_an_update_is_not_cached() {
        let race = race(0);
        let at = TimePoint::from_seconds(10.0);
        let committee = WindSource::new(WindSourceType::RaceCommittee);
        race.record_wind(&committee, Wind::from_direction(None, at, 10.0, 0.0));
        let seen = race.update_count();
        let stale = race.wind_with_confidence(None, at, &[]);

        let web = WindSource::new(WindSourceType::Web);
        race.record_wind(&web, Wind::from_direction(None, at, 10.0, 90.0));
        race.cache_wind((None, at, Vec::new()), stale, seen);

        let north = Bearing::from_degrees(0.0);
        let stale_from = stale.unwrap().value.from();
        let fresh_from = race.wind(None, at).unwrap().from();
        assert!(north.difference_to(stale_from).abs() < 1e-6);
        assert!(north.difference_to(fresh_from) > 1.0, "fresh wind from {:?}", fresh_from);
    }

    #[test]
    fn test_status_change_notifies_listeners() {
        let race = race(0);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let listener: Arc<dyn RaceChangeListener> = Arc::new(move |event: &RaceChangeEvent| -> Result<()> {
            if matches!(event, RaceChangeEvent::StatusChanged { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        race.add_listener(Arc::clone(&listener));
        race.set_status(TrackedRaceStatus::new(RaceStatus::Tracking, 1.0));
        race.set_status(TrackedRaceStatus::new(RaceStatus::Tracking, 1.0));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(race.remove_listener(&listener));
    }

    #[test]
    fn test_start_of_race_inferred_from_start_passings() {
        let race = race(0);
        assert_eq!(race.start_of_race(), None);
        let passing = MarkPassing::new(TimePoint::from_seconds(30.0), "start".into(), "a".into());
        race.update_mark_passings(&"a".into(), vec![passing]).unwrap();
        assert_eq!(race.start_of_race(), Some(TimePoint::from_seconds(30.0)));
        race.set_start_of_race(Some(TimePoint::from_seconds(20.0)));
        assert_eq!(race.start_of_race(), Some(TimePoint::from_seconds(20.0)));
    }

    #[test]
    fn test_removing_waypoint_drops_its_passings() {
        let race = race(0);
        race.add_waypoint(2, Waypoint::mark("gate", "gate-1".into())).unwrap();
        assert_eq!(race.leg_count(), 3);
        let passings = vec![
            MarkPassing::new(TimePoint::from_seconds(0.0), "start".into(), "a".into()),
            MarkPassing::new(TimePoint::from_seconds(60.0), "top".into(), "a".into()),
            MarkPassing::new(TimePoint::from_seconds(90.0), "gate".into(), "a".into()),
        ];
        race.update_mark_passings(&"a".into(), passings).unwrap();
        assert_eq!(race.current_leg_index(&"a".into(), TimePoint::from_seconds(95.0)), Some(2));

        race.remove_waypoint(&"gate".into()).unwrap();
        assert_eq!(race.leg_count(), 2);
        assert_eq!(race.mark_passings_of(&"a".into()).len(), 2);
        assert_eq!(race.current_leg_index(&"a".into(), TimePoint::from_seconds(95.0)), Some(1));
    }
}
