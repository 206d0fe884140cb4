//! # Tracked Legs
//!
//! A leg of the course joined with the race's tracks: leg type relative to
//! the wind, windward distances and the per-leg ranking.
//!
//! The ranking of a leg is memoized per time point and cleared by the race
//! on every change that could affect it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::course::{CompetitorId, Leg};
use crate::error::{OptionExt, RaceError, Result};
use crate::geo_utils::{Bearing, Distance, Position, TimePoint};
use crate::leg_of_competitor::TrackedLegOfCompetitor;
use crate::race::TrackedRace;
use crate::sync;
use crate::wind::WindSourceType;

/// Legs within this many degrees of the wind axis are upwind or downwind.
pub const UPWIND_DOWNWIND_TOLERANCE_DEGREES: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegType {
    Upwind,
    Downwind,
    Reaching,
}

/// Leg state owned by the race.
#[derive(Debug)]
pub struct TrackedLeg {
    leg: Leg,
    rank_cache: Mutex<HashMap<TimePoint, Vec<CompetitorId>>>,
}

impl TrackedLeg {
    pub(crate) fn new(leg: Leg) -> Self {
        Self {
            leg,
            rank_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn leg(&self) -> &Leg {
        &self.leg
    }

    pub fn clear_rank_cache(&self) {
        sync::lock(&self.rank_cache).clear();
    }

    pub fn cached_rank_count(&self) -> usize {
        sync::lock(&self.rank_cache).len()
    }

    /// Keep `ranking` unless `current` reports an update since `seen`.
    /// The check runs under the cache lock, so a clear that follows the
    /// update removes anything stored before it.
    pub(crate) fn cache_ranking<C>(&self, at: TimePoint, ranking: Vec<CompetitorId>, seen: u64, current: C)
    where
        C: FnOnce() -> u64,
    {
        let mut cache = sync::lock(&self.rank_cache);
        if current() == seen {
            cache.insert(at, ranking);
        }
    }
}

/// Ordering key of one competitor within a leg. Finishers come first, by
/// finish time; everyone else by windward distance to go.
#[derive(Debug, Clone, Copy, PartialEq)]
enum RankKey {
    Finished(TimePoint),
    Sailing(f64),
}

impl RankKey {
    fn compare(&self, other: &RankKey) -> Ordering {
        match (self, other) {
            (RankKey::Finished(a), RankKey::Finished(b)) => a.cmp(b),
            (RankKey::Finished(_), RankKey::Sailing(_)) => Ordering::Less,
            (RankKey::Sailing(_), RankKey::Finished(_)) => Ordering::Greater,
            (RankKey::Sailing(a), RankKey::Sailing(b)) => a.total_cmp(b),
        }
    }
}

/// A tracked leg viewed through its race.
#[derive(Clone)]
pub struct TrackedLegRef<'r> {
    race: &'r TrackedRace,
    tracked: Arc<TrackedLeg>,
}

impl<'r> TrackedLegRef<'r> {
    pub(crate) fn new(race: &'r TrackedRace, tracked: Arc<TrackedLeg>) -> Self {
        Self { race, tracked }
    }

    pub fn race(&self) -> &'r TrackedRace {
        self.race
    }

    pub fn leg(&self) -> &Leg {
        self.tracked.leg()
    }

    pub fn index(&self) -> usize {
        self.tracked.leg.index
    }

    pub fn tracked_leg(&self) -> &Arc<TrackedLeg> {
        &self.tracked
    }

    /// This leg seen from one competitor.
    pub fn competitor(&self, competitor: &CompetitorId) -> Result<TrackedLegOfCompetitor<'r>> {
        let track = self.race.competitor_track(competitor)?;
        Ok(TrackedLegOfCompetitor::new(self.clone(), competitor.clone(), track))
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    fn endpoints(&self, at: TimePoint) -> Option<(Position, Position)> {
        let from = self.race.approximate_position(&self.leg().from, at)?;
        let to = self.race.approximate_position(&self.leg().to, at)?;
        Some((from, to))
    }

    pub fn leg_bearing(&self, at: TimePoint) -> Option<Bearing> {
        self.endpoints(at).map(|(from, to)| from.bearing_to(to))
    }

    pub fn middle_of_leg(&self, at: TimePoint) -> Option<Position> {
        self.endpoints(at).map(|(from, to)| from.middle(to))
    }

    /// Signed distance of `position` from the rhumb line of the leg,
    /// positive to starboard.
    pub fn cross_track_error(&self, position: Position, at: TimePoint) -> Option<Distance> {
        self.endpoints(at)
            .map(|(from, to)| position.cross_track_error(from, from.bearing_to(to)))
    }

    /// Leg type from the wind at the middle of the leg. Track-based wind
    /// estimation is excluded since it depends on leg types itself.
    pub fn leg_type(&self, at: TimePoint) -> Result<LegType> {
        let message = || format!("cannot determine type of leg {}", self.index());
        let (from, to) = self.endpoints(at).ok_or_no_wind(&message())?;
        let exclude = self.race.wind_sources_of_type(WindSourceType::TrackBasedEstimation);
        let wind = self
            .race
            .wind_with_confidence(Some(from.middle(to)), at, &exclude)
            .ok_or_no_wind(&message())?
            .value;
        let leg_bearing = from.bearing_to(to);
        if leg_bearing.difference_to(wind.bearing()).abs() < UPWIND_DOWNWIND_TOLERANCE_DEGREES {
            Ok(LegType::Downwind)
        } else if leg_bearing.difference_to(wind.from()).abs() < UPWIND_DOWNWIND_TOLERANCE_DEGREES {
            Ok(LegType::Upwind)
        } else {
            Ok(LegType::Reaching)
        }
    }

    pub fn is_up_or_downwind(&self, at: TimePoint) -> Result<bool> {
        Ok(self.leg_type(at)? != LegType::Reaching)
    }

    /// Axis along which progress on this leg is measured: the wind for
    /// upwind and downwind legs, the leg itself for reaches.
    pub(crate) fn progress_axis(&self, near: Position, at: TimePoint) -> Result<Option<Bearing>> {
        if self.is_up_or_downwind(at)? {
            let wind = self
                .race
                .wind(Some(near), at)
                .ok_or_no_wind("need the wind direction for windward distance")?;
            Ok(Some(wind.bearing()))
        } else {
            Ok(self.leg_bearing(at))
        }
    }

    /// Distance between two positions projected on the wind axis for
    /// upwind and downwind legs, on the leg axis for reaches.
    pub fn windward_distance(&self, from: Position, to: Position, at: TimePoint) -> Result<Distance> {
        Ok(match self.progress_axis(from, at)? {
            Some(axis) => to.along_track_distance(from, axis).abs(),
            None => from.distance_to(to),
        })
    }

    /// [`Self::windward_distance`], projecting on the leg axis while the
    /// wind is unknown.
    pub fn windward_distance_or_leg_projection(&self, from: Position, to: Position, at: TimePoint) -> Distance {
        match self.windward_distance(from, to, at) {
            Ok(d) => d,
            Err(RaceError::NoWind { message }) => {
                debug!("[TrackedLeg] Leg {} projected on leg axis: {}", self.index(), message);
                match self.leg_bearing(at) {
                    Some(axis) => to.along_track_distance(from, axis).abs(),
                    None => from.distance_to(to),
                }
            }
            Err(_) => from.distance_to(to),
        }
    }

    /// Windward length of the whole leg.
    pub fn windward_length(&self, at: TimePoint) -> Option<Distance> {
        self.endpoints(at)
            .map(|(from, to)| self.windward_distance_or_leg_projection(from, to, at))
    }

    // ------------------------------------------------------------------------
    // Ranking
    // ------------------------------------------------------------------------

    fn rank_key(&self, competitor: &CompetitorId, at: TimePoint, leg_length: Option<Distance>) -> RankKey {
        let Ok(leg_of_competitor) = self.competitor(competitor) else {
            return RankKey::Sailing(f64::INFINITY);
        };
        if let Some(finish) = leg_of_competitor.finish_time().filter(|t| *t <= at) {
            return RankKey::Finished(finish);
        }
        let to_go = if leg_of_competitor.has_started_leg(at) {
            leg_of_competitor.windward_distance_to_go_for_ranking(at)
        } else {
            leg_length
        };
        RankKey::Sailing(to_go.map_or(f64::INFINITY, Distance::meters))
    }

    /// All competitors of the race, best first. Competitors that have not
    /// started the leg tie at the leg's full windward length and keep the
    /// race's competitor order.
    pub fn competitor_tracks_ordered_by_rank(&self, at: TimePoint) -> Vec<CompetitorId> {
        let cached = sync::lock(&self.tracked.rank_cache).get(&at).cloned();
        if let Some(ranking) = cached {
            return ranking;
        }

        let seen = self.race.update_count();
        let competitors = self.race.competitor_ids();
        let leg_length = self.windward_length(at);

        #[cfg(feature = "parallel")]
        let keys: Vec<RankKey> = competitors
            .par_iter()
            .map(|c| self.rank_key(c, at, leg_length))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let keys: Vec<RankKey> = competitors
            .iter()
            .map(|c| self.rank_key(c, at, leg_length))
            .collect();

        let mut ranked: Vec<(CompetitorId, RankKey)> = competitors.into_iter().zip(keys).collect();
        ranked.sort_by(|a, b| a.1.compare(&b.1));
        let ranking: Vec<CompetitorId> = ranked.into_iter().map(|(c, _)| c).collect();

        self.tracked
            .cache_ranking(at, ranking.clone(), seen, || self.race.update_count());
        ranking
    }

    /// Competitors with their 1-based rank in this leg.
    pub fn ranks(&self, at: TimePoint) -> Vec<(CompetitorId, usize)> {
        self.competitor_tracks_ordered_by_rank(at)
            .into_iter()
            .enumerate()
            .map(|(i, c)| (c, i + 1))
            .collect()
    }

    pub fn rank(&self, competitor: &CompetitorId, at: TimePoint) -> Option<usize> {
        self.competitor_tracks_ordered_by_rank(at)
            .iter()
            .position(|c| c == competitor)
            .map(|i| i + 1)
    }

    pub fn leader(&self, at: TimePoint) -> Option<CompetitorId> {
        self.competitor_tracks_ordered_by_rank(at).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_key_order() {
        let early = RankKey::Finished(TimePoint::from_millis(100));
        let late = RankKey::Finished(TimePoint::from_millis(200));
        let close = RankKey::Sailing(10.0);
        let far = RankKey::Sailing(5000.0);
        assert_eq!(early.compare(&late), Ordering::Less);
        assert_eq!(late.compare(&close), Ordering::Less);
        assert_eq!(far.compare(&late), Ordering::Greater);
        assert_eq!(close.compare(&far), Ordering::Less);
        assert_eq!(
            RankKey::Sailing(f64::INFINITY).compare(&RankKey::Sailing(f64::INFINITY)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_rank_cache_clear() {
        let leg = TrackedLeg::new(Leg {
            index: 0,
            from: "start".into(),
            to: "top".into(),
        });
        sync::lock(&leg.rank_cache).insert(TimePoint::from_millis(1), vec![]);
        assert_eq!(leg.cached_rank_count(), 1);
        leg.clear_rank_cache();
        assert_eq!(leg.cached_rank_count(), 0);
    }

    #[test]
    fn test_ranking_from_before_an_update_is_not_cached() {
        let leg = TrackedLeg::new(Leg {
            index: 0,
            from: "start".into(),
            to: "top".into(),
        });
        let at = TimePoint::from_millis(1);
        leg.cache_ranking(at, vec!["a".into()], 4, || 5);
        assert_eq!(leg.cached_rank_count(), 0);
        leg.cache_ranking(at, vec!["a".into()], 5, || 5);
        assert_eq!(leg.cached_rank_count(), 1);
    }
}
