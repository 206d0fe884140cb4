//! Race-wide ranking across legs.

use std::cmp::Ordering;

use log::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::TrackedRace;
use crate::course::{CompetitorId, Course};
use crate::geo_utils::{Distance, TimePoint};
use crate::sync;

/// Progress of one competitor in the race at a time point.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RaceRankKey {
    waypoints_passed: usize,
    finished_at: Option<TimePoint>,
    distance_to_go_meters: f64,
}

impl RaceRankKey {
    const NOT_STARTED: RaceRankKey = RaceRankKey {
        waypoints_passed: 0,
        finished_at: None,
        distance_to_go_meters: 0.0,
    };

    /// More waypoints passed first, then earlier finish, then less
    /// windward distance to go in the current leg.
    fn compare(&self, other: &RaceRankKey) -> Ordering {
        other
            .waypoints_passed
            .cmp(&self.waypoints_passed)
            .then_with(|| match (self.finished_at, other.finished_at) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => Ordering::Equal,
            })
            .then_with(|| self.distance_to_go_meters.total_cmp(&other.distance_to_go_meters))
    }
}

impl TrackedRace {
    /// Queries later than the newest event answer as of the newest event.
    fn ranking_time_point(&self, at: TimePoint) -> TimePoint {
        match self.time_point_of_newest_event() {
            Some(newest) if at > newest => newest,
            _ => at,
        }
    }

    fn race_rank_key(&self, competitor: &CompetitorId, at: TimePoint, course: &Course) -> RaceRankKey {
        let last_passed = sync::read(&self.mark_passings)
            .last_passing_at_or_before(competitor, at)
            .cloned();
        let Some(last_passed) = last_passed else {
            return RaceRankKey::NOT_STARTED;
        };
        let Some(index) = course.index_of(&last_passed.waypoint) else {
            return RaceRankKey::NOT_STARTED;
        };
        if index + 1 == course.waypoints().len() {
            return RaceRankKey {
                waypoints_passed: index + 1,
                finished_at: Some(last_passed.time_point),
                distance_to_go_meters: 0.0,
            };
        }
        let to_go = self
            .tracked_leg_of_competitor(competitor, index)
            .ok()
            .and_then(|leg| leg.windward_distance_to_go_for_ranking(at));
        RaceRankKey {
            waypoints_passed: index + 1,
            finished_at: None,
            distance_to_go_meters: to_go.map_or(f64::INFINITY, Distance::meters),
        }
    }

    /// All competitors, best first. Ties, including everyone who has not
    /// started, are broken by competitor id.
    pub fn competitors_from_best_to_worst(&self, at: TimePoint) -> Vec<CompetitorId> {
        let at = self.ranking_time_point(at);
        let generation = self.derived.generation();
        let cached = sync::lock(&self.derived.rankings).get(&at).cloned();
        if let Some(ranking) = cached {
            return ranking;
        }

        let course = self.course();
        let competitors = self.competitor_ids();

        #[cfg(feature = "parallel")]
        let keys: Vec<RaceRankKey> = competitors
            .par_iter()
            .map(|c| self.race_rank_key(c, at, &course))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let keys: Vec<RaceRankKey> = competitors
            .iter()
            .map(|c| self.race_rank_key(c, at, &course))
            .collect();

        let mut ranked: Vec<(CompetitorId, RaceRankKey)> = competitors.into_iter().zip(keys).collect();
        ranked.sort_by(|a, b| a.1.compare(&b.1).then_with(|| a.0.cmp(&b.0)));
        let ranking: Vec<CompetitorId> = ranked.into_iter().map(|(c, _)| c).collect();

        debug!("[TrackedRace] Ranked {} competitors of {} at {}", ranking.len(), self.id, at);
        self.derived.cache_ranking(at, ranking.clone(), generation);
        ranking
    }

    /// 1-based rank in the race.
    pub fn rank(&self, competitor: &CompetitorId, at: TimePoint) -> Option<usize> {
        self.competitors_from_best_to_worst(at)
            .iter()
            .position(|c| c == competitor)
            .map(|i| i + 1)
    }

    pub fn overall_leader(&self, at: TimePoint) -> Option<CompetitorId> {
        self.competitors_from_best_to_worst(at).into_iter().next()
    }
}
