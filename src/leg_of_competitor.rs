//! # Leg of a Competitor
//!
//! One competitor's view of one leg: timing from mark passings, distances
//! and speeds from the competitor's track, windward progress from the race's
//! wind. Absent inputs (leg not started, no fix yet) yield `None`; a missing
//! wind direction where one is structurally required yields
//! [`RaceError::NoWind`](crate::error::RaceError::NoWind).

use std::sync::Arc;

use crate::course::CompetitorId;
use crate::error::Result;
use crate::geo_utils::{Distance, Position, Speed, SpeedWithBearing, TimePoint};
use crate::leg::TrackedLegRef;
use crate::maneuver::{self, Maneuver, ManeuverType};
use crate::track::{GpsFixMoving, Track};

pub struct TrackedLegOfCompetitor<'r> {
    leg: TrackedLegRef<'r>,
    competitor: CompetitorId,
    track: Arc<Track<GpsFixMoving>>,
}

impl<'r> TrackedLegOfCompetitor<'r> {
    pub(crate) fn new(leg: TrackedLegRef<'r>, competitor: CompetitorId, track: Arc<Track<GpsFixMoving>>) -> Self {
        Self {
            leg,
            competitor,
            track,
        }
    }

    pub fn competitor(&self) -> &CompetitorId {
        &self.competitor
    }

    pub fn leg(&self) -> &TrackedLegRef<'r> {
        &self.leg
    }

    pub fn track(&self) -> &Arc<Track<GpsFixMoving>> {
        &self.track
    }

    // ========================================================================
    // Timing
    // ========================================================================

    /// Passing of the leg's start waypoint.
    pub fn start_time(&self) -> Option<TimePoint> {
        self.leg
            .race()
            .mark_passing(&self.competitor, &self.leg.leg().from)
            .map(|p| p.time_point)
    }

    /// Passing of the leg's end waypoint.
    pub fn finish_time(&self) -> Option<TimePoint> {
        self.leg
            .race()
            .mark_passing(&self.competitor, &self.leg.leg().to)
            .map(|p| p.time_point)
    }

    pub fn has_started_leg(&self, at: TimePoint) -> bool {
        self.start_time().is_some_and(|t| t <= at)
    }

    pub fn has_finished_leg(&self, at: TimePoint) -> bool {
        self.finish_time().is_some_and(|t| t <= at)
    }

    /// Time spent in the leg up to `at`. Unknown for time points after the
    /// end of tracking when the leg was never finished.
    pub fn time_in_leg(&self, at: TimePoint) -> Option<i64> {
        let start = self.start_time().filter(|t| *t <= at)?;
        if let Some(finish) = self.finish_time().filter(|t| *t <= at) {
            return Some(finish.millis_since(start));
        }
        if self.leg.race().end_of_tracking().is_some_and(|end| at > end) {
            return None;
        }
        Some(at.millis_since(start))
    }

    /// End of the relevant interval: the leg finish if reached by `at`.
    fn end_in_leg(&self, at: TimePoint) -> TimePoint {
        self.finish_time().filter(|t| *t <= at).unwrap_or(at)
    }

    // ========================================================================
    // Distance and speed
    // ========================================================================

    pub fn distance_traveled(&self, at: TimePoint) -> Distance {
        match self.start_time().filter(|t| *t <= at) {
            Some(start) => self.track.distance_traveled(start, self.end_in_leg(at)),
            None => Distance::ZERO,
        }
    }

    pub fn average_speed_over_ground(&self, at: TimePoint) -> Option<Speed> {
        let start = self.start_time().filter(|t| *t <= at)?;
        let mut end = self.end_in_leg(at);
        if let Some(last) = self.track.last_raw_fix() {
            end = end.min(last.time_point.max(start));
        }
        self.track
            .distance_traveled(start, end)
            .in_time(end.millis_since(start))
    }

    pub fn maximum_speed_over_ground(&self, at: TimePoint) -> Option<(GpsFixMoving, Speed)> {
        let start = self.start_time().filter(|t| *t <= at)?;
        self.track.maximum_speed_over_ground(start, self.end_in_leg(at))
    }

    pub fn speed_over_ground(&self, at: TimePoint) -> Option<SpeedWithBearing> {
        if !self.has_started_leg(at) {
            return None;
        }
        self.track.estimated_speed(at)
    }

    /// Signed distance from the leg's rhumb line, positive to starboard.
    pub fn cross_track_error(&self, at: TimePoint) -> Option<Distance> {
        let position = self.track.last_known_position(at)?;
        self.leg.cross_track_error(position, at)
    }

    /// Mean absolute distance from the rhumb line over the fixes sailed in
    /// this leg up to `at`.
    pub fn average_absolute_cross_track_error(&self, at: TimePoint) -> Result<Option<Distance>> {
        let Some(start) = self.start_time().filter(|t| *t <= at) else {
            return Ok(None);
        };
        self.leg
            .race()
            .average_absolute_cross_track_error_between(&self.competitor, start, self.end_in_leg(at), false)
    }

    // ========================================================================
    // Windward progress
    // ========================================================================

    /// Where the competitor is for distance-to-go purposes: the leg start
    /// until the leg was started.
    fn progress_position(&self, at: TimePoint) -> Option<Position> {
        if self.has_started_leg(at) {
            self.track.last_known_position(at)
        } else {
            self.leg.race().approximate_position(&self.leg.leg().from, at)
        }
    }

    fn distance_to_go_with<D>(&self, at: TimePoint, mut distance: D) -> Result<Option<Distance>>
    where
        D: FnMut(Position, Position) -> Result<Distance>,
    {
        if self.has_finished_leg(at) {
            return Ok(Some(Distance::ZERO));
        }
        let Some(position) = self.progress_position(at) else {
            return Ok(None);
        };
        let mut best: Option<Distance> = None;
        for mark in self.leg.race().waypoint_mark_positions(&self.leg.leg().to, at) {
            let d = distance(position, mark)?;
            if best.map_or(true, |b| d.meters() < b.meters()) {
                best = Some(d);
            }
        }
        Ok(best)
    }

    /// Windward distance to the nearest mark of the leg's end waypoint.
    pub fn windward_distance_to_go(&self, at: TimePoint) -> Result<Option<Distance>> {
        self.distance_to_go_with(at, |from, to| self.leg.windward_distance(from, to, at))
    }

    /// Distance to go for ranking, projected on the leg axis while the wind
    /// is unknown.
    pub(crate) fn windward_distance_to_go_for_ranking(&self, at: TimePoint) -> Option<Distance> {
        self.distance_to_go_with(at, |from, to| {
            Ok(self.leg.windward_distance_or_leg_projection(from, to, at))
        })
        .ok()
        .flatten()
    }

    fn windward_speed(&self, speed: Option<SpeedWithBearing>, at: TimePoint) -> Result<Option<Speed>> {
        let (Some(speed), Some(position)) = (speed, self.track.last_known_position(at)) else {
            return Ok(None);
        };
        Ok(self
            .leg
            .progress_axis(position, at)?
            .map(|axis| Speed::from_knots(speed.project_to(axis).knots().abs())))
    }

    /// Speed over ground projected on the wind axis, or the leg axis on
    /// reaches.
    pub fn velocity_made_good(&self, at: TimePoint) -> Result<Option<Speed>> {
        self.windward_speed(self.speed_over_ground(at), at)
    }

    /// Windward distance covered in the leg divided by the time in the leg.
    pub fn average_velocity_made_good(&self, at: TimePoint) -> Result<Option<Speed>> {
        let Some(start) = self.start_time().filter(|t| *t <= at) else {
            return Ok(None);
        };
        let end = self.end_in_leg(at);
        let (Some(from), Some(to)) = (
            self.track.last_known_position(start),
            self.track.last_known_position(end),
        ) else {
            return Ok(None);
        };
        let distance = self.leg.windward_distance(from, to, end)?;
        Ok(distance.in_time(end.millis_since(start)))
    }

    // ========================================================================
    // Ranking and gaps
    // ========================================================================

    /// 1-based rank in this leg; `None` before the leg was started.
    pub fn rank(&self, at: TimePoint) -> Option<usize> {
        if !self.has_started_leg(at) {
            return None;
        }
        self.leg.rank(&self.competitor, at)
    }

    /// Seconds behind the leg's leader. For a leader that already finished
    /// the leg this is the time still needed at the current VMG plus the
    /// time since the leader finished.
    pub fn gap_to_leader_in_seconds(&self, at: TimePoint) -> Result<Option<f64>> {
        if !self.has_started_leg(at) {
            return Ok(None);
        }
        let Some(leader) = self.leg.leader(at) else {
            return Ok(None);
        };
        if leader == self.competitor {
            return Ok(Some(0.0));
        }
        let leader_leg = self.leg.competitor(&leader)?;
        if let Some(leader_finish) = leader_leg.finish_time().filter(|t| *t <= at) {
            if let Some(finish) = self.finish_time().filter(|t| *t <= at) {
                return Ok(Some(finish.millis_since(leader_finish) as f64 / 1000.0));
            }
            let to_go = self.windward_distance_to_go(at)?;
            let vmg = self.velocity_made_good(at)?;
            return Ok(seconds_at(to_go, vmg)
                .map(|s| s + at.millis_since(leader_finish) as f64 / 1000.0));
        }
        let (Some(ours), Some(theirs)) = (
            self.track.last_known_position(at),
            leader_leg.track.last_known_position(at),
        ) else {
            return Ok(None);
        };
        let behind = self.leg.windward_distance(ours, theirs, at)?;
        Ok(seconds_at(Some(behind), self.velocity_made_good(at)?))
    }

    /// Windward distance to go divided by the current VMG.
    pub fn estimated_time_to_next_mark_in_seconds(&self, at: TimePoint) -> Result<Option<f64>> {
        if self.has_finished_leg(at) {
            return Ok(Some(0.0));
        }
        let to_go = self.windward_distance_to_go(at)?;
        Ok(seconds_at(to_go, self.velocity_made_good(at)?))
    }

    /// Windward distance to the race leader, summed over the legs between
    /// this competitor and the leader.
    pub fn windward_distance_to_overall_leader(&self, at: TimePoint) -> Result<Option<Distance>> {
        match self.leg.race().overall_leader(at) {
            Some(leader) => self.windward_distance_to_competitor(&leader, at),
            None => Ok(None),
        }
    }

    /// Windward distance to the best-ranked competitor that is still
    /// sailing a leg; finishers are passed over.
    pub fn windward_distance_to_competitor_farthest_ahead(&self, at: TimePoint) -> Result<Option<Distance>> {
        let race = self.leg.race();
        let ahead = race
            .competitors_from_best_to_worst(at)
            .into_iter()
            .find(|c| race.current_leg_index(c, at).is_some());
        match ahead {
            Some(ahead) => self.windward_distance_to_competitor(&ahead, at),
            None => Ok(None),
        }
    }

    /// Windward distance to `other`, summed over the legs from this one to
    /// the leg `other` sails. `other` is assumed to be ahead.
    fn windward_distance_to_competitor(&self, other: &CompetitorId, at: TimePoint) -> Result<Option<Distance>> {
        let race = self.leg.race();
        if *other == self.competitor {
            return Ok(Some(Distance::ZERO));
        }
        let other_leg = race.current_leg(other, at).map(|l| l.leg().index());
        let Some(mut position) = self.progress_position(at) else {
            return Ok(None);
        };
        let mut total = Distance::ZERO;
        for index in self.leg.index()..race.leg_count() {
            let leg = race.tracked_leg(index)?;
            if other_leg == Some(index) {
                let Some(other_position) = race.competitor_track(other)?.last_known_position(at) else {
                    return Ok(None);
                };
                total += leg.windward_distance(position, other_position, at)?;
                return Ok(Some(total));
            }
            let Some(next) = race.approximate_position(&leg.leg().to, at) else {
                return Ok(None);
            };
            total += leg.windward_distance(position, next, at)?;
            position = next;
        }
        Ok(Some(total))
    }

    // ========================================================================
    // Maneuvers
    // ========================================================================

    /// Maneuvers sailed in this leg up to `at`.
    pub fn maneuvers(&self, at: TimePoint) -> Result<Vec<Maneuver>> {
        let Some(start) = self.start_time().filter(|t| *t <= at) else {
            return Ok(Vec::new());
        };
        self.leg
            .race()
            .maneuvers(&self.competitor, start, self.end_in_leg(at))
    }

    pub fn number_of_tacks(&self, at: TimePoint) -> Result<usize> {
        Ok(maneuver::count_of(&self.maneuvers(at)?, ManeuverType::Tack))
    }

    pub fn number_of_jibes(&self, at: TimePoint) -> Result<usize> {
        Ok(maneuver::count_of(&self.maneuvers(at)?, ManeuverType::Jibe))
    }

    pub fn number_of_penalty_circles(&self, at: TimePoint) -> Result<usize> {
        Ok(maneuver::count_of(&self.maneuvers(at)?, ManeuverType::PenaltyCircle))
    }

    /// Distance lost by a maneuver compared with sailing on at the entry
    /// velocity.
    pub fn maneuver_loss(&self, before: TimePoint, at: TimePoint, after: TimePoint) -> Option<Distance> {
        maneuver::maneuver_loss(
            &self.track,
            self.leg.race().boat_class().approximate_maneuver_duration_millis,
            before,
            at,
            after,
        )
    }
}

fn seconds_at(distance: Option<Distance>, speed: Option<Speed>) -> Option<f64> {
    let (distance, speed) = (distance?, speed?);
    if speed.meters_per_second() <= 0.0 {
        return None;
    }
    Some(distance.meters() / speed.meters_per_second())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_at() {
        let d = Some(Distance::from_meters(100.0));
        let s = Some(Speed::from_meters_per_second(4.0));
        assert_eq!(seconds_at(d, s), Some(25.0));
        assert_eq!(seconds_at(d, Some(Speed::ZERO)), None);
        assert_eq!(seconds_at(None, s), None);
    }
}
