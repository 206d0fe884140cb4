//! Per-competitor figures over the whole race: tack, distance and speed
//! since the start, cross-track error, rank changes, start line analytics,
//! plus the race's own start, end and live window.

use super::{RaceStatus, TrackedRace};
use crate::course::CompetitorId;
use crate::error::{OptionExt, Result};
use crate::geo_utils::{Distance, Position, Speed, SpeedWithBearing, TimePoint};
use crate::leg::LegType;
use crate::maneuver::{self, Tack};
use crate::sync;

/// Which cross-track figure to average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrossTrackSign {
    Absolute,
    Signed,
}

impl TrackedRace {
    // ========================================================================
    // Tack
    // ========================================================================

    /// Tack sailed at `at`, from the estimated course and the combined
    /// wind at the estimated position. `None` while the course is unknown.
    pub fn tack(&self, competitor: &CompetitorId, at: TimePoint) -> Result<Option<Tack>> {
        let track = self.competitor_track(competitor)?;
        let Some(speed) = track.estimated_speed(at) else {
            return Ok(None);
        };
        let position = track.estimated_position(at, false);
        let wind = self
            .wind(position, at)
            .ok_or_no_wind(&format!("cannot determine tack of {} at {}", competitor, at))?;
        Ok(Some(maneuver::tack(&wind, speed.bearing)))
    }

    // ========================================================================
    // Distance and speed since the start
    // ========================================================================

    /// Distance sailed from the start passing up to `at`, or up to the
    /// finish if it was crossed before. Unknown before the start and for a
    /// competitor that stopped tracking without finishing its leg.
    pub fn distance_traveled(&self, competitor: &CompetitorId, at: TimePoint) -> Result<Option<Distance>> {
        let track = self.competitor_track(competitor)?;
        let passings = self.mark_passings_of(competitor);
        let (Some(first), Some(last)) = (passings.first(), passings.last()) else {
            return Ok(None);
        };
        let finish = sync::read(&self.course).last_waypoint().map(|w| w.id.clone());
        let end = if finish.as_ref() == Some(&last.waypoint) && at > last.time_point {
            last.time_point
        } else {
            let Some(leg) = self.current_leg(competitor, at) else {
                return Ok(None);
            };
            if let Some(end_of_tracking) = self.end_of_tracking() {
                let no_more_data = at > end_of_tracking || self.status().status == RaceStatus::Finished;
                if no_more_data && !leg.has_finished_leg(end_of_tracking) {
                    return Ok(None);
                }
            }
            at
        };
        Ok(Some(track.distance_traveled(first.time_point, end)))
    }

    /// Distance over time summed across the legs started by `at`.
    pub fn average_speed_over_ground(&self, competitor: &CompetitorId, at: TimePoint) -> Result<Option<Speed>> {
        let mut distance = Distance::ZERO;
        let mut millis = 0;
        for leg in self.legs() {
            let leg = leg.competitor(competitor)?;
            if !leg.has_started_leg(at) {
                continue;
            }
            distance += leg.distance_traveled(at);
            millis += leg.time_in_leg(at).unwrap_or(0);
        }
        if millis == 0 || distance.meters() == 0.0 {
            return Ok(None);
        }
        Ok(distance.in_time(millis))
    }

    // ========================================================================
    // Cross-track error
    // ========================================================================

    /// Mean distance from the legs' rhumb lines over the upwind legs sailed
    /// since the start.
    pub fn average_absolute_cross_track_error(
        &self,
        competitor: &CompetitorId,
        at: TimePoint,
    ) -> Result<Option<Distance>> {
        match self.first_passing_time(competitor) {
            Some(from) => self.average_absolute_cross_track_error_between(competitor, from, at, true),
            None => Ok(None),
        }
    }

    /// As [`Self::average_absolute_cross_track_error`], keeping the sign:
    /// positive means the competitor favoured the starboard side.
    pub fn average_signed_cross_track_error(
        &self,
        competitor: &CompetitorId,
        at: TimePoint,
    ) -> Result<Option<Distance>> {
        match self.first_passing_time(competitor) {
            Some(from) => self.average_signed_cross_track_error_between(competitor, from, at, true),
            None => Ok(None),
        }
    }

    pub fn average_absolute_cross_track_error_between(
        &self,
        competitor: &CompetitorId,
        from: TimePoint,
        to: TimePoint,
        upwind_only: bool,
    ) -> Result<Option<Distance>> {
        self.average_cross_track_error(competitor, from, to, upwind_only, CrossTrackSign::Absolute)
    }

    pub fn average_signed_cross_track_error_between(
        &self,
        competitor: &CompetitorId,
        from: TimePoint,
        to: TimePoint,
        upwind_only: bool,
    ) -> Result<Option<Distance>> {
        self.average_cross_track_error(competitor, from, to, upwind_only, CrossTrackSign::Signed)
    }

    /// Average over the valid fixes in `[from, to]`, each measured against
    /// the leg sailed at its time. Fixes outside any leg are skipped.
    fn average_cross_track_error(
        &self,
        competitor: &CompetitorId,
        from: TimePoint,
        to: TimePoint,
        upwind_only: bool,
        sign: CrossTrackSign,
    ) -> Result<Option<Distance>> {
        let track = self.competitor_track(competitor)?;
        let mut sum = 0.0;
        let mut count = 0usize;
        for fix in track.fixes_between(from, to) {
            let Some(index) = self.current_leg_index(competitor, fix.time_point) else {
                continue;
            };
            let leg = self.tracked_leg(index)?;
            if upwind_only && leg.leg_type(fix.time_point)? != LegType::Upwind {
                continue;
            }
            let Some(error) = leg.cross_track_error(fix.position, fix.time_point) else {
                continue;
            };
            sum += match sign {
                CrossTrackSign::Absolute => error.meters().abs(),
                CrossTrackSign::Signed => error.meters(),
            };
            count += 1;
        }
        Ok((count > 0).then(|| Distance::from_meters(sum / count as f64)))
    }

    // ========================================================================
    // Ranks and distances between competitors
    // ========================================================================

    /// Places gained (negative) or lost (positive) in leg `leg_index`
    /// compared with the previous leg. The first leg compares with zero.
    pub fn rank_difference(&self, competitor: &CompetitorId, leg_index: usize, at: TimePoint) -> Result<Option<i64>> {
        let Some(current) = self.tracked_leg_of_competitor(competitor, leg_index)?.rank(at) else {
            return Ok(None);
        };
        let previous = match leg_index {
            0 => 0,
            _ => match self.tracked_leg_of_competitor(competitor, leg_index - 1)?.rank(at) {
                Some(rank) => rank,
                None => return Ok(None),
            },
        };
        Ok(Some(current as i64 - previous as i64))
    }

    /// Windward distance to the best-ranked competitor still racing. `None`
    /// when the competitor is not sailing a leg at `at`.
    pub fn windward_distance_to_competitor_farthest_ahead(
        &self,
        competitor: &CompetitorId,
        at: TimePoint,
    ) -> Result<Option<Distance>> {
        self.competitor_track(competitor)?;
        match self.current_leg(competitor, at) {
            Some(leg) => leg.windward_distance_to_competitor_farthest_ahead(at),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Start line
    // ========================================================================

    /// Distance to the start line: to the nearer end when the competitor is
    /// beyond either end, otherwise to its foot on the line. A single-mark
    /// start measures to that mark.
    pub fn distance_to_start_line(&self, competitor: &CompetitorId, at: TimePoint) -> Result<Option<Distance>> {
        let track = self.competitor_track(competitor)?;
        let Some(position) = track.estimated_position(at, false) else {
            return Ok(None);
        };
        let marks = match sync::read(&self.course).first_waypoint() {
            Some(start) => start.marks.clone(),
            None => return Ok(None),
        };
        let mut ends = Vec::with_capacity(2);
        for mark in marks.iter().take(2) {
            match self.mark_track(mark).ok().and_then(|t| t.estimated_position(at, false)) {
                Some(p) => ends.push(p),
                None => return Ok(None),
            }
        }
        Ok(match ends.as_slice() {
            [pin] => Some(position.distance_to(*pin)),
            [first, second] => Some(distance_to_line(position, *first, *second)),
            _ => None,
        })
    }

    /// [`Self::distance_to_start_line`] `millis_before_start` before the
    /// start of the race.
    pub fn distance_to_start_line_before_start(
        &self,
        competitor: &CompetitorId,
        millis_before_start: i64,
    ) -> Result<Option<Distance>> {
        match self.start_of_race() {
            Some(start) => self.distance_to_start_line(competitor, start.minus(millis_before_start)),
            None => Ok(None),
        }
    }

    /// Estimated velocity at the competitor's start passing.
    pub fn speed_when_crossing_start_line(&self, competitor: &CompetitorId) -> Result<Option<SpeedWithBearing>> {
        let track = self.competitor_track(competitor)?;
        Ok(self
            .first_passing_time(competitor)
            .and_then(|start| track.estimated_speed(start)))
    }

    fn first_passing_time(&self, competitor: &CompetitorId) -> Option<TimePoint> {
        sync::read(&self.mark_passings)
            .passings_of(competitor)
            .first()
            .map(|p| p.time_point)
    }

    // ========================================================================
    // Race window
    // ========================================================================

    /// Last passing of the finish waypoint by any competitor.
    pub fn end_of_race(&self) -> Option<TimePoint> {
        let finish = sync::read(&self.course).last_waypoint()?.id.clone();
        sync::read(&self.mark_passings)
            .passings_in_order(&finish)
            .iter()
            .map(|p| p.time_point)
            .max()
    }

    pub fn has_started(&self, at: TimePoint) -> bool {
        self.start_of_race().is_some_and(|start| start <= at)
    }

    /// Whether `at` lies in the live window. The window opens the pre-start
    /// phase before the start (or at the start of tracking) and closes a
    /// grace period after the end of the race, or after the newest event
    /// plus the delay to live while the race is still running. A race
    /// without competitor fixes or measured wind is never live.
    pub fn is_live(&self, at: TimePoint) -> bool {
        if !self.has_gps_data() || !self.has_wind_data() {
            return false;
        }
        let config = self.config();
        let opens = match self.start_of_race() {
            Some(start) => Some(start.minus(config.pre_start_phase_millis)),
            None => self.times().start_of_tracking,
        };
        let closes = match self.end_of_race() {
            Some(end) => Some(end.plus(config.live_grace_period_millis)),
            None => self
                .time_point_of_newest_event()
                .map(|newest| newest.plus(config.live_grace_period_millis + config.delay_to_live_millis)),
        };
        match (opens, closes) {
            (Some(opens), Some(closes)) => opens <= at && at <= closes,
            _ => false,
        }
    }

    pub fn has_gps_data(&self) -> bool {
        self.competitor_tracks.values().any(|t| !t.is_empty())
    }

    /// Whether any measured source has recorded wind.
    pub fn has_wind_data(&self) -> bool {
        sync::read(&self.wind_tracks).values().any(|t| !t.is_empty())
    }
}

/// Distance from `position` to the segment between `first` and `second`.
fn distance_to_line(position: Position, first: Position, second: Position) -> Distance {
    let line = first.bearing_to(second);
    if line.difference_to(first.bearing_to(position)).abs() > 90.0 {
        return position.distance_to(first);
    }
    if line.reverse().difference_to(second.bearing_to(position)).abs() > 90.0 {
        return position.distance_to(second);
    }
    position.distance_to(position.project_to_line(first, line))
}
