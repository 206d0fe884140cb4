//! # Maneuver Detection
//!
//! Finds tacks, jibes, penalty circles, mark roundings and course
//! adjustments in a competitor's track.
//!
//! ## Pipeline
//!
//! 1. Approximate the track with Douglas-Peucker using the boat class's
//!    course approximation distance.
//! 2. Compute the course change at every interior approximation point. If
//!    the measured bearings show a turn of more than 180 degrees that the
//!    approximation reports in the opposite direction, the change is
//!    corrected to the long way round.
//! 3. Split the changes into runs of the same turn direction and group each
//!    run into maneuvers: a change joins the current group if it is no more
//!    than one maneuver duration and two hull lengths away from the group's
//!    last change.
//! 4. Classify each group, first match wins: penalty circle (more than 320
//!    degrees), mark passing (leg changed, except at the start), tack or
//!    jibe (turn passed through the wind), head-up or bear-away.

use serde::{Deserialize, Serialize};

use crate::boat_class::BoatClass;
use crate::douglas_peucker;
use crate::geo_utils::{Bearing, CourseChange, Distance, Position, SpeedWithBearing, TimePoint};
use crate::track::{GpsFixMoving, Track};
use crate::wind::Wind;

/// Turns beyond this many degrees are penalty circles.
pub const PENALTY_CIRCLE_THRESHOLD_DEGREES: f64 = 320.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManeuverType {
    Tack,
    Jibe,
    PenaltyCircle,
    MarkPassing,
    HeadUp,
    BearAway,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tack {
    Port,
    Starboard,
}

/// Tack of a boat sailing `boat_bearing` in `wind`. Wind coming over the
/// port side, or exactly from astern, is port tack.
pub fn tack(wind: &Wind, boat_bearing: Bearing) -> Tack {
    if wind.bearing().difference_to(boat_bearing) <= 0.0 {
        Tack::Port
    } else {
        Tack::Starboard
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Maneuver {
    pub maneuver_type: ManeuverType,
    pub tack_after: Option<Tack>,
    pub position: Option<Position>,
    pub time_point: TimePoint,
    pub time_point_before: TimePoint,
    pub time_point_after: TimePoint,
    pub speed_before: Option<SpeedWithBearing>,
    pub speed_after: Option<SpeedWithBearing>,
    /// Signed total course change, positive to starboard
    pub direction_change_degrees: f64,
    pub maneuver_loss: Option<Distance>,
}

/// Race knowledge maneuver detection needs for one competitor.
pub trait ManeuverContext {
    fn wind(&self, position: Option<Position>, at: TimePoint) -> Option<Wind>;

    /// Leg the competitor is sailing at `at`.
    fn leg_index(&self, at: TimePoint) -> Option<usize>;

    /// When the competitor started leg `leg_index`.
    fn leg_start_time(&self, leg_index: usize) -> Option<TimePoint>;
}

/// Course change at one approximation point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CourseChangeAtFix {
    pub fix: GpsFixMoving,
    /// Velocity on the approximated segment arriving at `fix`
    pub inbound: SpeedWithBearing,
    pub course_change: CourseChange,
}

// ============================================================================
// Classification
// ============================================================================

/// Whether turning `change_degrees` from `start` sweeps across `target`.
pub fn turn_passes_through(start: Bearing, change_degrees: f64, target: Bearing) -> bool {
    if change_degrees > 0.0 {
        let d = (target.degrees() - start.degrees()).rem_euclid(360.0);
        d > 0.0 && d <= change_degrees
    } else if change_degrees < 0.0 {
        let d = (start.degrees() - target.degrees()).rem_euclid(360.0);
        d > 0.0 && d <= -change_degrees
    } else {
        false
    }
}

/// Classify a grouped course change.
pub fn classify(
    total_course_change_degrees: f64,
    course_before: Bearing,
    leg_changed: bool,
    at_start: bool,
    wind: Option<&Wind>,
) -> ManeuverType {
    if total_course_change_degrees.abs() > PENALTY_CIRCLE_THRESHOLD_DEGREES {
        return ManeuverType::PenaltyCircle;
    }
    if leg_changed && !at_start {
        return ManeuverType::MarkPassing;
    }
    let Some(wind) = wind else {
        return ManeuverType::Unknown;
    };
    if turn_passes_through(course_before, total_course_change_degrees, wind.from()) {
        return ManeuverType::Tack;
    }
    if turn_passes_through(course_before, total_course_change_degrees, wind.bearing()) {
        return ManeuverType::Jibe;
    }
    let course_after = course_before.add_degrees(total_course_change_degrees);
    let off_wind_before = wind.bearing().difference_to(course_before).abs();
    let off_wind_after = wind.bearing().difference_to(course_after).abs();
    if off_wind_before < off_wind_after {
        ManeuverType::HeadUp
    } else {
        ManeuverType::BearAway
    }
}

// ============================================================================
// Course changes and grouping
// ============================================================================

/// Sum of the measured bearing changes of the smoothed fixes after `start`
/// up to and including `end`.
fn measured_course_change(track: &Track<GpsFixMoving>, start: TimePoint, end: TimePoint) -> f64 {
    track
        .fixes_between(start.plus(1), end)
        .windows(2)
        .map(|pair| pair[0].speed.bearing.difference_to(pair[1].speed.bearing))
        .sum()
}

/// Course changes at the interior points of `approximated`.
pub fn course_changes_along(
    approximated: &[GpsFixMoving],
    track: &Track<GpsFixMoving>,
) -> Vec<CourseChangeAtFix> {
    let mut changes = Vec::new();
    for window in approximated.windows(3) {
        let (previous, current, next) = (&window[0], &window[1], &window[2]);
        let (Some(inbound), Some(outbound)) = (
            SpeedWithBearing::between(previous.position, previous.time_point, current.position, current.time_point),
            SpeedWithBearing::between(current.position, current.time_point, next.position, next.time_point),
        ) else {
            continue;
        };
        let mut course_change = inbound.course_change_required_to_reach(outbound);
        let measured = measured_course_change(track, previous.time_point, next.time_point);
        if measured.abs() > 180.0
            && measured.signum() != course_change.course_change_degrees.signum()
        {
            let approximated_degrees = course_change.course_change_degrees;
            course_change.course_change_degrees =
                -approximated_degrees.signum() * (360.0 - approximated_degrees.abs());
        }
        changes.push(CourseChangeAtFix {
            fix: *current,
            inbound,
            course_change,
        });
    }
    changes
}

/// Group course changes into maneuver candidates.
pub fn group_course_changes(
    changes: &[CourseChangeAtFix],
    max_gap_millis: i64,
    max_distance: Distance,
) -> Vec<Vec<CourseChangeAtFix>> {
    let mut groups: Vec<Vec<CourseChangeAtFix>> = Vec::new();
    let mut current: Vec<CourseChangeAtFix> = Vec::new();
    for change in changes {
        if let Some(last) = current.last() {
            let same_direction = last.course_change.course_change_degrees.signum()
                == change.course_change.course_change_degrees.signum();
            let close_in_time = change.fix.time_point.millis_since(last.fix.time_point) <= max_gap_millis;
            let close_in_space = last.fix.position.distance_to(change.fix.position) <= max_distance;
            if !(same_direction && close_in_time && close_in_space) {
                groups.push(std::mem::take(&mut current));
            }
        }
        current.push(*change);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

// ============================================================================
// Detection
// ============================================================================

/// Detect the maneuvers between `from` and `to`, in time order.
pub fn detect_maneuvers<C: ManeuverContext + ?Sized>(
    track: &Track<GpsFixMoving>,
    boat_class: &BoatClass,
    context: &C,
    from: TimePoint,
    to: TimePoint,
) -> Vec<Maneuver> {
    let approximated =
        douglas_peucker::approximate(track, boat_class.max_course_approximation_distance, from, to);
    if approximated.len() <= 2 {
        return Vec::new();
    }
    let changes = course_changes_along(&approximated, track);
    let duration = boat_class.approximate_maneuver_duration_millis;
    let groups = group_course_changes(&changes, duration, boat_class.hull_length.scale(2.0));

    let mut maneuvers: Vec<Maneuver> = groups
        .iter()
        .filter_map(|group| maneuver_from_group(track, boat_class, context, group, from, to))
        .collect();
    maneuvers.sort_by_key(|m| m.time_point);
    maneuvers
}

fn maneuver_from_group<C: ManeuverContext + ?Sized>(
    track: &Track<GpsFixMoving>,
    boat_class: &BoatClass,
    context: &C,
    group: &[CourseChangeAtFix],
    from: TimePoint,
    to: TimePoint,
) -> Option<Maneuver> {
    let first = group.first()?;
    let last = group.last()?;
    let total: f64 = group.iter().map(|c| c.course_change.course_change_degrees).sum();
    if total.abs() < boat_class.maneuver_degree_threshold {
        return None;
    }

    let duration = boat_class.approximate_maneuver_duration_millis;
    let time_point_before = first.fix.time_point.minus(duration / 2).max(from);
    let time_point_after = last.fix.time_point.plus(duration / 2).min(to);
    let sharpest = group
        .iter()
        .max_by(|a, b| {
            a.course_change
                .course_change_degrees
                .abs()
                .total_cmp(&b.course_change.course_change_degrees.abs())
        })
        .unwrap_or(first);
    let mut time_point = sharpest.fix.time_point;
    let mut position = track.last_known_position(time_point);

    let speed_before = track.estimated_speed(time_point_before);
    let speed_after = track.estimated_speed(time_point_after);
    let wind = context.wind(position, time_point);
    let tack_after = match (&wind, speed_after) {
        (Some(w), Some(s)) => Some(tack(w, s.bearing)),
        _ => None,
    };

    let leg_before = context.leg_index(time_point_before);
    let leg_after = context.leg_index(time_point_after);
    let leg_changed = leg_after.is_some() && leg_before != leg_after;
    let at_start = leg_after == Some(0);

    let maneuver_type = classify(total, first.inbound.bearing, leg_changed, at_start, wind.as_ref());
    let maneuver_loss = match maneuver_type {
        ManeuverType::MarkPassing => {
            if let Some(passed) = leg_after.and_then(|leg| context.leg_start_time(leg)) {
                time_point = passed;
                position = track.last_known_position(passed);
            }
            None
        }
        ManeuverType::HeadUp | ManeuverType::BearAway => None,
        _ => maneuver_loss(track, duration, time_point_before, time_point, time_point_after),
    };

    Some(Maneuver {
        maneuver_type,
        tack_after,
        position,
        time_point,
        time_point_before,
        time_point_after,
        speed_before,
        speed_after,
        direction_change_degrees: total,
        maneuver_loss,
    })
}

// ============================================================================
// Maneuver loss
// ============================================================================

/// Distance lost by maneuvering, measured along the mean of the courses
/// before and after.
///
/// The analysis window runs from one maneuver duration before `before` to
/// three durations after `after`. Within it, the speed minimum that best
/// combines low speed and closeness to `at` marks the bottom of the
/// maneuver; the nearest speed maxima around it mark where the boat started
/// to slow down and where it was up to speed again. Sailing on at the
/// initial velocity is compared with where the boat actually got to.
pub fn maneuver_loss(
    track: &Track<GpsFixMoving>,
    approximate_maneuver_duration_millis: i64,
    before: TimePoint,
    at: TimePoint,
    after: TimePoint,
) -> Option<Distance> {
    let duration = approximate_maneuver_duration_millis.max(1);
    let fixes = track.fixes_between(before.minus(duration), after.plus(3 * duration));
    if fixes.len() < 2 {
        return None;
    }
    let speeds: Vec<f64> = fixes
        .iter()
        .map(|f| track.estimated_speed(f.time_point).map_or(0.0, |s| s.knots()))
        .collect();

    let mut maxima = Vec::new();
    let mut minima = Vec::new();
    for i in 1..fixes.len() - 1 {
        if speeds[i] > speeds[i - 1] && speeds[i] > speeds[i + 1] {
            maxima.push(i);
        } else if speeds[i] < speeds[i - 1] && speeds[i] < speeds[i + 1] {
            minima.push(i);
        }
    }

    let lowest = minima.iter().map(|&i| speeds[i]).fold(f64::INFINITY, f64::min);
    let highest = maxima.iter().map(|&i| speeds[i]).fold(f64::NEG_INFINITY, f64::max);
    let bottom = if maxima.is_empty() || minima.is_empty() {
        0
    } else {
        let spread = (highest - lowest).max(f64::EPSILON);
        minima
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let badness = |i: usize| {
                    let speed_badness = 1.0 + (speeds[i] - lowest) / spread;
                    let time_badness = 1.0
                        + fixes[i].time_point.millis_since(at).abs() as f64 / duration as f64 / 10.0;
                    speed_badness * time_badness
                };
                badness(a).total_cmp(&badness(b))
            })
            .unwrap_or(0)
    };

    // Walk to the nearest maximum on each side, continuing to a higher one
    // if it follows within one maneuver duration.
    let mut start = 0;
    if let Some(pos) = maxima.iter().rposition(|&i| i < bottom) {
        let mut k = pos;
        while k > 0
            && speeds[maxima[k - 1]] > speeds[maxima[k]]
            && fixes[maxima[k]].time_point.millis_since(fixes[maxima[k - 1]].time_point) < duration
        {
            k -= 1;
        }
        start = maxima[k];
    }
    let mut end = fixes.len() - 1;
    if let Some(pos) = maxima.iter().position(|&i| i > bottom) {
        let mut k = pos;
        while k + 1 < maxima.len()
            && speeds[maxima[k + 1]] > speeds[maxima[k]]
            && fixes[maxima[k + 1]].time_point.millis_since(fixes[maxima[k]].time_point) < duration
        {
            k += 1;
        }
        end = maxima[k];
    }

    let t0 = fixes[start].time_point;
    let t1 = fixes[end].time_point;
    let speed_at_start = track.estimated_speed(t0)?;
    let speed_at_end = track.estimated_speed(t1)?;
    let mean_course = speed_at_start.bearing.middle(speed_at_end.bearing);
    let p0 = track.last_known_position(t0)?;
    let actual = track.last_known_position(t1)?;
    let extrapolated = speed_at_start.travel(p0, t1.millis_since(t0));
    let projected_actual = actual.project_to_line(p0, mean_course);
    let projected_extrapolated = extrapolated.project_to_line(p0, mean_course);
    Some(projected_actual.distance_to(projected_extrapolated))
}

/// Number of maneuvers of one type.
pub fn count_of(maneuvers: &[Maneuver], maneuver_type: ManeuverType) -> usize {
    maneuvers
        .iter()
        .filter(|m| m.maneuver_type == maneuver_type)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::Speed;
    use crate::track::TrackConfig;

    struct FixedWind {
        from_degrees: f64,
        leg: Option<usize>,
    }

    impl ManeuverContext for FixedWind {
        fn wind(&self, position: Option<Position>, at: TimePoint) -> Option<Wind> {
            Some(Wind::from_direction(position, at, 12.0, self.from_degrees))
        }

        fn leg_index(&self, _at: TimePoint) -> Option<usize> {
            self.leg
        }

        fn leg_start_time(&self, _leg_index: usize) -> Option<TimePoint> {
            None
        }
    }

    fn north_wind() -> Wind {
        Wind::from_direction(None, TimePoint::from_millis(0), 12.0, 0.0)
    }

    /// Boat sailing `courses[i]` for `seconds_per_course` seconds each at
    /// 5 knots with one fix per second.
    fn sail(courses: &[f64], seconds_per_course: i64) -> Track<GpsFixMoving> {
        let track = Track::new("boat", TrackConfig::default());
        let speed = Speed::from_knots(5.0);
        let mut position = Position::new(54.4, 10.2);
        let mut t = 0;
        for &course in courses {
            let bearing = Bearing::from_degrees(course);
            for _ in 0..seconds_per_course {
                let swb = SpeedWithBearing::new(speed, bearing);
                track.add(GpsFixMoving::new(position, TimePoint::from_millis(t * 1000), swb));
                position = swb.travel(position, 1000);
                t += 1;
            }
        }
        track
    }

    #[test]
    fn test_tack_side() {
        let wind = north_wind();
        assert_eq!(tack(&wind, Bearing::from_degrees(45.0)), Tack::Port);
        assert_eq!(tack(&wind, Bearing::from_degrees(315.0)), Tack::Starboard);
    }

    #[test]
    fn test_turn_passes_through() {
        let start = Bearing::from_degrees(45.0);
        assert!(turn_passes_through(start, -90.0, Bearing::from_degrees(0.0)));
        assert!(!turn_passes_through(start, 90.0, Bearing::from_degrees(0.0)));
        assert!(turn_passes_through(start, 330.0, Bearing::from_degrees(0.0)));
        assert!(!turn_passes_through(start, 0.0, start));
    }

    #[test]
    fn test_penalty_circle_boundary() {
        let wind = north_wind();
        let before = Bearing::from_degrees(45.0);
        assert_eq!(classify(321.0, before, false, false, Some(&wind)), ManeuverType::PenaltyCircle);
        assert_eq!(classify(-321.0, before, false, false, None), ManeuverType::PenaltyCircle);
        assert_ne!(classify(319.0, before, false, false, Some(&wind)), ManeuverType::PenaltyCircle);
        assert_ne!(classify(320.0, before, false, false, Some(&wind)), ManeuverType::PenaltyCircle);
    }

    #[test]
    fn test_classification_order() {
        let wind = north_wind();
        let close_hauled = Bearing::from_degrees(45.0);
        let running = Bearing::from_degrees(150.0);
        assert_eq!(classify(-90.0, close_hauled, true, false, Some(&wind)), ManeuverType::MarkPassing);
        assert_eq!(classify(-90.0, close_hauled, true, true, Some(&wind)), ManeuverType::Tack);
        assert_eq!(classify(60.0, running, false, false, Some(&wind)), ManeuverType::Jibe);
        assert_eq!(classify(-30.0, close_hauled, false, false, Some(&wind)), ManeuverType::HeadUp);
        assert_eq!(classify(30.0, close_hauled, false, false, Some(&wind)), ManeuverType::BearAway);
        assert_eq!(classify(30.0, close_hauled, false, false, None), ManeuverType::Unknown);
    }

    #[test]
    fn test_grouping_splits_on_direction_and_distance() {
        let fix = |s: i64, lat: f64| {
            GpsFixMoving::new(
                Position::new(lat, 0.0),
                TimePoint::from_millis(s * 1000),
                SpeedWithBearing::default(),
            )
        };
        let change = |fix: GpsFixMoving, degrees: f64| CourseChangeAtFix {
            fix,
            inbound: SpeedWithBearing::default(),
            course_change: CourseChange {
                course_change_degrees: degrees,
                speed_change_knots: 0.0,
            },
        };
        let changes = vec![
            change(fix(0, 0.0), 40.0),
            change(fix(2, 0.00001), 50.0),
            change(fix(4, 0.00002), -30.0),
            change(fix(60, 0.01), -20.0),
        ];
        let groups = group_course_changes(&changes, 8000, Distance::from_meters(10.0));
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }

    #[test]
    fn test_detects_tack() {
        let track = sail(&[45.0, 315.0], 60);
        let class = BoatClass::by_name("ILCA 7").unwrap();
        let context = FixedWind {
            from_degrees: 0.0,
            leg: Some(1),
        };
        let maneuvers = detect_maneuvers(
            &track,
            &class,
            &context,
            TimePoint::from_millis(0),
            TimePoint::from_millis(119_000),
        );
        assert_eq!(maneuvers.len(), 1);
        let tack_maneuver = &maneuvers[0];
        assert_eq!(tack_maneuver.maneuver_type, ManeuverType::Tack);
        assert_eq!(tack_maneuver.tack_after, Some(Tack::Starboard));
        assert!((tack_maneuver.direction_change_degrees + 90.0).abs() < 5.0);
        assert!((tack_maneuver.time_point.millis() - 59_000).abs() <= 1_000);
        assert_eq!(count_of(&maneuvers, ManeuverType::Tack), 1);
    }

    #[test]
    fn test_straight_line_has_no_maneuvers() {
        let track = sail(&[80.0], 90);
        let context = FixedWind {
            from_degrees: 0.0,
            leg: Some(1),
        };
        let maneuvers = detect_maneuvers(
            &track,
            &BoatClass::default(),
            &context,
            TimePoint::from_millis(0),
            TimePoint::from_millis(89_000),
        );
        assert!(maneuvers.is_empty());
    }

    #[test]
    fn test_no_loss_without_speed_change() {
        let track = sail(&[10.0], 60);
        let loss = maneuver_loss(
            &track,
            6000,
            TimePoint::from_millis(20_000),
            TimePoint::from_millis(25_000),
            TimePoint::from_millis(30_000),
        )
        .unwrap();
        assert!(loss.meters() < 1.0, "loss {}", loss.meters());
    }
}
