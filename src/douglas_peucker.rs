//! # Douglas-Peucker Approximation
//!
//! Reduces a track to the fixes that matter for its shape. Deviation is the
//! great-circle cross-track distance from the line through the first fix of
//! a segment toward its last fix. A segment that starts and ends at the same
//! position, such as a full circle, measures the distance from that position.

use crate::geo_utils::{Distance, Position, TimePoint};

/// Segments shorter than this have no usable bearing.
const MIN_SEGMENT_METERS: f64 = 1e-3;

fn deviation(position: Position, line_start: Position, line_end: Position) -> f64 {
    if line_start.distance_to(line_end).meters() < MIN_SEGMENT_METERS {
        return line_start.distance_to(position).meters();
    }
    position
        .cross_track_error(line_start, line_start.bearing_to(line_end))
        .meters()
        .abs()
}
use crate::track::{Fix, Track};

/// Approximate the smoothed fixes of `track` in `[from, to]`. Every fix
/// that was dropped lies within `max_distance` of the approximated path.
pub fn approximate<F: Fix>(track: &Track<F>, max_distance: Distance, from: TimePoint, to: TimePoint) -> Vec<F> {
    simplify(&track.fixes_between(from, to), max_distance)
}

/// Douglas-Peucker over a fix sequence in time order.
pub fn simplify<F: Fix>(fixes: &[F], max_distance: Distance) -> Vec<F> {
    if fixes.len() <= 2 {
        return fixes.to_vec();
    }

    fn rdp_recursive<F: Fix>(
        fixes: &[F],
        start: usize,
        end: usize,
        max_distance: f64,
        keep: &mut Vec<bool>,
    ) {
        if end <= start + 1 {
            return;
        }

        let line_start = fixes[start].position();
        let line_end = fixes[end].position();

        let mut max_dist = 0.0;
        let mut max_idx = start;

        for (i, fix) in fixes.iter().enumerate().take(end).skip(start + 1) {
            let dist = deviation(fix.position(), line_start, line_end);
            if dist > max_dist {
                max_dist = dist;
                max_idx = i;
            }
        }

        if max_idx != start && max_dist >= max_distance {
            keep[max_idx] = true;
            rdp_recursive(fixes, start, max_idx, max_distance, keep);
            rdp_recursive(fixes, max_idx, end, max_distance, keep);
        }
    }

    let mut keep = vec![false; fixes.len()];
    keep[0] = true;
    keep[fixes.len() - 1] = true;

    rdp_recursive(fixes, 0, fixes.len() - 1, max_distance.meters(), &mut keep);

    fixes
        .iter()
        .zip(keep)
        .filter_map(|(f, k)| k.then(|| f.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::{Bearing, Position};
    use crate::track::{GpsFix, TrackConfig};

    fn fix(p: Position, s: i64) -> GpsFix {
        GpsFix::new(p, TimePoint::from_millis(s * 1000))
    }

    #[test]
    fn test_straight_line_reduces_to_endpoints() {
        let start = Position::new(54.0, 10.0);
        let fixes: Vec<GpsFix> = (0..20)
            .map(|i| fix(start.translate(Bearing::from_degrees(30.0), Distance::from_meters(5.0 * i as f64)), i))
            .collect();
        let simplified = simplify(&fixes, Distance::from_meters(1.0));
        assert_eq!(simplified.len(), 2);
        assert_eq!(simplified[0], fixes[0]);
        assert_eq!(simplified[1], fixes[19]);
    }

    #[test]
    fn test_corner_is_kept() {
        let start = Position::new(54.0, 10.0);
        let mut fixes = Vec::new();
        let mut p = start;
        for i in 0..20 {
            fixes.push(fix(p, i));
            let course = if i < 10 { 0.0 } else { 90.0 };
            p = p.translate(Bearing::from_degrees(course), Distance::from_meters(10.0));
        }
        let simplified = simplify(&fixes, Distance::from_meters(5.0));
        assert_eq!(simplified.len(), 3);
        assert_eq!(simplified[1], fixes[10]);
    }

    #[test]
    fn test_closed_loop_keeps_farthest_point() {
        // Out 50 m north and back to the start
        let start = Position::new(54.0, 10.0);
        let fixes: Vec<GpsFix> = (0..11)
            .map(|i| {
                let out = if i <= 5 { i } else { 10 - i };
                fix(start.translate(Bearing::from_degrees(0.0), Distance::from_meters(10.0 * out as f64)), i)
            })
            .collect();
        let simplified = simplify(&fixes, Distance::from_meters(5.0));
        assert_eq!(simplified.len(), 3);
        assert_eq!(simplified[1], fixes[5]);
    }

    #[test]
    fn test_approximate_track_interval() {
        let track: Track<GpsFix> = Track::new("dp", TrackConfig::default());
        let start = Position::new(54.0, 10.0);
        for i in 0..10 {
            track.add(fix(start.translate(Bearing::from_degrees(0.0), Distance::from_meters(5.0 * i as f64)), i));
        }
        let approximated = approximate(&track, Distance::from_meters(1.0), TimePoint::from_millis(2000), TimePoint::from_millis(6000));
        assert_eq!(approximated.len(), 2);
        assert_eq!(approximated[0].time_point, TimePoint::from_millis(2000));
        assert_eq!(approximated[1].time_point, TimePoint::from_millis(6000));
    }
}
