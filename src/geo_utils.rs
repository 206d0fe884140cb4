//! # Geographic Primitives
//!
//! Value types for positions, bearings, distances, speeds and time points,
//! plus the great-circle operations the tracks and legs are built on.
//! Everything here is `Copy`, immutable and lock-free.
//!
//! Distances and bearings delegate to `geo`'s haversine implementation;
//! cross-track and along-track distances use the spherical formulas on the
//! same earth radius so the two never disagree.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use chrono::{DateTime, TimeZone, Utc};
use geo::{Bearing as _, Destination, Distance as _, Haversine, Point};
use serde::{Deserialize, Serialize};

/// Mean earth radius used by `geo`'s haversine measures
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Metres per second in one knot
pub const METERS_PER_SECOND_PER_KNOT: f64 = 1852.0 / 3600.0;

/// Metres in one nautical mile
pub const METERS_PER_NAUTICAL_MILE: f64 = 1852.0;

// ============================================================================
// Time
// ============================================================================

/// Instant in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TimePoint(i64);

impl TimePoint {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * 1000.0).round() as i64)
    }

    pub const fn millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }

    pub const MIN: TimePoint = TimePoint(i64::MIN);
    pub const MAX: TimePoint = TimePoint(i64::MAX);

    pub const fn plus(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    pub const fn minus(self, millis: i64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// Milliseconds from `earlier` to `self` (negative if `earlier` is later).
    pub const fn millis_since(self, earlier: TimePoint) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Point halfway between two instants.
    pub fn middle(self, other: TimePoint) -> TimePoint {
        Self(self.0 + (other.0 - self.0) / 2)
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

// ============================================================================
// Bearing
// ============================================================================

/// Direction in degrees clockwise from true north, normalized to [0, 360).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Bearing(f64);

impl Bearing {
    pub fn from_degrees(degrees: f64) -> Self {
        let normalized = degrees.rem_euclid(360.0);
        // rem_euclid can round up to exactly 360.0 for tiny negative inputs
        Self(if normalized >= 360.0 { 0.0 } else { normalized })
    }

    pub fn from_radians(radians: f64) -> Self {
        Self::from_degrees(radians.to_degrees())
    }

    pub fn degrees(self) -> f64 {
        self.0
    }

    pub fn radians(self) -> f64 {
        self.0.to_radians()
    }

    pub fn reverse(self) -> Self {
        Self::from_degrees(self.0 + 180.0)
    }

    pub fn add_degrees(self, degrees: f64) -> Self {
        Self::from_degrees(self.0 + degrees)
    }

    /// Signed angle to turn from `self` to `other`, in (-180, 180].
    /// Positive means turning clockwise (to starboard).
    pub fn difference_to(self, other: Bearing) -> f64 {
        let diff = (other.0 - self.0).rem_euclid(360.0);
        if diff > 180.0 {
            diff - 360.0
        } else {
            diff
        }
    }

    /// Bisector of the smaller angle between the two bearings.
    pub fn middle(self, other: Bearing) -> Bearing {
        self.add_degrees(self.difference_to(other) / 2.0)
    }
}

// ============================================================================
// Distance and Speed
// ============================================================================

/// Distance in metres. May be negative for signed quantities such as
/// cross-track error.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Distance(f64);

impl Distance {
    pub const ZERO: Distance = Distance(0.0);

    pub const fn from_meters(meters: f64) -> Self {
        Self(meters)
    }

    pub fn from_nautical_miles(nm: f64) -> Self {
        Self(nm * METERS_PER_NAUTICAL_MILE)
    }

    pub fn meters(self) -> f64 {
        self.0
    }

    pub fn nautical_miles(self) -> f64 {
        self.0 / METERS_PER_NAUTICAL_MILE
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    pub fn scale(self, factor: f64) -> Self {
        Self(self.0 * factor)
    }

    /// Speed needed to cover this distance in `millis`.
    pub fn in_time(self, millis: i64) -> Option<Speed> {
        if millis <= 0 {
            return None;
        }
        Some(Speed::from_meters_per_second(self.0 / (millis as f64 / 1000.0)))
    }
}

impl Add for Distance {
    type Output = Distance;

    fn add(self, rhs: Distance) -> Distance {
        Distance(self.0 + rhs.0)
    }
}

impl AddAssign for Distance {
    fn add_assign(&mut self, rhs: Distance) {
        self.0 += rhs.0;
    }
}

impl Sub for Distance {
    type Output = Distance;

    fn sub(self, rhs: Distance) -> Distance {
        Distance(self.0 - rhs.0)
    }
}

/// Speed in knots.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Speed(f64);

impl Speed {
    pub const ZERO: Speed = Speed(0.0);

    pub const fn from_knots(knots: f64) -> Self {
        Self(knots)
    }

    pub fn from_meters_per_second(mps: f64) -> Self {
        Self(mps / METERS_PER_SECOND_PER_KNOT)
    }

    pub fn knots(self) -> f64 {
        self.0
    }

    pub fn meters_per_second(self) -> f64 {
        self.0 * METERS_PER_SECOND_PER_KNOT
    }

    /// Distance covered at this speed within `millis`.
    pub fn travel(self, millis: i64) -> Distance {
        Distance::from_meters(self.meters_per_second() * millis as f64 / 1000.0)
    }
}

/// Speed over ground together with the course over ground.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpeedWithBearing {
    pub speed: Speed,
    pub bearing: Bearing,
}

impl SpeedWithBearing {
    pub fn new(speed: Speed, bearing: Bearing) -> Self {
        Self { speed, bearing }
    }

    pub fn knots(self) -> f64 {
        self.speed.knots()
    }

    /// Component of this velocity along `direction`. Negative when moving
    /// away from it.
    pub fn project_to(self, direction: Bearing) -> Speed {
        let angle = self.bearing.difference_to(direction).to_radians();
        Speed::from_knots(self.speed.knots() * angle.cos())
    }

    /// Course and speed change needed to turn this velocity into `other`.
    pub fn course_change_required_to_reach(self, other: SpeedWithBearing) -> CourseChange {
        CourseChange {
            course_change_degrees: self.bearing.difference_to(other.bearing),
            speed_change_knots: other.speed.knots() - self.speed.knots(),
        }
    }

    /// Position reached when moving from `start` at this velocity for `millis`.
    pub fn travel(self, start: Position, millis: i64) -> Position {
        start.translate(self.bearing, self.speed.travel(millis))
    }

    /// Velocity implied by moving from one timed position to another.
    pub fn between(from: Position, from_time: TimePoint, to: Position, to_time: TimePoint) -> Option<Self> {
        let millis = to_time.millis_since(from_time);
        let speed = from.distance_to(to).in_time(millis)?;
        Some(Self::new(speed, from.bearing_to(to)))
    }
}

/// Change of course (degrees, positive = clockwise) and speed (knots).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CourseChange {
    pub course_change_degrees: f64,
    pub speed_change_knots: f64,
}

// ============================================================================
// Position
// ============================================================================

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub lat_deg: f64,
    pub lng_deg: f64,
}

impl Position {
    pub const fn new(lat_deg: f64, lng_deg: f64) -> Self {
        Self { lat_deg, lng_deg }
    }

    fn to_point(self) -> Point {
        Point::new(self.lng_deg, self.lat_deg)
    }

    fn from_point(point: Point) -> Self {
        Self::new(point.y(), point.x())
    }

    /// Check if coordinates are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat_deg.is_finite()
            && self.lng_deg.is_finite()
            && (-90.0..=90.0).contains(&self.lat_deg)
            && (-180.0..=180.0).contains(&self.lng_deg)
    }

    /// Great-circle distance.
    pub fn distance_to(&self, other: Position) -> Distance {
        Distance::from_meters(Haversine::distance(self.to_point(), other.to_point()))
    }

    /// Initial great-circle bearing from `self` toward `other`.
    pub fn bearing_to(&self, other: Position) -> Bearing {
        Bearing::from_degrees(Haversine::bearing(self.to_point(), other.to_point()))
    }

    /// Position reached by following the great circle starting at `bearing`.
    pub fn translate(&self, bearing: Bearing, distance: Distance) -> Position {
        Position::from_point(Haversine::destination(
            self.to_point(),
            bearing.degrees(),
            distance.meters(),
        ))
    }

    /// Signed distance from the great circle through `start` with `bearing`.
    /// Positive when `self` lies to the right (starboard) of the line.
    pub fn cross_track_error(&self, start: Position, bearing: Bearing) -> Distance {
        let angular = start.distance_to(*self).meters() / EARTH_RADIUS_METERS;
        let bearing_to_self = start.bearing_to(*self);
        let delta = (bearing_to_self.degrees() - bearing.degrees()).to_radians();
        let xt = (angular.sin() * delta.sin()).clamp(-1.0, 1.0).asin();
        Distance::from_meters(xt * EARTH_RADIUS_METERS)
    }

    /// Signed distance along the great circle through `start` with `bearing`
    /// to the foot of the perpendicular from `self`. Negative when the foot
    /// lies behind `start`.
    pub fn along_track_distance(&self, start: Position, bearing: Bearing) -> Distance {
        let angular = start.distance_to(*self).meters() / EARTH_RADIUS_METERS;
        if angular == 0.0 {
            return Distance::ZERO;
        }
        let xt = self.cross_track_error(start, bearing).meters() / EARTH_RADIUS_METERS;
        let cos_xt = xt.cos();
        let ratio = if cos_xt.abs() < f64::EPSILON {
            0.0
        } else {
            (angular.cos() / cos_xt).clamp(-1.0, 1.0)
        };
        let at = ratio.acos();
        let delta = start.bearing_to(*self).difference_to(bearing).to_radians();
        let sign = if delta.cos() < 0.0 { -1.0 } else { 1.0 };
        Distance::from_meters(sign * at * EARTH_RADIUS_METERS)
    }

    /// Foot of the perpendicular from `self` onto the great circle through
    /// `start` with `bearing`.
    pub fn project_to_line(&self, start: Position, bearing: Bearing) -> Position {
        let along = self.along_track_distance(start, bearing);
        if along.meters() >= 0.0 {
            start.translate(bearing, along)
        } else {
            start.translate(bearing.reverse(), along.abs())
        }
    }

    /// Great-circle midpoint.
    pub fn middle(&self, other: Position) -> Position {
        Position::average([(*self, 1.0), (other, 1.0)]).unwrap_or(*self)
    }

    /// Weighted mean position, computed on unit vectors so it behaves across
    /// the antimeridian. Returns `None` if the total weight is zero.
    pub fn average<I>(weighted: I) -> Option<Position>
    where
        I: IntoIterator<Item = (Position, f64)>,
    {
        let (mut x, mut y, mut z, mut total) = (0.0, 0.0, 0.0, 0.0);
        for (p, w) in weighted {
            let lat = p.lat_deg.to_radians();
            let lng = p.lng_deg.to_radians();
            x += w * lat.cos() * lng.cos();
            y += w * lat.cos() * lng.sin();
            z += w * lat.sin();
            total += w;
        }
        if total <= 0.0 {
            return None;
        }
        let hyp = (x * x + y * y).sqrt();
        Some(Position::new(z.atan2(hyp).to_degrees(), y.atan2(x).to_degrees()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearing_normalization() {
        assert_eq!(Bearing::from_degrees(370.0).degrees(), 10.0);
        assert_eq!(Bearing::from_degrees(-90.0).degrees(), 270.0);
        assert_eq!(Bearing::from_degrees(180.0).reverse().degrees(), 0.0);
    }

    #[test]
    fn test_bearing_difference() {
        let a = Bearing::from_degrees(350.0);
        let b = Bearing::from_degrees(10.0);
        assert!((a.difference_to(b) - 20.0).abs() < 1e-9);
        assert!((b.difference_to(a) + 20.0).abs() < 1e-9);
        assert_eq!(a.difference_to(a.reverse()), 180.0);
        assert!((a.middle(b).degrees() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_distance_and_bearing() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(0.001, 0.0);
        let d = a.distance_to(b).meters();
        assert!((d - 111.2).abs() < 0.5, "got {}", d);
        assert!(a.bearing_to(b).degrees() < 1e-6 || a.bearing_to(b).degrees() > 359.99);

        let east = Position::new(0.0, 0.001);
        assert!((a.bearing_to(east).degrees() - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_translate_round_trip() {
        let start = Position::new(54.43, 10.19);
        let target = start.translate(Bearing::from_degrees(45.0), Distance::from_meters(1000.0));
        assert!((start.distance_to(target).meters() - 1000.0).abs() < 0.01);
        assert!((start.bearing_to(target).degrees() - 45.0).abs() < 0.01);
    }

    #[test]
    fn test_cross_track_error_sign() {
        let start = Position::new(0.0, 0.0);
        let north = Bearing::from_degrees(0.0);
        let right = Position::new(0.01, 0.001);
        let left = Position::new(0.01, -0.001);
        assert!(right.cross_track_error(start, north).meters() > 100.0);
        assert!(left.cross_track_error(start, north).meters() < -100.0);
    }

    #[test]
    fn test_along_track_and_projection() {
        let start = Position::new(0.0, 0.0);
        let north = Bearing::from_degrees(0.0);
        let p = Position::new(0.01, 0.002);
        let along = p.along_track_distance(start, north).meters();
        assert!((along - 1111.9).abs() < 2.0, "got {}", along);

        let behind = Position::new(-0.01, 0.002);
        assert!(behind.along_track_distance(start, north).meters() < 0.0);

        let foot = p.project_to_line(start, north);
        assert!(foot.lng_deg.abs() < 1e-6);
        assert!((foot.lat_deg - 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_average_position() {
        let avg = Position::average([
            (Position::new(0.0, 179.0), 1.0),
            (Position::new(0.0, -179.0), 1.0),
        ])
        .unwrap();
        assert!((avg.lng_deg.abs() - 180.0).abs() < 1e-9);
        assert!(Position::average(Vec::<(Position, f64)>::new()).is_none());
    }

    #[test]
    fn test_speed_conversions() {
        let s = Speed::from_knots(10.0);
        assert!((s.meters_per_second() - 5.1444).abs() < 1e-3);
        assert!((s.travel(3_600_000).nautical_miles() - 10.0).abs() < 1e-9);

        let sog = SpeedWithBearing::new(s, Bearing::from_degrees(45.0));
        let north = sog.project_to(Bearing::from_degrees(0.0)).knots();
        assert!((north - 10.0 * 45f64.to_radians().cos()).abs() < 1e-9);
        assert!(sog.project_to(Bearing::from_degrees(225.0)).knots() < 0.0);
    }

    #[test]
    fn test_speed_between() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(0.001, 0.0);
        let v = SpeedWithBearing::between(
            a,
            TimePoint::from_millis(0),
            b,
            TimePoint::from_millis(10_000),
        )
        .unwrap();
        assert!((v.knots() - 21.6).abs() < 0.1, "got {}", v.knots());
        assert!(SpeedWithBearing::between(a, TimePoint::from_millis(5), b, TimePoint::from_millis(5)).is_none());
    }

    #[test]
    fn test_time_point() {
        let t = TimePoint::from_millis(1_000);
        assert_eq!(t.plus(500).millis(), 1_500);
        assert_eq!(t.plus(500).millis_since(t), 500);
        assert_eq!(t.middle(TimePoint::from_millis(3_000)).millis(), 2_000);
        let dt = t.to_datetime().unwrap();
        assert_eq!(TimePoint::from_datetime(&dt), t);
    }
}
