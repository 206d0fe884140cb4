//! # Confidence-Weighted Averaging
//!
//! Samples (speeds, bearings, wind observations) carry a confidence in [0, 1].
//! When combining them into one estimate for a query point, each sample's
//! confidence is multiplied by a weigher that decays with the sample's
//! distance (in time, or in time and space) from the query. The result gets
//! its own confidence: `sum(w^2) / sum(w)`, which equals the sample confidence
//! when a single sample sits exactly at the query point and falls as samples
//! get weaker or further away.
//!
//! Bearings are averaged as unit vectors so 359 deg and 1 deg average to 0 deg.

use serde::{Deserialize, Serialize};

use crate::geo_utils::{Bearing, Position, SpeedWithBearing, Speed, TimePoint};

/// Speeds below this many knots carry no bearing information.
pub const MIN_SPEED_FOR_BEARING_KNOTS: f64 = 0.001;

// ============================================================================
// Weighers
// ============================================================================

/// Turns the distance between a sample and the query point into a factor
/// in (0, 1].
pub trait Weigher<R>: Send + Sync {
    fn weight(&self, sample: &R, query: &R) -> f64;
}

/// `max(minimum, 0.5^(|dt| / half))`
#[derive(Debug, Clone, Copy)]
pub struct ExponentialTimeWeigher {
    pub half_confidence_millis: f64,
    pub minimum_confidence: f64,
}

impl ExponentialTimeWeigher {
    pub fn new(half_confidence_millis: i64, minimum_confidence: f64) -> Self {
        Self {
            half_confidence_millis: half_confidence_millis.max(1) as f64,
            minimum_confidence,
        }
    }
}

impl Weigher<TimePoint> for ExponentialTimeWeigher {
    fn weight(&self, sample: &TimePoint, query: &TimePoint) -> f64 {
        let dt = sample.millis_since(*query).abs() as f64;
        0.5f64
            .powf(dt / self.half_confidence_millis)
            .max(self.minimum_confidence)
    }
}

/// `1 / (1 + |dt| / half)`, decays slower than exponential far out.
#[derive(Debug, Clone, Copy)]
pub struct HyperbolicTimeWeigher {
    pub half_confidence_millis: f64,
}

impl HyperbolicTimeWeigher {
    pub fn new(half_confidence_millis: i64) -> Self {
        Self {
            half_confidence_millis: half_confidence_millis.max(1) as f64,
        }
    }
}

impl Weigher<TimePoint> for HyperbolicTimeWeigher {
    fn weight(&self, sample: &TimePoint, query: &TimePoint) -> f64 {
        let dt = sample.millis_since(*query).abs() as f64;
        1.0 / (1.0 + dt / self.half_confidence_millis)
    }
}

/// Reference point for weighers that look at both space and time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionAndTime {
    pub position: Option<Position>,
    pub time_point: TimePoint,
}

impl PositionAndTime {
    pub fn new(position: Option<Position>, time_point: TimePoint) -> Self {
        Self {
            position,
            time_point,
        }
    }
}

/// Product of an exponential time weight and an exponential distance weight,
/// each floored at `minimum_confidence`. The distance factor is 1 when
/// either side has no position.
#[derive(Debug, Clone, Copy)]
pub struct PositionAndTimeWeigher {
    pub half_confidence_millis: f64,
    pub half_confidence_meters: f64,
    pub minimum_confidence: f64,
}

impl PositionAndTimeWeigher {
    pub fn new(half_confidence_millis: i64, half_confidence_meters: f64) -> Self {
        Self {
            half_confidence_millis: half_confidence_millis.max(1) as f64,
            half_confidence_meters: half_confidence_meters.max(1.0),
            minimum_confidence: 1e-8,
        }
    }
}

impl Weigher<PositionAndTime> for PositionAndTimeWeigher {
    fn weight(&self, sample: &PositionAndTime, query: &PositionAndTime) -> f64 {
        let dt = sample.time_point.millis_since(query.time_point).abs() as f64;
        let time_weight = 0.5f64
            .powf(dt / self.half_confidence_millis)
            .max(self.minimum_confidence);
        let space_weight = match (sample.position, query.position) {
            (Some(a), Some(b)) => 0.5f64
                .powf(a.distance_to(b).meters() / self.half_confidence_meters)
                .max(self.minimum_confidence),
            _ => 1.0,
        };
        time_weight * space_weight
    }
}

// ============================================================================
// Values with confidence
// ============================================================================

/// A value with a confidence in [0, 1] and the point it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WithConfidence<T, R = TimePoint> {
    pub value: T,
    pub confidence: f64,
    pub reference: R,
}

impl<T, R> WithConfidence<T, R> {
    pub fn new(value: T, confidence: f64, reference: R) -> Self {
        Self {
            value,
            confidence,
            reference,
        }
    }
}

// ============================================================================
// Accumulators
// ============================================================================

/// Weighted scalar mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarAccumulator {
    sum: f64,
    weight: f64,
    weight_sq: f64,
}

impl ScalarAccumulator {
    pub fn add(&mut self, value: f64, weight: f64) {
        if weight <= 0.0 || !value.is_finite() {
            return;
        }
        self.sum += value * weight;
        self.weight += weight;
        self.weight_sq += weight * weight;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.weight > 0.0).then(|| self.sum / self.weight)
    }

    pub fn confidence(&self) -> f64 {
        if self.weight > 0.0 {
            self.weight_sq / self.weight
        } else {
            0.0
        }
    }
}

/// Weighted circular mean of bearings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BearingAccumulator {
    x: f64,
    y: f64,
    weight: f64,
    weight_sq: f64,
}

impl BearingAccumulator {
    pub fn add(&mut self, bearing: Bearing, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        let rad = bearing.radians();
        self.x += weight * rad.cos();
        self.y += weight * rad.sin();
        self.weight += weight;
        self.weight_sq += weight * weight;
    }

    /// `None` if nothing was added or the vectors cancel out.
    pub fn mean(&self) -> Option<Bearing> {
        if self.weight <= 0.0 || self.x.hypot(self.y) < 1e-9 * self.weight {
            return None;
        }
        Some(Bearing::from_radians(self.y.atan2(self.x)))
    }

    pub fn confidence(&self) -> f64 {
        if self.weight > 0.0 {
            self.weight_sq / self.weight
        } else {
            0.0
        }
    }
}

// ============================================================================
// Speed averaging
// ============================================================================

/// One contribution to a speed estimate. Speed and bearing carry separate
/// confidences because the bearing of a nearly stationary boat is noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    pub speed_with_bearing: SpeedWithBearing,
    pub speed_confidence: f64,
    pub bearing_confidence: f64,
    pub time_point: TimePoint,
}

impl SpeedSample {
    /// Sample with the given base confidence; bearing confidence drops to
    /// zero when the speed is too small to define a direction.
    pub fn new(speed_with_bearing: SpeedWithBearing, confidence: f64, time_point: TimePoint) -> Self {
        let bearing_confidence = if speed_with_bearing.knots() < MIN_SPEED_FOR_BEARING_KNOTS {
            0.0
        } else {
            confidence
        };
        Self {
            speed_with_bearing,
            speed_confidence: confidence,
            bearing_confidence,
            time_point,
        }
    }
}

/// Combine speed samples for query time `at`. The result confidence is the
/// mean of the speed and bearing confidences.
pub fn average_speed_with_bearing<W: Weigher<TimePoint> + ?Sized>(
    samples: &[SpeedSample],
    weigher: &W,
    at: TimePoint,
) -> Option<WithConfidence<SpeedWithBearing>> {
    let mut speeds = ScalarAccumulator::default();
    let mut bearings = BearingAccumulator::default();
    for sample in samples {
        let w = weigher.weight(&sample.time_point, &at);
        speeds.add(sample.speed_with_bearing.knots(), sample.speed_confidence * w);
        bearings.add(sample.speed_with_bearing.bearing, sample.bearing_confidence * w);
    }
    let speed = speeds.mean()?;
    let bearing = bearings.mean().unwrap_or_default();
    let confidence = (speeds.confidence() + bearings.confidence()) / 2.0;
    Some(WithConfidence::new(
        SpeedWithBearing::new(Speed::from_knots(speed), bearing),
        confidence,
        at,
    ))
}

// ============================================================================
// Bearing clusters
// ============================================================================

/// Bag of bearings with confidences, used to separate the two tacks of a
/// fleet sailing the same leg.
#[derive(Debug, Clone, Default)]
pub struct BearingCluster {
    bearings: Vec<(Bearing, f64)>,
}

impl BearingCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bearing: Bearing, confidence: f64) {
        self.bearings.push((bearing, confidence));
    }

    pub fn len(&self) -> usize {
        self.bearings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bearings.is_empty()
    }

    /// Confidence-weighted circular mean.
    pub fn average(&self) -> Option<WithConfidence<Bearing, ()>> {
        let mut acc = BearingAccumulator::default();
        for &(b, c) in &self.bearings {
            acc.add(b, c.max(f64::MIN_POSITIVE));
        }
        let mean = acc.mean()?;
        let confidence = self.bearings.iter().map(|(_, c)| c).sum::<f64>() / self.len() as f64;
        Some(WithConfidence::new(mean, confidence, ()))
    }

    /// Split into two clusters whose means differ by at least
    /// `minimum_separation_degrees`. If no such split exists the second
    /// cluster is empty.
    pub fn split_in_two(&self, minimum_separation_degrees: f64) -> (BearingCluster, BearingCluster) {
        let unsplit = || (self.clone(), BearingCluster::new());
        if self.len() < 2 {
            return unsplit();
        }

        // Seed with the pair furthest apart
        let mut seeds = (self.bearings[0].0, self.bearings[0].0);
        let mut widest = 0.0;
        for (i, &(a, _)) in self.bearings.iter().enumerate() {
            for &(b, _) in &self.bearings[i + 1..] {
                let d = a.difference_to(b).abs();
                if d > widest {
                    widest = d;
                    seeds = (a, b);
                }
            }
        }
        if widest < minimum_separation_degrees {
            return unsplit();
        }

        let (mut center_a, mut center_b) = seeds;
        let mut assignment: Vec<bool> = Vec::new();
        for _ in 0..16 {
            let next: Vec<bool> = self
                .bearings
                .iter()
                .map(|&(b, _)| center_a.difference_to(b).abs() <= center_b.difference_to(b).abs())
                .collect();
            if next == assignment {
                break;
            }
            assignment = next;
            let (a, b) = self.partition(&assignment);
            match (a.average(), b.average()) {
                (Some(ma), Some(mb)) => {
                    center_a = ma.value;
                    center_b = mb.value;
                }
                _ => return unsplit(),
            }
        }

        if center_a.difference_to(center_b).abs() < minimum_separation_degrees {
            return unsplit();
        }
        self.partition(&assignment)
    }

    fn partition(&self, assignment: &[bool]) -> (BearingCluster, BearingCluster) {
        let mut a = BearingCluster::new();
        let mut b = BearingCluster::new();
        for (&(bearing, conf), &first) in self.bearings.iter().zip(assignment) {
            if first {
                a.add(bearing, conf);
            } else {
                b.add(bearing, conf);
            }
        }
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: i64) -> TimePoint {
        TimePoint::from_millis(ms)
    }

    #[test]
    fn test_exponential_weigher() {
        let w = ExponentialTimeWeigher::new(1000, 1e-8);
        assert_eq!(w.weight(&t(0), &t(0)), 1.0);
        assert!((w.weight(&t(1000), &t(0)) - 0.5).abs() < 1e-12);
        assert!((w.weight(&t(0), &t(2000)) - 0.25).abs() < 1e-12);
        assert_eq!(w.weight(&t(0), &t(1_000_000_000)), 1e-8);
    }

    #[test]
    fn test_hyperbolic_weigher() {
        let w = HyperbolicTimeWeigher::new(1000);
        assert_eq!(w.weight(&t(0), &t(0)), 1.0);
        assert!((w.weight(&t(1000), &t(0)) - 0.5).abs() < 1e-12);
        assert!((w.weight(&t(3000), &t(0)) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_position_and_time_weigher() {
        let w = PositionAndTimeWeigher::new(1000, 100.0);
        let here = Position::new(0.0, 0.0);
        let a = PositionAndTime::new(Some(here), t(0));
        let b = PositionAndTime::new(None, t(1000));
        assert!((w.weight(&a, &b) - 0.5).abs() < 1e-12);

        let far = PositionAndTime::new(Some(here.translate(Bearing::from_degrees(0.0), crate::geo_utils::Distance::from_meters(100.0))), t(0));
        assert!((w.weight(&a, &far) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_bearing_accumulator_wraps() {
        let mut acc = BearingAccumulator::default();
        acc.add(Bearing::from_degrees(350.0), 1.0);
        acc.add(Bearing::from_degrees(10.0), 1.0);
        let mean = acc.mean().unwrap().degrees();
        assert!(mean < 1e-6 || mean > 360.0 - 1e-6, "got {}", mean);

        let mut opposite = BearingAccumulator::default();
        opposite.add(Bearing::from_degrees(0.0), 1.0);
        opposite.add(Bearing::from_degrees(180.0), 1.0);
        assert!(opposite.mean().is_none());
    }

    #[test]
    fn test_average_speed_confidence() {
        let weigher = ExponentialTimeWeigher::new(1000, 1e-8);
        let sample = SpeedSample::new(
            SpeedWithBearing::new(Speed::from_knots(6.0), Bearing::from_degrees(90.0)),
            0.9,
            t(0),
        );
        let at_sample = average_speed_with_bearing(&[sample], &weigher, t(0)).unwrap();
        assert!((at_sample.value.knots() - 6.0).abs() < 1e-12);
        assert!((at_sample.confidence - 0.9).abs() < 1e-12);

        let later = average_speed_with_bearing(&[sample], &weigher, t(1000)).unwrap();
        assert!((later.confidence - 0.45).abs() < 1e-12);
        assert!(average_speed_with_bearing(&[], &weigher, t(0)).is_none());
    }

    #[test]
    fn test_stationary_sample_has_no_bearing_confidence() {
        let sample = SpeedSample::new(SpeedWithBearing::default(), 0.9, t(0));
        assert_eq!(sample.bearing_confidence, 0.0);
        assert_eq!(sample.speed_confidence, 0.9);
    }

    #[test]
    fn test_split_in_two() {
        let mut cluster = BearingCluster::new();
        for b in [40.0, 45.0, 50.0, 310.0, 315.0, 320.0] {
            cluster.add(Bearing::from_degrees(b), 0.9);
        }
        let (a, b) = cluster.split_in_two(30.0);
        assert_eq!(a.len() + b.len(), 6);
        assert_eq!(a.len(), 3);
        let ma = a.average().unwrap().value.degrees();
        let mb = b.average().unwrap().value.degrees();
        let diff = Bearing::from_degrees(ma).difference_to(Bearing::from_degrees(mb)).abs();
        assert!((diff - 90.0).abs() < 1e-6, "got {}", diff);
    }

    #[test]
    fn test_split_in_two_too_narrow() {
        let mut cluster = BearingCluster::new();
        for b in [40.0, 45.0, 50.0] {
            cluster.add(Bearing::from_degrees(b), 0.9);
        }
        let (a, b) = cluster.split_in_two(30.0);
        assert_eq!(a.len(), 3);
        assert!(b.is_empty());
    }
}
