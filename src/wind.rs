//! # Wind
//!
//! Wind observations, their sources, and per-source wind tracks with
//! confidence-weighted averaging.
//!
//! A wind's bearing is the direction the wind blows *to*; sailors name wind
//! by where it comes *from*, available as [`Wind::from`].
//!
//! Only measured sources are stored in [`WindTrack`]s. Course-based,
//! track-based and combined wind are derived on demand by the race.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::confidence::{
    BearingAccumulator, PositionAndTime, PositionAndTimeWeigher, ScalarAccumulator, Weigher,
    WithConfidence,
};
use crate::geo_utils::{Bearing, Position, Speed, SpeedWithBearing, TimePoint};
use crate::listeners::{Listeners, WindListener};
use crate::sync;

/// Averaged wind with the point it was computed for.
pub type WindWithConfidence = WithConfidence<Wind, PositionAndTime>;

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wind {
    pub position: Option<Position>,
    pub time_point: TimePoint,
    pub speed_with_bearing: SpeedWithBearing,
}

impl Wind {
    pub fn new(position: Option<Position>, time_point: TimePoint, speed_with_bearing: SpeedWithBearing) -> Self {
        Self {
            position,
            time_point,
            speed_with_bearing,
        }
    }

    /// Wind coming from `from_degrees` at `knots`.
    pub fn from_direction(
        position: Option<Position>,
        time_point: TimePoint,
        knots: f64,
        from_degrees: f64,
    ) -> Self {
        Self::new(
            position,
            time_point,
            SpeedWithBearing::new(
                Speed::from_knots(knots),
                Bearing::from_degrees(from_degrees).reverse(),
            ),
        )
    }

    /// Direction the wind blows to.
    pub fn bearing(&self) -> Bearing {
        self.speed_with_bearing.bearing
    }

    /// Direction the wind comes from.
    pub fn from(&self) -> Bearing {
        self.speed_with_bearing.bearing.reverse()
    }

    pub fn speed(&self) -> Speed {
        self.speed_with_bearing.speed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WindSourceType {
    /// Onboard instruments (Expedition logs)
    Expedition,
    /// Weather service feeds
    Web,
    /// Manual entries by the race committee
    RaceCommittee,
    /// Derived from the direction of the first leg
    CourseBased,
    /// Derived from competitors' courses on upwind and downwind legs
    TrackBasedEstimation,
    /// Fusion of all other sources
    Combined,
}

impl WindSourceType {
    pub const ALL: [WindSourceType; 6] = [
        WindSourceType::Expedition,
        WindSourceType::Web,
        WindSourceType::RaceCommittee,
        WindSourceType::CourseBased,
        WindSourceType::TrackBasedEstimation,
        WindSourceType::Combined,
    ];

    /// Whether observations of this type are recorded rather than derived.
    pub fn can_be_stored(self) -> bool {
        matches!(
            self,
            WindSourceType::Expedition | WindSourceType::Web | WindSourceType::RaceCommittee
        )
    }

    /// Whether the source knows wind speed, or only direction.
    pub fn use_speed(self) -> bool {
        !matches!(
            self,
            WindSourceType::CourseBased | WindSourceType::TrackBasedEstimation
        )
    }

    pub fn base_confidence(self) -> f64 {
        match self {
            WindSourceType::Expedition | WindSourceType::RaceCommittee => 0.9,
            WindSourceType::Web => 0.5,
            WindSourceType::TrackBasedEstimation => 0.5,
            WindSourceType::CourseBased => 0.01,
            WindSourceType::Combined => 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindSource {
    pub source_type: WindSourceType,
    /// Distinguishes several sources of the same type, e.g. two boats with
    /// instruments.
    pub id: Option<String>,
}

impl WindSource {
    pub fn new(source_type: WindSourceType) -> Self {
        Self {
            source_type,
            id: None,
        }
    }

    pub fn with_id(source_type: WindSourceType, id: impl Into<String>) -> Self {
        Self {
            source_type,
            id: Some(id.into()),
        }
    }
}

impl fmt::Display for WindSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{:?}:{}", self.source_type, id),
            None => write!(f, "{:?}", self.source_type),
        }
    }
}

/// Wind averaging parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindConfig {
    /// Time span of observations combined into one averaged wind
    pub millis_over_which_to_average_wind: i64,
    /// Distance at which an observation's weight halves
    pub half_confidence_distance_meters: f64,
}

impl Default for WindConfig {
    fn default() -> Self {
        Self {
            millis_over_which_to_average_wind: 30_000,
            half_confidence_distance_meters: 1000.0,
        }
    }
}

impl WindConfig {
    /// Observations lose half their weight after a tenth of the averaging window.
    pub fn weigher(&self) -> PositionAndTimeWeigher {
        PositionAndTimeWeigher::new(
            self.millis_over_which_to_average_wind / 10,
            self.half_confidence_distance_meters,
        )
    }
}

// ============================================================================
// Averaging
// ============================================================================

/// Input to [`average_winds`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindSample {
    pub wind: Wind,
    pub confidence: f64,
    /// Whether the sample's speed is meaningful
    pub use_speed: bool,
}

/// Combine wind samples for `query`. Bearings are averaged as unit vectors.
/// Speed is averaged over samples that carry one and is zero otherwise.
/// Without a query position the samples' positions are averaged too.
pub fn average_winds<W: Weigher<PositionAndTime> + ?Sized>(
    samples: &[WindSample],
    weigher: &W,
    query: PositionAndTime,
) -> Option<WindWithConfidence> {
    let mut bearings = BearingAccumulator::default();
    let mut speeds = ScalarAccumulator::default();
    let mut positions = Vec::new();
    for sample in samples {
        let reference = PositionAndTime::new(sample.wind.position, sample.wind.time_point);
        let weight = sample.confidence * weigher.weight(&reference, &query);
        bearings.add(sample.wind.bearing(), weight);
        if sample.use_speed {
            speeds.add(sample.wind.speed().knots(), weight);
        }
        if let Some(p) = sample.wind.position {
            positions.push((p, weight));
        }
    }
    let bearing = bearings.mean()?;
    let position = query.position.or_else(|| Position::average(positions));
    let wind = Wind::new(
        position,
        query.time_point,
        SpeedWithBearing::new(Speed::from_knots(speeds.mean().unwrap_or(0.0)), bearing),
    );
    Some(WithConfidence::new(wind, bearings.confidence(), query))
}

// ============================================================================
// Wind track
// ============================================================================

#[derive(Debug)]
struct WindFixes {
    fixes: BTreeMap<(TimePoint, u64), Wind>,
    next_seq: u64,
    config: WindConfig,
}

/// Stored observations of one measured wind source.
pub struct WindTrack {
    source: WindSource,
    inner: RwLock<WindFixes>,
    listeners: Listeners<dyn WindListener>,
}

impl WindTrack {
    pub fn new(source: WindSource, config: WindConfig) -> Self {
        Self {
            source,
            inner: RwLock::new(WindFixes {
                fixes: BTreeMap::new(),
                next_seq: 0,
                config,
            }),
            listeners: Listeners::new("WindTrack"),
        }
    }

    pub fn source(&self) -> &WindSource {
        &self.source
    }

    pub fn add_listener(&self, listener: Arc<dyn WindListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn WindListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn millis_over_which_to_average(&self) -> i64 {
        sync::read(&self.inner).config.millis_over_which_to_average_wind
    }

    pub fn config(&self) -> WindConfig {
        sync::read(&self.inner).config.clone()
    }

    pub fn len(&self) -> usize {
        sync::read(&self.inner).fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All observations in time order.
    pub fn winds(&self) -> Vec<Wind> {
        sync::read(&self.inner).fixes.values().copied().collect()
    }

    /// Record an observation. Returns `false` for an exact duplicate.
    pub fn add(&self, wind: Wind) -> bool {
        {
            let mut inner = sync::write(&self.inner);
            let t = wind.time_point;
            if inner
                .fixes
                .range((t, 0)..=(t, u64::MAX))
                .any(|(_, w)| *w == wind)
            {
                return false;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.fixes.insert((t, seq), wind);
        }
        self.listeners.notify(|l| l.wind_received(&wind));
        true
    }

    /// Remove an observation. Returns whether it was present.
    pub fn remove(&self, wind: &Wind) -> bool {
        let removed = {
            let mut inner = sync::write(&self.inner);
            let t = wind.time_point;
            let key = inner
                .fixes
                .range((t, 0)..=(t, u64::MAX))
                .find(|(_, w)| *w == wind)
                .map(|(k, _)| *k);
            key.and_then(|k| inner.fixes.remove(&k))
        };
        match removed {
            Some(w) => {
                self.listeners.notify(|l| l.wind_removed(&w));
                true
            }
            None => false,
        }
    }

    pub fn set_millis_over_which_to_average(&self, millis: i64) {
        let old = {
            let mut inner = sync::write(&self.inner);
            let old = inner.config.millis_over_which_to_average_wind;
            inner.config.millis_over_which_to_average_wind = millis;
            old
        };
        if old != millis {
            self.listeners.notify(|l| l.averaging_changed(old, millis));
        }
    }

    pub fn averaged_wind(&self, position: Option<Position>, at: TimePoint) -> Option<Wind> {
        self.averaged_wind_with_confidence(position, at).map(|w| w.value)
    }

    /// Average of the observations nearest to `at`.
    ///
    /// Starting at `at`, repeatedly takes the closer of the next older and
    /// the next newer observation until the taken ones span the averaging
    /// window or none are left. At least one observation is always used, so
    /// a non-empty track always yields a wind.
    pub fn averaged_wind_with_confidence(
        &self,
        position: Option<Position>,
        at: TimePoint,
    ) -> Option<WindWithConfidence> {
        let inner = sync::read(&self.inner);
        let window = inner.config.millis_over_which_to_average_wind;
        let mut older = inner.fixes.range(..(at, 0)).rev().map(|(_, w)| w).peekable();
        let mut newer = inner.fixes.range((at, 0)..).map(|(_, w)| w).peekable();

        let confidence = self.source.source_type.base_confidence();
        let use_speed = self.source.source_type.use_speed();
        let mut samples = Vec::new();
        let mut earliest = at;
        let mut latest = at;
        loop {
            let older_gap = older.peek().map(|w| at.millis_since(w.time_point));
            let newer_gap = newer.peek().map(|w| w.time_point.millis_since(at));
            let next = match (older_gap, newer_gap) {
                (Some(o), Some(n)) if o <= n => older.next(),
                (Some(_), Some(_)) => newer.next(),
                (Some(_), None) => older.next(),
                (None, Some(_)) => newer.next(),
                (None, None) => None,
            };
            let Some(wind) = next else {
                break;
            };
            earliest = earliest.min(wind.time_point);
            latest = latest.max(wind.time_point);
            samples.push(WindSample {
                wind: *wind,
                confidence,
                use_speed,
            });
            if latest.millis_since(earliest) >= window {
                break;
            }
        }
        let weigher = inner.config.weigher();
        drop(inner);

        average_winds(&samples, &weigher, PositionAndTime::new(position, at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(ms: i64) -> TimePoint {
        TimePoint::from_millis(ms)
    }

    fn measured() -> WindSource {
        WindSource::with_id(WindSourceType::Expedition, "committee boat")
    }

    #[test]
    fn test_wind_from_and_to() {
        let wind = Wind::from_direction(None, t(0), 12.0, 270.0);
        assert_eq!(wind.from().degrees(), 270.0);
        assert_eq!(wind.bearing().degrees(), 90.0);
    }

    #[test]
    fn test_source_properties() {
        assert!(WindSourceType::Expedition.can_be_stored());
        assert!(!WindSourceType::Combined.can_be_stored());
        assert!(!WindSourceType::CourseBased.use_speed());
        assert!(
            WindSourceType::CourseBased.base_confidence()
                < WindSourceType::TrackBasedEstimation.base_confidence()
        );
    }

    #[test]
    fn test_empty_track_has_no_wind() {
        let track = WindTrack::new(measured(), WindConfig::default());
        assert!(track.averaged_wind(None, t(0)).is_none());
    }

    #[test]
    fn test_single_distant_fix_is_used() {
        let track = WindTrack::new(measured(), WindConfig::default());
        track.add(Wind::from_direction(None, t(0), 10.0, 200.0));
        let wind = track.averaged_wind_with_confidence(None, t(3_600_000)).unwrap();
        assert!((wind.value.from().degrees() - 200.0).abs() < 1e-9);
        assert!((wind.value.speed().knots() - 10.0).abs() < 1e-9);
        assert!(wind.confidence > 0.0);
    }

    #[test]
    fn test_averaging_wraps_north() {
        let track = WindTrack::new(measured(), WindConfig::default());
        track.add(Wind::from_direction(None, t(0), 10.0, 350.0));
        track.add(Wind::from_direction(None, t(2_000), 14.0, 10.0));
        let wind = track.averaged_wind(None, t(1_000)).unwrap();
        let from = wind.from().degrees();
        assert!(from < 0.5 || from > 359.5, "got {}", from);
        assert!((wind.speed().knots() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_expansion_stops_at_window() {
        let config = WindConfig {
            millis_over_which_to_average_wind: 10_000,
            ..WindConfig::default()
        };
        let track = WindTrack::new(measured(), config);
        track.add(Wind::from_direction(None, t(0), 10.0, 180.0));
        track.add(Wind::from_direction(None, t(12_000), 10.0, 180.0));
        // far away and very different: never reached
        track.add(Wind::from_direction(None, t(100_000), 30.0, 0.0));
        let wind = track.averaged_wind(None, t(1_000)).unwrap();
        assert!((wind.from().degrees() - 180.0).abs() < 1e-9);
        assert!((wind.speed().knots() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_averaged_without_query_position() {
        let track = WindTrack::new(measured(), WindConfig::default());
        let a = Position::new(54.0, 10.0);
        let b = Position::new(54.0, 10.002);
        track.add(Wind::from_direction(Some(a), t(0), 10.0, 90.0));
        track.add(Wind::from_direction(Some(b), t(0), 10.0, 90.0));
        let wind = track.averaged_wind(None, t(0)).unwrap();
        let p = wind.position.unwrap();
        assert!((p.lng_deg - 10.001).abs() < 1e-6);

        let query = Position::new(55.0, 11.0);
        assert_eq!(track.averaged_wind(Some(query), t(0)).unwrap().position, Some(query));
    }

    struct Counter {
        received: AtomicUsize,
        removed: AtomicUsize,
    }

    impl WindListener for Counter {
        fn wind_received(&self, _wind: &Wind) -> crate::Result<()> {
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn wind_removed(&self, _wind: &Wind) -> crate::Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_add_remove_notifies() {
        let track = WindTrack::new(measured(), WindConfig::default());
        let counter = Arc::new(Counter {
            received: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        });
        track.add_listener(counter.clone());
        let wind = Wind::from_direction(None, t(0), 8.0, 45.0);
        assert!(track.add(wind));
        assert!(!track.add(wind));
        assert!(track.remove(&wind));
        assert!(!track.remove(&wind));
        assert!(track.is_empty());
        assert_eq!(counter.received.load(Ordering::SeqCst), 1);
        assert_eq!(counter.removed.load(Ordering::SeqCst), 1);
    }
}
