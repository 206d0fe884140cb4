//! Wind pipeline of a race: measured sources, the course-based guess, the
//! estimate from the fleet's courses and their combination.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use super::{TrackedRace, WindCacheKey};
use crate::confidence::{
    BearingCluster, ExponentialTimeWeigher, HyperbolicTimeWeigher, PositionAndTime, Weigher, WithConfidence,
};
use crate::course::CompetitorId;
use crate::geo_utils::{Position, Speed, SpeedWithBearing, TimePoint};
use crate::leg::LegType;
use crate::sync;
use crate::wind::{average_winds, Wind, WindSample, WindSource, WindSourceType, WindTrack, WindWithConfidence};

/// Weight of the boat class default tack angle when separating the tacks.
const DEFAULT_TACK_ANGLE_CONFIDENCE: f64 = 0.1;

/// Minimum weight of a competitor's speed estimate, keeping the bearing
/// defined when every fix is far from the query time.
const MIN_ESTIMATION_WEIGHT: f64 = 1e-10;

/// Competitors whose course differs from the leg direction by this much
/// are sailing backwards, usually because of a missing mark passing.
const MAX_FORWARD_DEVIATION_DEGREES: f64 = 90.0;

impl TrackedRace {
    // ========================================================================
    // Sources
    // ========================================================================

    pub fn wind_track(&self, source: &WindSource) -> Option<Arc<WindTrack>> {
        sync::read(&self.wind_tracks).get(source).cloned()
    }

    pub(super) fn wind_track_or_create(&self, source: &WindSource) -> Arc<WindTrack> {
        if let Some(track) = self.wind_track(source) {
            return track;
        }
        let config = self.config().wind;
        sync::write(&self.wind_tracks)
            .entry(source.clone())
            .or_insert_with(|| Arc::new(WindTrack::new(source.clone(), config)))
            .clone()
    }

    /// Measured sources with recorded wind plus the derived course-based and
    /// track-based sources.
    pub fn wind_sources(&self) -> Vec<WindSource> {
        let mut sources: Vec<WindSource> = sync::read(&self.wind_tracks).keys().cloned().collect();
        sources.push(WindSource::new(WindSourceType::CourseBased));
        sources.push(WindSource::new(WindSourceType::TrackBasedEstimation));
        sources
    }

    pub fn wind_sources_of_type(&self, source_type: WindSourceType) -> Vec<WindSource> {
        self.wind_sources()
            .into_iter()
            .filter(|s| s.source_type == source_type)
            .collect()
    }

    // ========================================================================
    // Combined wind
    // ========================================================================

    pub fn wind(&self, position: Option<Position>, at: TimePoint) -> Option<Wind> {
        self.wind_with_confidence(position, at, &[]).map(|w| w.value)
    }

    /// All sources except the race's exclusions and `exclude`, combined by
    /// confidence. Answers are kept in a short-time cache that every update
    /// clears.
    pub fn wind_with_confidence(
        &self,
        position: Option<Position>,
        at: TimePoint,
        exclude: &[WindSource],
    ) -> Option<WindWithConfidence> {
        let mut excluded: Vec<WindSource> = sync::read(&self.wind_sources_to_exclude)
            .iter()
            .chain(exclude)
            .cloned()
            .collect();
        excluded.sort();
        excluded.dedup();

        let key = (
            position.map(|p| (p.lat_deg.to_bits(), p.lng_deg.to_bits())),
            at,
            excluded,
        );
        if let Some(hit) = sync::lock(&self.wind_cache).get(&key) {
            return *hit;
        }
        let seen = self.update_count();
        let combined = self.combine_wind_sources(position, at, &key.2);
        self.cache_wind(key, combined, seen);
        combined
    }

    /// Keep `wind` unless the race was updated after `seen`.
    pub(super) fn cache_wind(&self, key: WindCacheKey, wind: Option<WindWithConfidence>, seen: u64) {
        let mut cache = sync::lock(&self.wind_cache);
        if self.update_count() == seen {
            cache.put(key, wind);
        }
    }

    fn combine_wind_sources(
        &self,
        position: Option<Position>,
        at: TimePoint,
        excluded: &[WindSource],
    ) -> Option<WindWithConfidence> {
        let tracks: Vec<(WindSource, Arc<WindTrack>)> = sync::read(&self.wind_tracks)
            .iter()
            .filter(|(source, _)| !excluded.contains(source))
            .map(|(source, track)| (source.clone(), Arc::clone(track)))
            .collect();

        let mut samples: Vec<WindSample> = tracks
            .iter()
            .filter_map(|(source, track)| {
                let averaged = track.averaged_wind_with_confidence(position, at)?;
                Some(WindSample {
                    wind: averaged.value,
                    confidence: averaged.confidence,
                    use_speed: source.source_type.use_speed(),
                })
            })
            .collect();

        let course_based = WindSourceType::CourseBased;
        if !excluded.contains(&WindSource::new(course_based)) {
            if let Some(wind) = self.direction_from_start_to_next_mark(at) {
                samples.push(WindSample {
                    wind,
                    confidence: course_based.base_confidence(),
                    use_speed: course_based.use_speed(),
                });
            }
        }

        let estimation = WindSourceType::TrackBasedEstimation;
        if !excluded.contains(&WindSource::new(estimation)) {
            if let Some(estimated) = self.estimated_wind_direction(position, at) {
                samples.push(WindSample {
                    wind: estimated.value,
                    confidence: estimated.confidence * estimation.base_confidence(),
                    use_speed: estimation.use_speed(),
                });
            }
        }

        if samples.is_empty() {
            return None;
        }
        let weigher = self.config().wind.weigher();
        average_winds(&samples, &weigher, PositionAndTime::new(position, at))
    }

    // ========================================================================
    // Derived sources
    // ========================================================================

    /// Wind assumed to blow from the first mark down to the start, without
    /// speed. Courses are laid with the first leg to windward.
    pub fn direction_from_start_to_next_mark(&self, at: TimePoint) -> Option<Wind> {
        let first_leg = sync::read(&self.course).leg(0)?;
        let start = self.approximate_position(&first_leg.from, at)?;
        let first_mark = self.approximate_position(&first_leg.to, at)?;
        Some(Wind::new(
            Some(start),
            at,
            SpeedWithBearing::new(Speed::ZERO, first_mark.bearing_to(start)),
        ))
    }

    /// Wind direction estimated from the fleet's courses.
    ///
    /// Competitors sailing straight on an upwind or downwind leg are
    /// clustered per leg type and split into the two tacks. The bisector of
    /// the two tacks points downwind on downwind legs and upwind on upwind
    /// legs. Confidence drops near mark passings and with few boats per
    /// tack. Returns `None` while any leg type cannot be determined.
    pub fn estimated_wind_direction(&self, position: Option<Position>, at: TimePoint) -> Option<WindWithConfidence> {
        let config = self.config();
        let averaging = config.track.millis_over_which_to_average_speed;
        let weigher = ExponentialTimeWeigher::new(averaging, MIN_ESTIMATION_WEIGHT);
        let near_passing = HyperbolicTimeWeigher::new(averaging * 5);
        let straight_threshold =
            self.boat_class.maneuver_degree_threshold * config.direction_change_threshold_factor;

        let mut leg_types: HashMap<usize, LegType> = HashMap::new();
        let mut clusters: HashMap<LegType, (BearingCluster, Vec<Position>)> = HashMap::new();
        for competitor in self.competitor_ids() {
            let Some(leg) = self.current_leg(&competitor, at) else {
                continue;
            };
            let index = leg.leg().index();
            let leg_type = match leg_types.get(&index) {
                Some(leg_type) => *leg_type,
                None => match leg.leg().leg_type(at) {
                    Ok(leg_type) => *leg_types.entry(index).or_insert(leg_type),
                    Err(e) => {
                        debug!("[TrackedRace] No wind estimation for {} at {}: {}", self.id, at, e);
                        return None;
                    }
                },
            };
            if leg_type == LegType::Reaching {
                continue;
            }
            let track = leg.track();
            if track.has_direction_change(at, straight_threshold) {
                continue;
            }
            let Some(speed) = track.estimated_speed_with_weigher(at, &weigher) else {
                continue;
            };
            let forward = leg
                .leg()
                .leg_bearing(at)
                .is_some_and(|b| speed.value.bearing.difference_to(b).abs() < MAX_FORWARD_DEVIATION_DEGREES);
            if !forward {
                continue;
            }

            let reduction = self.mark_passing_proximity_factor(&competitor, at, &near_passing);
            let (cluster, positions) = clusters.entry(leg_type).or_default();
            cluster.add(speed.value.bearing, speed.confidence * reduction);
            if let Some(p) = track.estimated_position(at, false) {
                positions.push(p);
            }
        }

        let mut combined = BearingCluster::new();
        let mut centers: Vec<Position> = Vec::new();
        for leg_type in [LegType::Upwind, LegType::Downwind] {
            let Some((cluster, positions)) = clusters.get(&leg_type) else {
                continue;
            };
            let min_angle = self.boat_class.minimum_angle_between_different_tacks(leg_type);
            let (one_tack, other_tack) = cluster.split_in_two(min_angle);
            let (Some(one), Some(other)) = (one_tack.average(), other_tack.average()) else {
                continue;
            };
            let boats = one_tack.len().min(other_tack.len());
            let confidence = one.confidence.min(other.confidence)
                * self.boat_class.estimation_confidence(leg_type, boats)
                * DEFAULT_TACK_ANGLE_CONFIDENCE;
            let bisector = one.value.middle(other.value);
            let bearing = match leg_type {
                LegType::Upwind => bisector.reverse(),
                _ => bisector,
            };
            combined.add(bearing, confidence);
            centers.extend(positions.iter().copied());
        }

        let average = combined.average()?;
        let position = position.or_else(|| Position::average(centers.iter().map(|p| (*p, 1.0))));
        let wind = Wind::new(position, at, SpeedWithBearing::new(Speed::ZERO, average.value));
        Some(WithConfidence::new(
            wind,
            average.confidence,
            PositionAndTime::new(position, at),
        ))
    }

    /// Factor in [0, 1] that is small close to the competitor's previous or
    /// next mark passing.
    fn mark_passing_proximity_factor<W: Weigher<TimePoint>>(
        &self,
        competitor: &CompetitorId,
        at: TimePoint,
        weigher: &W,
    ) -> f64 {
        let store = sync::read(&self.mark_passings);
        let passings = store.passings_of(competitor);
        let mut factor = 1.0;
        if let Some(previous) = passings.iter().rev().find(|p| p.time_point <= at) {
            factor *= (1.0 - weigher.weight(&previous.time_point, &at)).max(0.0);
        }
        if let Some(next) = passings.iter().find(|p| p.time_point >= at) {
            factor *= (1.0 - weigher.weight(&next.time_point, &at)).max(0.0);
        }
        factor
    }
}
