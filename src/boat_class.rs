//! # Boat Classes
//!
//! Per-class parameters consumed by maneuver detection and wind estimation.
//! A small registry of well-known classes is available through
//! [`BoatClass::by_name`]; callers may construct their own.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::geo_utils::Distance;
use crate::leg::LegType;

/// How much a wind estimate can be trusted given the number of boats that
/// contributed to the smaller of the two tack clusters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimationConfidence {
    /// Boat count at which confidence reaches 0.5
    pub boats_for_half_confidence: f64,
}

impl EstimationConfidence {
    pub fn confidence(&self, boats: usize) -> f64 {
        let n = boats as f64;
        if n <= 0.0 {
            0.0
        } else {
            n / (n + self.boats_for_half_confidence.max(f64::EPSILON))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoatClass {
    pub name: String,
    pub hull_length: Distance,
    pub approximate_maneuver_duration_millis: i64,
    /// Douglas-Peucker tolerance for maneuver detection
    pub max_course_approximation_distance: Distance,
    /// Minimum angle between port and starboard courses on an upwind leg
    pub min_angle_between_tacks_upwind_degrees: f64,
    pub min_angle_between_tacks_downwind_degrees: f64,
    /// Smallest course change that counts as a maneuver
    pub maneuver_degree_threshold: f64,
    pub upwind_estimation_confidence: EstimationConfidence,
    pub downwind_estimation_confidence: EstimationConfidence,
}

impl Default for BoatClass {
    fn default() -> Self {
        Self::new("Generic", 6.0)
    }
}

impl BoatClass {
    /// Class with parameters derived from the hull length.
    pub fn new(name: impl Into<String>, hull_length_meters: f64) -> Self {
        Self {
            name: name.into(),
            hull_length: Distance::from_meters(hull_length_meters),
            approximate_maneuver_duration_millis: 8_000,
            max_course_approximation_distance: Distance::from_meters(hull_length_meters * 0.75),
            min_angle_between_tacks_upwind_degrees: 45.0,
            min_angle_between_tacks_downwind_degrees: 25.0,
            maneuver_degree_threshold: 20.0,
            upwind_estimation_confidence: EstimationConfidence {
                boats_for_half_confidence: 3.0,
            },
            downwind_estimation_confidence: EstimationConfidence {
                boats_for_half_confidence: 5.0,
            },
        }
    }

    /// Look up a well-known class, ignoring case.
    pub fn by_name(name: &str) -> Option<BoatClass> {
        KNOWN_CLASSES.get(&name.to_lowercase()).cloned()
    }

    pub fn known_class_names() -> Vec<String> {
        let mut names: Vec<String> = KNOWN_CLASSES.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    /// Reaching legs use the upwind angle.
    pub fn minimum_angle_between_different_tacks(&self, leg_type: LegType) -> f64 {
        match leg_type {
            LegType::Downwind => self.min_angle_between_tacks_downwind_degrees,
            LegType::Upwind | LegType::Reaching => self.min_angle_between_tacks_upwind_degrees,
        }
    }

    pub fn estimation_confidence(&self, leg_type: LegType, boats: usize) -> f64 {
        match leg_type {
            LegType::Downwind => self.downwind_estimation_confidence.confidence(boats),
            LegType::Upwind | LegType::Reaching => self.upwind_estimation_confidence.confidence(boats),
        }
    }
}

static KNOWN_CLASSES: Lazy<HashMap<String, BoatClass>> = Lazy::new(|| {
    let classes = [
        BoatClass {
            approximate_maneuver_duration_millis: 6_000,
            ..BoatClass::new("ILCA 7", 4.23)
        },
        BoatClass {
            approximate_maneuver_duration_millis: 6_000,
            ..BoatClass::new("505", 5.05)
        },
        BoatClass {
            approximate_maneuver_duration_millis: 5_000,
            min_angle_between_tacks_downwind_degrees: 35.0,
            ..BoatClass::new("49er", 4.99)
        },
        BoatClass {
            approximate_maneuver_duration_millis: 10_000,
            ..BoatClass::new("Star", 6.92)
        },
        BoatClass::new("J/70", 6.93),
        BoatClass {
            approximate_maneuver_duration_millis: 12_000,
            ..BoatClass::new("Dragon", 8.9)
        },
    ];
    classes
        .into_iter()
        .map(|c| (c.name.to_lowercase(), c))
        .collect()
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let star = BoatClass::by_name("star").unwrap();
        assert_eq!(star.name, "Star");
        assert!((star.hull_length.meters() - 6.92).abs() < 1e-9);
        assert!(BoatClass::by_name("Optimist").is_none());
        assert!(BoatClass::known_class_names().contains(&"49er".to_string()));
    }

    #[test]
    fn test_estimation_confidence_grows_with_boats() {
        let class = BoatClass::default();
        assert_eq!(class.estimation_confidence(LegType::Upwind, 0), 0.0);
        assert!((class.estimation_confidence(LegType::Upwind, 3) - 0.5).abs() < 1e-9);
        assert!(class.estimation_confidence(LegType::Upwind, 10) > class.estimation_confidence(LegType::Upwind, 3));
        assert!(class.estimation_confidence(LegType::Downwind, 3) < class.estimation_confidence(LegType::Upwind, 3));
    }

    #[test]
    fn test_tack_angles_per_leg_type() {
        let class = BoatClass::by_name("49er").unwrap();
        assert_eq!(class.minimum_angle_between_different_tacks(LegType::Downwind), 35.0);
        assert_eq!(class.minimum_angle_between_different_tacks(LegType::Reaching), 45.0);
    }
}
