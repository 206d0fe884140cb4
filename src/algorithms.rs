//! # Algorithm Toolbox
//!
//! Direct access to the analytics building blocks without a tracked race:
//! confidence weighting, wind averaging, bearing clustering, track
//! simplification and maneuver classification.
//!
//! # Example
//!
//! ```rust
//! use sailing_analytics::algorithms::{BearingCluster, Bearing};
//!
//! let mut fleet = BearingCluster::new();
//! fleet.add(Bearing::from_degrees(45.0), 1.0);
//! fleet.add(Bearing::from_degrees(315.0), 1.0);
//! let (port, starboard) = fleet.split_in_two(30.0);
//! assert_eq!(port.len() + starboard.len(), 2);
//! ```

// =============================================================================
// Core Types
// =============================================================================

pub use crate::geo_utils::{Bearing, CourseChange, Distance, Position, Speed, SpeedWithBearing, TimePoint};

// =============================================================================
// Confidence and Weighting
// =============================================================================

pub use crate::confidence::{
    average_speed_with_bearing, BearingAccumulator, ExponentialTimeWeigher, HyperbolicTimeWeigher,
    PositionAndTime, PositionAndTimeWeigher, ScalarAccumulator, SpeedSample, Weigher, WithConfidence,
};

/// Bearings with confidences, splittable into two tacks
pub use crate::confidence::BearingCluster;

// =============================================================================
// Wind
// =============================================================================

/// Confidence-weighted combination of wind samples. Speeds of samples
/// flagged `use_speed = false` do not contribute.
pub use crate::wind::average_winds;
pub use crate::wind::{Wind, WindSample, WindSource, WindSourceType, WindWithConfidence};

// =============================================================================
// Line Simplification
// =============================================================================

/// Douglas-Peucker on fixes with a metric tolerance.
pub use crate::douglas_peucker::{approximate, simplify};

// =============================================================================
// Maneuvers
// =============================================================================

pub use crate::maneuver::{
    classify, count_of, course_changes_along, group_course_changes, tack, turn_passes_through, CourseChangeAtFix,
    Maneuver, ManeuverType, Tack,
};
