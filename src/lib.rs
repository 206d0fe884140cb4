//! # Sailing Analytics
//!
//! Live analytics for sailing races built from GPS tracks of competitors
//! and marks, wind measurements and mark passings.
//!
//! This library provides:
//! - Outlier-aware GPS tracks with cached distance and maximum speed queries
//! - Wind tracks combined by confidence, plus wind estimated from the fleet
//! - Legs with leg type, windward distances, ranks and gaps
//! - Maneuver detection (tacks, jibes, penalty circles)
//!
//! ## Features
//!
//! - **`parallel`** - Rank competitors in parallel with rayon
//! - **`property-tests`** - Enable property tests over the track caches
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use sailing_analytics::{
//!     BoatClass, Competitor, Course, GpsFixMoving, Position, RaceConfig, SpeedWithBearing,
//!     TimePoint, TrackedRace, Waypoint,
//! };
//!
//! let course = Course::new(
//!     "windward-leeward",
//!     vec![
//!         Waypoint::mark("start", "committee".into()),
//!         Waypoint::mark("top", "windward".into()),
//!     ],
//! )
//! .unwrap();
//! let race = TrackedRace::new(
//!     "regatta",
//!     "race-1",
//!     BoatClass::default(),
//!     vec![Competitor::new("ger-1", "Germany 1")],
//!     course,
//!     RaceConfig::default(),
//! );
//!
//! let fix = GpsFixMoving::new(
//!     Position::new(54.43, 10.19),
//!     TimePoint::from_seconds(0.0),
//!     SpeedWithBearing::default(),
//! );
//! race.record_fix(&"ger-1".into(), fix).unwrap();
//! assert_eq!(race.update_count(), 1);
//! ```

// Unified error handling
pub mod error;
pub use error::{OptionExt, RaceError, Result};

// Time points, positions, bearings, distances and speeds
pub mod geo_utils;
pub use geo_utils::{Bearing, Distance, Position, Speed, SpeedWithBearing, TimePoint};

// Weighers and confidence-weighted averaging
pub mod confidence;
pub use confidence::{PositionAndTime, Weigher, WithConfidence};

// Poison-tolerant lock helpers
mod sync;

// Change notification
pub mod listeners;
pub use listeners::{GpsTrackListener, RaceChangeEvent, RaceChangeListener, WindListener};

// GPS tracks with outlier detection and cached queries
pub mod track;
pub use track::{Fix, GpsFix, GpsFixMoving, Track, TrackConfig, TrackStats};

// Wind, wind sources and wind tracks
pub mod wind;
pub use wind::{Wind, WindConfig, WindSource, WindSourceType, WindTrack, WindWithConfidence};

// Persistent wind storage seam
pub mod wind_store;
pub use wind_store::{InMemoryWindStore, WindStore};

// Track simplification
pub mod douglas_peucker;

// Algorithm toolbox - standalone access to the building blocks
// Use sailing_analytics::algorithms::{...} without a tracked race
pub mod algorithms;

// Boat class parameters
pub mod boat_class;
pub use boat_class::BoatClass;

// Course, waypoints, marks and competitors
pub mod course;
pub use course::{Competitor, CompetitorId, Course, Leg, Mark, MarkId, Waypoint, WaypointId};

// Mark passings per competitor and per waypoint
pub mod mark_passing;
pub use mark_passing::MarkPassing;

// Maneuver detection
pub mod maneuver;
pub use maneuver::{Maneuver, ManeuverType, Tack};

// Legs and legs of competitors
pub mod leg;
pub use leg::{LegType, TrackedLegRef};
pub mod leg_of_competitor;
pub use leg_of_competitor::TrackedLegOfCompetitor;

// The tracked race
pub mod race;
pub use race::state::RaceState;
pub use race::{RaceConfig, RaceStats, RaceStatus, RaceTimes, TrackedRace, TrackedRaceStatus};

// Process-wide race registry (singleton)
pub mod engine;
pub use engine::{with_registry, RaceRegistry, RaceSummary, RegistryStats, REGISTRY};
