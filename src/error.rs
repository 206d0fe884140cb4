//! Unified error handling for the sailing-analytics library.
//!
//! Missing data (no fix near a time, competitor not started yet) is modelled
//! as `Option` and never reaches this type. `RaceError` covers the cases where
//! a computation cannot proceed at all.

use thiserror::Error;

/// Unified error type for race analytics operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RaceError {
    /// A computation needs a wind direction and none can be determined yet.
    /// Callers decide whether to retry later or report "currently unknown".
    #[error("No wind information available: {message}")]
    NoWind { message: String },

    /// Competitor id not part of the race
    #[error("Competitor '{competitor}' is not part of this race")]
    UnknownCompetitor { competitor: String },

    /// Mark id not part of the course
    #[error("Mark '{mark}' is not part of this course")]
    UnknownMark { mark: String },

    /// Waypoint id not part of the course
    #[error("Waypoint '{waypoint}' is not part of this course")]
    UnknownWaypoint { waypoint: String },

    /// Leg index out of range
    #[error("Leg {index} does not exist")]
    UnknownLeg { index: usize },

    /// Course edit that would leave the course unusable
    #[error("Invalid course: {message}")]
    InvalidCourse { message: String },

    /// Returned by listener implementations. Logged by the dispatcher, never
    /// propagated to the caller that triggered the notification.
    #[error("Listener failed: {message}")]
    Listener { message: String },

    /// Race state snapshot could not be written or read
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Failure reported by a wind store implementation
    #[error("Wind store error: {message}")]
    WindStore { message: String },
}

impl From<serde_json::Error> for RaceError {
    fn from(err: serde_json::Error) -> Self {
        RaceError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for race analytics operations.
pub type Result<T> = std::result::Result<T, RaceError>;

/// Extension trait for converting Option to RaceError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a no-wind error.
    fn ok_or_no_wind(self, message: &str) -> Result<T>;

    /// Convert Option to Result with an unknown-competitor error.
    fn ok_or_unknown_competitor(self, competitor: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_no_wind(self, message: &str) -> Result<T> {
        self.ok_or_else(|| RaceError::NoWind {
            message: message.to_string(),
        })
    }

    fn ok_or_unknown_competitor(self, competitor: &str) -> Result<T> {
        self.ok_or_else(|| RaceError::UnknownCompetitor {
            competitor: competitor.to_string(),
        })
    }
}
