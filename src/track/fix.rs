//! Fix types stored in tracks.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::geo_utils::{Position, SpeedWithBearing, TimePoint};

/// A single timestamped observation. Fixes are immutable values; anything
/// derived from them (validity, estimated speed) lives in side tables owned
/// by the track.
pub trait Fix: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Whether fixes of this type carry a device-measured speed and bearing.
    /// Such tracks need only one nearby fix for a speed estimate.
    const CARRIES_SPEED: bool;

    fn position(&self) -> Position;

    fn time_point(&self) -> TimePoint;

    fn measured_speed(&self) -> Option<SpeedWithBearing> {
        None
    }
}

/// Position-only fix (marks, plain loggers).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub position: Position,
    pub time_point: TimePoint,
}

impl GpsFix {
    pub fn new(position: Position, time_point: TimePoint) -> Self {
        Self {
            position,
            time_point,
        }
    }
}

impl Fix for GpsFix {
    const CARRIES_SPEED: bool = false;

    fn position(&self) -> Position {
        self.position
    }

    fn time_point(&self) -> TimePoint {
        self.time_point
    }
}

/// Fix with speed and course over ground as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFixMoving {
    pub position: Position,
    pub time_point: TimePoint,
    pub speed: SpeedWithBearing,
}

impl GpsFixMoving {
    pub fn new(position: Position, time_point: TimePoint, speed: SpeedWithBearing) -> Self {
        Self {
            position,
            time_point,
            speed,
        }
    }
}

impl Fix for GpsFixMoving {
    const CARRIES_SPEED: bool = true;

    fn position(&self) -> Position {
        self.position
    }

    fn time_point(&self) -> TimePoint {
        self.time_point
    }

    fn measured_speed(&self) -> Option<SpeedWithBearing> {
        Some(self.speed)
    }
}
