//! # Change Listeners
//!
//! Push notifications for tracks, wind tracks and races. Every registry
//! dispatches to a snapshot of its listeners with an error boundary per
//! call: an `Err` or a panic from one listener is logged and the remaining
//! listeners still get the event. Nothing a listener does propagates back to
//! the code path that triggered the notification.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::error;

use crate::course::{CompetitorId, MarkId};
use crate::error::Result;
use crate::mark_passing::MarkPassing;
use crate::race::{RaceTimes, TrackedRaceStatus};
use crate::sync;
use crate::track::{GpsFix, GpsFixMoving};
use crate::wind::{Wind, WindSource};

// ============================================================================
// Listener traits
// ============================================================================

/// Notified by a [`crate::track::Track`] after its write lock is released.
pub trait GpsTrackListener<F>: Send + Sync {
    fn fix_received(&self, _fix: &F, _track_name: &str, _first_fix_in_track: bool) -> Result<()> {
        Ok(())
    }

    fn speed_averaging_changed(&self, _old_millis: i64, _new_millis: i64) -> Result<()> {
        Ok(())
    }
}

/// Notified by a [`crate::wind::WindTrack`].
pub trait WindListener: Send + Sync {
    fn wind_received(&self, _wind: &Wind) -> Result<()> {
        Ok(())
    }

    fn wind_removed(&self, _wind: &Wind) -> Result<()> {
        Ok(())
    }

    fn averaging_changed(&self, _old_millis: i64, _new_millis: i64) -> Result<()> {
        Ok(())
    }
}

/// Everything a [`crate::race::TrackedRace`] announces.
#[derive(Debug, Clone, PartialEq)]
pub enum RaceChangeEvent {
    StatusChanged {
        old: TrackedRaceStatus,
        new: TrackedRaceStatus,
    },
    WindSourcesToExcludeChanged {
        sources: Vec<WindSource>,
    },
    RaceTimesChanged {
        times: RaceTimes,
    },
    MarkPositionChanged {
        mark: MarkId,
        fix: GpsFix,
    },
    WindDataReceived {
        source: WindSource,
        wind: Wind,
    },
    WindDataRemoved {
        source: WindSource,
        wind: Wind,
    },
    WindAveragingChanged {
        old_millis: i64,
        new_millis: i64,
    },
    SpeedAveragingChanged {
        old_millis: i64,
        new_millis: i64,
    },
    CompetitorPositionChanged {
        competitor: CompetitorId,
        fix: GpsFixMoving,
    },
    MarkPassingsChanged {
        competitor: CompetitorId,
        old: Vec<MarkPassing>,
        new: Vec<MarkPassing>,
    },
    CourseChanged,
}

pub trait RaceChangeListener: Send + Sync {
    fn race_changed(&self, event: &RaceChangeEvent) -> Result<()>;
}

impl<T> RaceChangeListener for T
where
    T: Fn(&RaceChangeEvent) -> Result<()> + Send + Sync,
{
    fn race_changed(&self, event: &RaceChangeEvent) -> Result<()> {
        self(event)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Set of listeners of one kind, dispatched with per-listener isolation.
pub struct Listeners<L: ?Sized> {
    owner: &'static str,
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Listeners<L> {
    pub fn new(owner: &'static str) -> Self {
        Self {
            owner,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        sync::lock(&self.listeners).push(listener);
    }

    /// Remove by identity. Returns whether the listener was registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = sync::lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for every listener registered at the time of the call.
    /// The registry lock is not held while listeners run, so a listener may
    /// add or remove listeners.
    pub fn notify<F>(&self, f: F)
    where
        F: Fn(&L) -> Result<()>,
    {
        let snapshot: Vec<Arc<L>> = sync::lock(&self.listeners).clone();
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| f(&listener))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("[{}] Listener failed: {}", self.owner, e),
                Err(panic) => error!(
                    "[{}] Listener panicked: {}",
                    self.owner,
                    panic_message(panic.as_ref())
                ),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
