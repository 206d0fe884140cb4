//! # Wind Store
//!
//! Pluggable persistence for recorded wind. The race loads historical wind
//! through this trait in the background and keeps tracking meanwhile.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::sync;
use crate::wind::{Wind, WindConfig, WindSource, WindTrack};

pub trait WindStore: Send + Sync {
    /// All stored wind tracks of a race.
    fn load_wind_tracks(
        &self,
        event: &str,
        race: &str,
        millis_over_which_to_average: i64,
    ) -> Result<HashMap<WindSource, WindTrack>>;

    /// Wind track for one source. `invalidation_delay_millis` lets caching
    /// stores batch write-backs; stores without a cache ignore it.
    fn wind_track(
        &self,
        event: &str,
        race: &str,
        source: &WindSource,
        millis_over_which_to_average: i64,
        invalidation_delay_millis: i64,
    ) -> Result<WindTrack>;
}

type RaceKey = (String, String);

/// Process-local store, used for replays and tests.
#[derive(Default)]
pub struct InMemoryWindStore {
    winds: RwLock<HashMap<RaceKey, HashMap<WindSource, Vec<Wind>>>>,
}

impl InMemoryWindStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, event: &str, race: &str, source: WindSource, wind: Wind) {
        sync::write(&self.winds)
            .entry((event.to_string(), race.to_string()))
            .or_default()
            .entry(source)
            .or_default()
            .push(wind);
    }

    fn build_track(source: &WindSource, winds: &[Wind], millis_over_which_to_average: i64) -> WindTrack {
        let config = WindConfig {
            millis_over_which_to_average_wind: millis_over_which_to_average,
            ..WindConfig::default()
        };
        let track = WindTrack::new(source.clone(), config);
        for wind in winds {
            track.add(*wind);
        }
        track
    }
}

impl WindStore for InMemoryWindStore {
    fn load_wind_tracks(
        &self,
        event: &str,
        race: &str,
        millis_over_which_to_average: i64,
    ) -> Result<HashMap<WindSource, WindTrack>> {
        let winds = sync::read(&self.winds);
        let key = (event.to_string(), race.to_string());
        Ok(winds
            .get(&key)
            .map(|sources| {
                sources
                    .iter()
                    .map(|(source, ws)| {
                        (source.clone(), Self::build_track(source, ws, millis_over_which_to_average))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn wind_track(
        &self,
        event: &str,
        race: &str,
        source: &WindSource,
        millis_over_which_to_average: i64,
        _invalidation_delay_millis: i64,
    ) -> Result<WindTrack> {
        let winds = sync::read(&self.winds);
        let key = (event.to_string(), race.to_string());
        let stored = winds
            .get(&key)
            .and_then(|sources| sources.get(source))
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(Self::build_track(source, stored, millis_over_which_to_average))
    }
}
