//! # Race State
//!
//! Snapshot of everything recorded for a race. Derived values (caches,
//! rankings, maneuvers) and listeners are not part of it; a race loaded
//! from a snapshot rebuilds them on demand.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::{RaceConfig, RaceTimes, TrackedRace, TrackedRaceStatus};
use crate::boat_class::BoatClass;
use crate::course::{Competitor, CompetitorId, Course, MarkId};
use crate::error::{RaceError, Result};
use crate::mark_passing::MarkPassing;
use crate::sync;
use crate::track::{GpsFix, GpsFixMoving};
use crate::wind::{Wind, WindSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceState {
    pub event: String,
    pub id: String,
    pub boat_class: BoatClass,
    pub competitors: Vec<Competitor>,
    pub course: Course,
    pub config: RaceConfig,
    pub times: RaceTimes,
    pub status: TrackedRaceStatus,
    pub wind_sources_to_exclude: Vec<WindSource>,
    /// Raw fixes, outliers included
    pub competitor_fixes: Vec<(CompetitorId, Vec<GpsFixMoving>)>,
    pub mark_fixes: Vec<(MarkId, Vec<GpsFix>)>,
    pub winds: Vec<(WindSource, Vec<Wind>)>,
    pub mark_passings: Vec<MarkPassing>,
}

fn io_error(path: &Path, err: std::io::Error) -> RaceError {
    RaceError::Serialization {
        message: format!("{}: {}", path.display(), err),
    }
}

impl RaceState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?).map_err(|e| io_error(path, e))
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        Self::from_json(&json)
    }
}

impl TrackedRace {
    pub fn save_state(&self) -> RaceState {
        let mut competitor_fixes: Vec<_> = self
            .competitor_tracks
            .iter()
            .map(|(id, track)| (id.clone(), track.raw_fixes()))
            .collect();
        competitor_fixes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut mark_fixes: Vec<_> = sync::read(&self.mark_tracks)
            .iter()
            .map(|(id, track)| (id.clone(), track.raw_fixes()))
            .collect();
        mark_fixes.sort_by(|a, b| a.0.cmp(&b.0));

        let winds = sync::read(&self.wind_tracks)
            .iter()
            .map(|(source, track)| (source.clone(), track.winds()))
            .collect();

        let mark_passings = {
            let store = sync::read(&self.mark_passings);
            self.competitors
                .iter()
                .flat_map(|c| store.passings_of(&c.id).to_vec())
                .collect()
        };

        RaceState {
            event: self.event.clone(),
            id: self.id.clone(),
            boat_class: self.boat_class.clone(),
            competitors: self.competitors.clone(),
            course: self.course(),
            config: self.config(),
            times: self.times(),
            status: self.status(),
            wind_sources_to_exclude: self.wind_sources_to_exclude(),
            competitor_fixes,
            mark_fixes,
            winds,
            mark_passings,
        }
    }

    /// Rebuild a race from a snapshot. Fixes and passings of competitors
    /// that are not part of the snapshot's race are skipped.
    pub fn from_state(state: RaceState) -> Result<TrackedRace> {
        let race = TrackedRace::new(
            state.event,
            state.id,
            state.boat_class,
            state.competitors,
            state.course,
            state.config,
        );
        *sync::write(&race.times) = state.times;
        *sync::write(&race.status) = state.status;
        *sync::write(&race.wind_sources_to_exclude) = state.wind_sources_to_exclude.into_iter().collect();

        for (competitor, fixes) in state.competitor_fixes {
            let Ok(track) = race.competitor_track(&competitor) else {
                warn!("[TrackedRace] Skipping fixes of unknown competitor {}", competitor);
                continue;
            };
            for fix in fixes {
                track.add(fix);
            }
        }
        for (mark, fixes) in state.mark_fixes {
            let track = race.mark_track_or_create(&mark);
            for fix in fixes {
                track.add(fix);
            }
        }
        for (source, winds) in state.winds {
            let track = race.wind_track_or_create(&source);
            for wind in winds {
                track.add(wind);
            }
        }

        let mut passings: HashMap<CompetitorId, Vec<MarkPassing>> = HashMap::new();
        for passing in state.mark_passings {
            passings.entry(passing.competitor.clone()).or_default().push(passing);
        }
        for (competitor, passings) in passings {
            if let Err(e) = race.update_mark_passings(&competitor, passings) {
                warn!("[TrackedRace] Skipping mark passings: {}", e);
            }
        }

        race.updated(None);
        race.flush_deferred_cache_clearing();
        info!("[TrackedRace] Loaded state of {}", race.id);
        Ok(race)
    }
}
