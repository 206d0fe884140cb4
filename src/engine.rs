//! # Race Registry
//!
//! Process-wide set of tracked races, shared by ingestion and query
//! front ends.
//!
//! ## Architecture
//!
//! The registry is a singleton that only maps race ids to shared races.
//! Races synchronize internally, so the registry lock is held just long
//! enough to look a race up; all work on a race happens outside of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::Result;
use crate::race::{RaceStatus, TrackedRace, TrackedRaceStatus};
use crate::sync;

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct RaceRegistry {
    races: HashMap<String, Arc<TrackedRace>>,
}

impl RaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a race under its id, replacing a race with the same id.
    pub fn add(&mut self, race: TrackedRace) -> Arc<TrackedRace> {
        self.add_shared(Arc::new(race))
    }

    pub fn add_shared(&mut self, race: Arc<TrackedRace>) -> Arc<TrackedRace> {
        let id = race.id().to_string();
        if self.races.insert(id.clone(), Arc::clone(&race)).is_some() {
            warn!("[RaceRegistry] Replaced race {}", id);
        } else {
            info!("[RaceRegistry] Added race {}", id);
        }
        race
    }

    pub fn get(&self, id: &str) -> Option<Arc<TrackedRace>> {
        self.races.get(id).cloned()
    }

    /// Unregister a race and mark it removed. Holders of the race keep a
    /// usable instance.
    pub fn remove(&mut self, id: &str) -> Option<Arc<TrackedRace>> {
        let race = self.races.remove(id)?;
        race.set_status(TrackedRaceStatus::new(RaceStatus::Removed, 0.0));
        info!("[RaceRegistry] Removed race {}", id);
        Some(race)
    }

    pub fn race_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.races.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn race_count(&self) -> usize {
        self.races.len()
    }

    pub fn has_race(&self, id: &str) -> bool {
        self.races.contains_key(id)
    }

    pub fn clear(&mut self) {
        for id in self.race_ids() {
            self.remove(&id);
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            race_count: self.races.len(),
            ..RegistryStats::default()
        };
        for race in self.races.values() {
            let race_stats = race.stats();
            stats.competitor_count += race_stats.competitor_count;
            stats.fix_count += race_stats.fix_count;
            stats.wind_fix_count += race_stats.wind_fix_count;
            stats.update_count += race_stats.update_count;
        }
        stats
    }

    /// One summary per race, ordered by id.
    pub fn summaries(&self) -> Vec<RaceSummary> {
        self.race_ids()
            .into_iter()
            .filter_map(|id| self.races.get(&id))
            .map(|race| RaceSummary {
                id: race.id().to_string(),
                event: race.event().to_string(),
                boat_class: race.boat_class().name.clone(),
                status: race.status().status,
                competitor_count: race.competitors().len(),
                leg_count: race.leg_count(),
                update_count: race.update_count(),
            })
            .collect()
    }

    pub fn summaries_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.summaries())?)
    }
}

/// Registry statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub race_count: usize,
    pub competitor_count: usize,
    pub fix_count: usize,
    pub wind_fix_count: usize,
    pub update_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceSummary {
    pub id: String,
    pub event: String,
    pub boat_class: String,
    pub status: RaceStatus,
    pub competitor_count: usize,
    pub leg_count: usize,
    pub update_count: u64,
}

// ============================================================================
// Global Singleton
// ============================================================================

/// Global registry instance.
pub static REGISTRY: Lazy<Mutex<RaceRegistry>> = Lazy::new(|| Mutex::new(RaceRegistry::new()));

/// Run `f` with the global registry locked.
pub fn with_registry<F, R>(f: F) -> R
where
    F: FnOnce(&mut RaceRegistry) -> R,
{
    let mut registry = sync::lock(&REGISTRY);
    f(&mut registry)
}
