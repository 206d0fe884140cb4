//! # Mark Passings
//!
//! When each competitor rounded each waypoint. A competitor's passings are
//! always replaced as a whole; the store keeps a per-competitor view in time
//! order and a per-waypoint view ordered by time with competitor tiebreak.

use std::collections::HashMap;

use log::error;
use serde::{Deserialize, Serialize};

use crate::course::{CompetitorId, Course, WaypointId};
use crate::geo_utils::TimePoint;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkPassing {
    pub time_point: TimePoint,
    pub waypoint: WaypointId,
    pub competitor: CompetitorId,
}

impl MarkPassing {
    pub fn new(time_point: TimePoint, waypoint: WaypointId, competitor: CompetitorId) -> Self {
        Self {
            time_point,
            waypoint,
            competitor,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MarkPassingStore {
    by_competitor: HashMap<CompetitorId, Vec<MarkPassing>>,
    by_waypoint: HashMap<WaypointId, Vec<MarkPassing>>,
}

impl MarkPassingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all passings of `competitor`. Passings for waypoints that are
    /// not part of `course`, or for another competitor, are logged and dropped.
    /// Returns the previous passings.
    pub fn update(
        &mut self,
        competitor: &CompetitorId,
        passings: Vec<MarkPassing>,
        course: &Course,
    ) -> Vec<MarkPassing> {
        let mut accepted: Vec<MarkPassing> = passings
            .into_iter()
            .filter(|p| {
                if &p.competitor != competitor {
                    error!(
                        "[MarkPassingStore] Dropping passing of {} delivered for {}",
                        p.competitor, competitor
                    );
                    false
                } else if course.index_of(&p.waypoint).is_none() {
                    error!(
                        "[MarkPassingStore] Dropping passing of {} for waypoint {} which is not in course {}",
                        competitor, p.waypoint, course.name
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        accepted.sort_by_key(|p| p.time_point);

        let old = self.by_competitor.remove(competitor).unwrap_or_default();
        for passing in &old {
            if let Some(list) = self.by_waypoint.get_mut(&passing.waypoint) {
                list.retain(|p| &p.competitor != competitor);
            }
        }
        for passing in &accepted {
            let list = self.by_waypoint.entry(passing.waypoint.clone()).or_default();
            let idx = list.partition_point(|p| {
                (p.time_point, &p.competitor) < (passing.time_point, &passing.competitor)
            });
            list.insert(idx, passing.clone());
        }
        if !accepted.is_empty() {
            self.by_competitor.insert(competitor.clone(), accepted);
        }
        old
    }

    /// Drop everything recorded for a waypoint that left the course.
    pub fn remove_waypoint(&mut self, waypoint: &WaypointId) {
        if let Some(removed) = self.by_waypoint.remove(waypoint) {
            for passing in removed {
                if let Some(list) = self.by_competitor.get_mut(&passing.competitor) {
                    list.retain(|p| &p.waypoint != waypoint);
                }
            }
        }
    }

    pub fn passings_of(&self, competitor: &CompetitorId) -> &[MarkPassing] {
        self.by_competitor
            .get(competitor)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn passings_in_order(&self, waypoint: &WaypointId) -> &[MarkPassing] {
        self.by_waypoint
            .get(waypoint)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn passing(&self, competitor: &CompetitorId, waypoint: &WaypointId) -> Option<&MarkPassing> {
        self.passings_of(competitor)
            .iter()
            .find(|p| &p.waypoint == waypoint)
    }

    pub fn first_passing(&self, waypoint: &WaypointId) -> Option<&MarkPassing> {
        self.passings_in_order(waypoint).first()
    }

    pub fn last_passing_at_or_before(&self, competitor: &CompetitorId, t: TimePoint) -> Option<&MarkPassing> {
        self.passings_of(competitor)
            .iter()
            .take_while(|p| p.time_point <= t)
            .last()
    }

    /// Earliest and latest passing over all competitors.
    pub fn time_range(&self) -> Option<(TimePoint, TimePoint)> {
        let mut times = self.by_competitor.values().flatten().map(|p| p.time_point);
        let first = times.next()?;
        Some(times.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t))))
    }

    pub fn competitors(&self) -> impl Iterator<Item = &CompetitorId> {
        self.by_competitor.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::{MarkId, Waypoint};

    fn course() -> Course {
        Course::new(
            "triangle",
            vec![
                Waypoint::mark("start", MarkId::new("s")),
                Waypoint::mark("wing", MarkId::new("w")),
                Waypoint::mark("finish", MarkId::new("f")),
            ],
        )
        .unwrap()
    }

    fn passing(secs: i64, waypoint: &str, competitor: &str) -> MarkPassing {
        MarkPassing::new(
            TimePoint::from_millis(secs * 1000),
            WaypointId::new(waypoint),
            CompetitorId::new(competitor),
        )
    }

    #[test]
    fn test_unknown_waypoint_is_dropped() {
        let mut store = MarkPassingStore::new();
        let a = CompetitorId::new("a");
        store.update(
            &a,
            vec![passing(0, "start", "a"), passing(50, "ghost", "a"), passing(100, "wing", "a")],
            &course(),
        );
        assert_eq!(store.passings_of(&a).len(), 2);
        assert!(store.passing(&a, &WaypointId::new("ghost")).is_none());
        assert_eq!(
            store.passing(&a, &WaypointId::new("wing")).map(|p| p.time_point),
            Some(TimePoint::from_millis(100_000))
        );
    }

    #[test]
    fn test_update_replaces_wholesale() {
        let mut store = MarkPassingStore::new();
        let a = CompetitorId::new("a");
        let b = CompetitorId::new("b");
        store.update(&a, vec![passing(10, "start", "a"), passing(100, "wing", "a")], &course());
        store.update(&b, vec![passing(5, "start", "b")], &course());

        let start = WaypointId::new("start");
        let order: Vec<_> = store.passings_in_order(&start).iter().map(|p| p.competitor.clone()).collect();
        assert_eq!(order, vec![b.clone(), a.clone()]);

        let old = store.update(&a, vec![passing(3, "start", "a")], &course());
        assert_eq!(old.len(), 2);
        assert!(store.passing(&a, &WaypointId::new("wing")).is_none());
        assert_eq!(store.first_passing(&start).map(|p| p.competitor.clone()), Some(a.clone()));
        assert_eq!(
            store.last_passing_at_or_before(&a, TimePoint::from_millis(2_000)),
            None
        );
        assert_eq!(store.time_range(), Some((TimePoint::from_millis(3_000), TimePoint::from_millis(5_000))));
    }

    #[test]
    fn test_same_time_tiebreak_by_competitor() {
        let mut store = MarkPassingStore::new();
        store.update(&CompetitorId::new("z"), vec![passing(7, "start", "z")], &course());
        store.update(&CompetitorId::new("m"), vec![passing(7, "start", "m")], &course());
        let first = store.first_passing(&WaypointId::new("start")).unwrap();
        assert_eq!(first.competitor, CompetitorId::new("m"));
    }
}
