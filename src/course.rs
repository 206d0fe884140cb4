//! # Course Model
//!
//! Competitors, marks and the ordered waypoint list that defines the legs of
//! a race. Identity is by string id throughout.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RaceError, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Unique competitor id
    CompetitorId
);
string_id!(MarkId);
string_id!(WaypointId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub id: CompetitorId,
    pub name: String,
    pub sail_id: Option<String>,
}

impl Competitor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: CompetitorId::new(id),
            name: name.into(),
            sail_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub id: MarkId,
    pub name: String,
}

impl Mark {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: MarkId::new(id),
            name: name.into(),
        }
    }
}

/// A single mark to round, or a gate/line formed by two marks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub id: WaypointId,
    pub marks: Vec<MarkId>,
}

impl Waypoint {
    pub fn mark(id: impl Into<String>, mark: MarkId) -> Self {
        Self {
            id: WaypointId::new(id),
            marks: vec![mark],
        }
    }

    pub fn gate(id: impl Into<String>, port: MarkId, starboard: MarkId) -> Self {
        Self {
            id: WaypointId::new(id),
            marks: vec![port, starboard],
        }
    }
}

/// Leg `index` goes from waypoint `index` to waypoint `index + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Leg {
    pub index: usize,
    pub from: WaypointId,
    pub to: WaypointId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub name: String,
    waypoints: Vec<Waypoint>,
}

impl Course {
    /// A course needs at least a start and a finish.
    pub fn new(name: impl Into<String>, waypoints: Vec<Waypoint>) -> Result<Self> {
        let name = name.into();
        if waypoints.len() < 2 {
            return Err(RaceError::InvalidCourse {
                message: format!("course {} needs at least two waypoints, got {}", name, waypoints.len()),
            });
        }
        for (i, w) in waypoints.iter().enumerate() {
            if waypoints[..i].iter().any(|other| other.id == w.id) {
                return Err(RaceError::InvalidCourse {
                    message: format!("duplicate waypoint {}", w.id),
                });
            }
        }
        Ok(Self { name, waypoints })
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn waypoint(&self, id: &WaypointId) -> Option<&Waypoint> {
        self.waypoints.iter().find(|w| &w.id == id)
    }

    pub fn index_of(&self, id: &WaypointId) -> Option<usize> {
        self.waypoints.iter().position(|w| &w.id == id)
    }

    pub fn first_waypoint(&self) -> Option<&Waypoint> {
        self.waypoints.first()
    }

    pub fn last_waypoint(&self) -> Option<&Waypoint> {
        self.waypoints.last()
    }

    pub fn legs(&self) -> Vec<Leg> {
        self.waypoints
            .windows(2)
            .enumerate()
            .map(|(index, pair)| Leg {
                index,
                from: pair[0].id.clone(),
                to: pair[1].id.clone(),
            })
            .collect()
    }

    pub fn leg_count(&self) -> usize {
        self.waypoints.len().saturating_sub(1)
    }

    pub fn leg(&self, index: usize) -> Option<Leg> {
        if index + 1 < self.waypoints.len() {
            Some(Leg {
                index,
                from: self.waypoints[index].id.clone(),
                to: self.waypoints[index + 1].id.clone(),
            })
        } else {
            None
        }
    }

    pub fn leg_starting_at(&self, id: &WaypointId) -> Option<Leg> {
        self.index_of(id).and_then(|i| self.leg(i))
    }

    pub fn leg_finishing_at(&self, id: &WaypointId) -> Option<Leg> {
        match self.index_of(id) {
            Some(i) if i > 0 => self.leg(i - 1),
            _ => None,
        }
    }

    /// All marks referenced by the course, in waypoint order, deduplicated.
    pub fn marks(&self) -> Vec<MarkId> {
        let mut marks: Vec<MarkId> = Vec::new();
        for mark in self.waypoints.iter().flat_map(|w| w.marks.iter()) {
            if !marks.contains(mark) {
                marks.push(mark.clone());
            }
        }
        marks
    }

    pub fn add_waypoint(&mut self, index: usize, waypoint: Waypoint) -> Result<()> {
        if index > self.waypoints.len() {
            return Err(RaceError::InvalidCourse {
                message: format!("waypoint index {} out of range 0..={}", index, self.waypoints.len()),
            });
        }
        if self.index_of(&waypoint.id).is_some() {
            return Err(RaceError::InvalidCourse {
                message: format!("duplicate waypoint {}", waypoint.id),
            });
        }
        self.waypoints.insert(index, waypoint);
        Ok(())
    }

    pub fn remove_waypoint(&mut self, id: &WaypointId) -> Result<Waypoint> {
        let index = self.index_of(id).ok_or_else(|| RaceError::UnknownWaypoint {
            waypoint: id.to_string(),
        })?;
        if self.waypoints.len() <= 2 {
            return Err(RaceError::InvalidCourse {
                message: format!("removing {} would leave fewer than two waypoints", id),
            });
        }
        Ok(self.waypoints.remove(index))
    }
}
