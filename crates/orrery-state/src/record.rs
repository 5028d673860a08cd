//! Per-entity record held by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attributes::{Attributes, GeoPosition};
use crate::identity::EntityKey;
use crate::trail::Trail;

// ---------------------------------------------------------------------------
// TargetStatus
// ---------------------------------------------------------------------------

/// Lifecycle of an observation target. Ordered: a status only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// The target appeared (location published).
    Started,
    /// A satellite sensor observed the target.
    Detected,
    /// The observation reached a ground station.
    Reported,
}

/// Result of applying a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The status moved forward.
    Advanced {
        from: Option<TargetStatus>,
        to: TargetStatus,
    },
    /// The record already had this status or a later one.
    Unchanged,
}

// ---------------------------------------------------------------------------
// Footprint
// ---------------------------------------------------------------------------

/// Ground footprint of a sensor: a circle centered at the sub-satellite
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub center: GeoPosition,
    /// Radius in meters.
    pub radius: f64,
}

impl Footprint {
    /// Derive the footprint from the sensor radius, if one was reported.
    pub fn derive(attributes: &Attributes) -> Option<Self> {
        attributes
            .sensor
            .radius
            .filter(|r| *r > 0.0)
            .map(|radius| Footprint {
                center: attributes.position.ground_point(),
                radius,
            })
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// Everything known about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    /// Latest attribute snapshot, replaced wholesale on every sighting.
    pub attributes: Attributes,
    /// Resolved display category.
    pub category: String,
    pub trail: Trail,
    pub footprint: Option<Footprint>,
    /// Target lifecycle status; `None` for non-target kinds.
    pub status: Option<TargetStatus>,
    /// Actor named by the most recent status event (`detectedBy`, ...).
    pub status_actor: Option<String>,
    /// Simulated instant of the most recent status event.
    pub status_at: Option<DateTime<Utc>>,
    /// Store sequence number of the first sighting.
    pub first_seq: u64,
    /// Store sequence number of the latest mutation.
    pub last_seq: u64,
    /// Number of snapshots applied, including the first.
    pub sightings: u64,
}

impl EntityRecord {
    /// Simulated instant of the most recent snapshot, if known.
    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.attributes.observed_at
    }
}
