//! Entity attribute snapshots.
//!
//! An [`EntitySnapshot`] is the store-facing form of one inbound entity
//! payload: identity plus the full set of [`Attributes`] the publisher sent.
//! Snapshots replace the previous attributes wholesale; fields a publisher
//! omits are simply absent in the new snapshot.

use chrono::{DateTime, Utc};
use orrery_wire::entity::{GroundLocation, SatelliteStatus, TargetLocation};
use serde::{Deserialize, Serialize};

use crate::identity::EntityKey;

// ---------------------------------------------------------------------------
// GeoPosition
// ---------------------------------------------------------------------------

/// Geodetic position: degrees, degrees, meters above the ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl GeoPosition {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    /// The same position projected onto the surface.
    pub fn ground_point(&self) -> Self {
        Self {
            altitude: 0.0,
            ..*self
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor / link geometry
// ---------------------------------------------------------------------------

/// Sensor geometry reported by a satellite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorGeometry {
    /// Radius of the nadir footprint in meters.
    pub radius: Option<f64>,
    /// Instrument swath in meters.
    pub swath: Option<f64>,
}

/// Link capabilities reported by a ground station.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundLink {
    /// Minimum elevation angle in degrees.
    pub elevation_mask: Option<f64>,
    pub downlink_rate: Option<f64>,
    pub cost_per_second: Option<f64>,
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Latest known attributes of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub name: Option<String>,
    pub position: GeoPosition,
    /// Operational / sensor-on flag.
    pub operational: Option<bool>,
    /// Whether the entity currently has a ground link in view.
    pub in_comm_range: Option<bool>,
    pub velocity: Option<[f64; 3]>,
    pub sensor: SensorGeometry,
    pub link: GroundLink,
    /// Category chosen by the publisher; wins over table lookup.
    pub category: Option<String>,
    /// Simulated instant the snapshot describes, when known.
    pub observed_at: Option<DateTime<Utc>>,
}

impl Attributes {
    /// Attributes holding only a position.
    pub fn at(position: GeoPosition) -> Self {
        Self {
            name: None,
            position,
            operational: None,
            in_comm_range: None,
            velocity: None,
            sensor: SensorGeometry::default(),
            link: GroundLink::default(),
            category: None,
            observed_at: None,
        }
    }
}

/// One inbound full-state snapshot of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub key: EntityKey,
    pub attributes: Attributes,
}

impl EntitySnapshot {
    pub fn new(key: EntityKey, attributes: Attributes) -> Self {
        Self { key, attributes }
    }

    /// Stamp the snapshot with a simulated instant if the payload carried none.
    pub fn observed_at_or(mut self, instant: Option<DateTime<Utc>>) -> Self {
        if self.attributes.observed_at.is_none() {
            self.attributes.observed_at = instant;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Payload conversions
// ---------------------------------------------------------------------------

impl From<SatelliteStatus> for EntitySnapshot {
    fn from(p: SatelliteStatus) -> Self {
        Self {
            key: EntityKey::satellite(p.id),
            attributes: Attributes {
                name: p.name,
                position: GeoPosition::new(p.latitude, p.longitude, p.altitude),
                operational: p.state,
                in_comm_range: p.comm_range,
                velocity: p.velocity,
                sensor: SensorGeometry {
                    radius: p.radius,
                    swath: p.swath,
                },
                link: GroundLink::default(),
                category: p.category,
                observed_at: p.time,
            },
        }
    }
}

impl From<GroundLocation> for EntitySnapshot {
    fn from(p: GroundLocation) -> Self {
        Self {
            key: EntityKey::ground_station(p.ground_id),
            attributes: Attributes {
                name: p.name,
                operational: p.operational,
                link: GroundLink {
                    elevation_mask: p.elev_angle,
                    downlink_rate: p.downlink_rate,
                    cost_per_second: p.cost_per_second,
                },
                category: p.category,
                ..Attributes::at(GeoPosition::new(p.latitude, p.longitude, 0.0))
            },
        }
    }
}

impl From<TargetLocation> for EntitySnapshot {
    fn from(p: TargetLocation) -> Self {
        Self {
            key: EntityKey::target(p.id),
            attributes: Attributes {
                name: p.name,
                category: p.category,
                observed_at: p.started,
                ..Attributes::at(GeoPosition::new(p.latitude, p.longitude, 0.0))
            },
        }
    }
}
