//! Entity snapshots published by the simulated participants.
//!
//! Three kinds of participant publish state an observer reconstructs:
//!
//! - satellites (`constellation.location`): a full position/sensor snapshot,
//!   republished on every wallclock interval;
//! - ground stations (`ground.location`): published once when the run starts;
//! - observation targets (fires, floods, snow sites): a location when the
//!   target appears, then `detected` / `reported` events that only carry the
//!   target identifier.
//!
//! Identifiers arrive as integers from some apps and strings from others; they
//! are normalized to strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::instant::de_opt_instant;
use crate::{require_finite, Payload, WireError};

// ---------------------------------------------------------------------------
// Identifier normalization
// ---------------------------------------------------------------------------

fn de_identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) if !s.is_empty() => Ok(s),
        serde_json::Value::Number(n) => Ok(number_identifier(&n)),
        other => Err(serde::de::Error::custom(format!(
            "identifier must be a non-empty string or a number, got {other}"
        ))),
    }
}

/// `7` and `7.0` name the same entity.
fn number_identifier(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

fn validate_position(latitude: f64, longitude: f64, altitude: Option<f64>) -> Result<(), WireError> {
    require_finite("latitude", latitude)?;
    require_finite("longitude", longitude)?;
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(WireError::InvalidValue {
            field: "latitude",
            value: latitude.to_string(),
            reason: "must be within [-90, 90] degrees",
        });
    }
    if let Some(alt) = altitude {
        require_finite("altitude", alt)?;
    }
    Ok(())
}

fn validate_radius(field: &'static str, value: Option<f64>) -> Result<(), WireError> {
    if let Some(r) = value {
        require_finite(field, r)?;
        if r < 0.0 {
            return Err(WireError::InvalidValue {
                field,
                value: r.to_string(),
                reason: "must not be negative",
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SatelliteStatus
// ---------------------------------------------------------------------------

/// Periodic status of one satellite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SatelliteStatus {
    #[serde(deserialize_with = "de_identifier")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Geodetic latitude in degrees.
    #[serde(alias = "lat")]
    pub latitude: f64,
    /// Geodetic longitude in degrees.
    #[serde(alias = "lon")]
    pub longitude: f64,
    /// Height above the ellipsoid in meters.
    #[serde(alias = "alt")]
    pub altitude: f64,
    /// Radius of the nadir sensor footprint in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    /// Earth-fixed velocity in km/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<[f64; 3]>,
    /// Earth-fixed cartesian position in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecef: Option<[f64; 3]>,
    /// Operational flag (sensor on/off).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
    /// Whether any ground station is in view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comm_range: Option<bool>,
    /// Instrument swath in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swath: Option<f64>,
    /// Simulated instant the snapshot describes.
    #[serde(
        default,
        deserialize_with = "de_opt_instant",
        skip_serializing_if = "Option::is_none"
    )]
    pub time: Option<DateTime<Utc>>,
    /// Display category chosen by the publisher, overriding lookup tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Payload for SatelliteStatus {
    const NAME: &'static str = "satellite status";

    fn validate(&self) -> Result<(), WireError> {
        validate_position(self.latitude, self.longitude, Some(self.altitude))?;
        validate_radius("radius", self.radius)?;
        validate_radius("swath", self.swath)?;
        for v in self.velocity.iter().chain(self.ecef.iter()).flatten() {
            require_finite("vector component", *v)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GroundLocation
// ---------------------------------------------------------------------------

/// Location and capabilities of one ground station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundLocation {
    #[serde(deserialize_with = "de_identifier", alias = "id")]
    pub ground_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon")]
    pub longitude: f64,
    /// Minimum elevation angle in degrees for a satellite to be in view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elev_angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Payload for GroundLocation {
    const NAME: &'static str = "ground location";

    fn validate(&self) -> Result<(), WireError> {
        validate_position(self.latitude, self.longitude, None)?;
        if let Some(angle) = self.elev_angle {
            require_finite("elevAngle", angle)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Appearance of an observation target (a fire, a flood, a survey site).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetLocation {
    #[serde(
        deserialize_with = "de_identifier",
        alias = "fireId",
        alias = "floodId",
        alias = "targetId"
    )]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon")]
    pub longitude: f64,
    /// Simulated instant the target appeared.
    #[serde(
        default,
        alias = "start",
        deserialize_with = "de_opt_instant",
        skip_serializing_if = "Option::is_none"
    )]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Payload for TargetLocation {
    const NAME: &'static str = "target location";

    fn validate(&self) -> Result<(), WireError> {
        validate_position(self.latitude, self.longitude, None)
    }
}

/// A status event about an existing target (`detected` / `reported`).
///
/// The same shape serves both events: publishers name the timestamp after
/// the event (`detected`, `reported`, `imaged`, `downlinked`) and the actor
/// fields after the role (`detectedBy`, `reportedTo`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetEvent {
    #[serde(
        deserialize_with = "de_identifier",
        alias = "fireId",
        alias = "floodId",
        alias = "targetId"
    )]
    pub id: String,
    #[serde(
        default,
        alias = "detected",
        alias = "reported",
        alias = "imaged",
        alias = "downlinked",
        deserialize_with = "de_opt_instant",
        skip_serializing_if = "Option::is_none"
    )]
    pub at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "detectedBy",
        alias = "reportedBy",
        alias = "imagedBy",
        alias = "downlinkedBy",
        skip_serializing_if = "Option::is_none"
    )]
    pub by: Option<String>,
    #[serde(
        default,
        alias = "reportedTo",
        alias = "downlinkedTo",
        skip_serializing_if = "Option::is_none"
    )]
    pub to: Option<String>,
}

impl Payload for TargetEvent {
    const NAME: &'static str = "target event";
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;

    #[test]
    fn satellite_status_full_document() {
        let body = br#"{
            "id": 0,
            "name": "CAPELLA-14 (ACADIA-4)",
            "latitude": 12.5,
            "longitude": -45.0,
            "altitude": 560000.0,
            "radius": 30000.0,
            "velocity": [1.0, 2.0, 3.0],
            "state": true,
            "swath": 5000,
            "time": "2024-01-01T00:00:00Z",
            "ecef": [1.0, 2.0, 3.0]
        }"#;
        let sat: SatelliteStatus = decode(body).unwrap();
        assert_eq!(sat.id, "0");
        assert_eq!(sat.name.as_deref(), Some("CAPELLA-14 (ACADIA-4)"));
        assert_eq!(sat.radius, Some(30000.0));
        assert_eq!(sat.swath, Some(5000.0));
        assert_eq!(sat.state, Some(true));
        assert!(sat.time.is_some());
    }

    #[test]
    fn whole_float_identifiers_match_integer_ones() {
        let a: TargetEvent = decode(br#"{"fireId": 1, "detectedBy": "A"}"#).unwrap();
        let b: TargetEvent = decode(br#"{"fireId": 1.0, "detectedBy": "A"}"#).unwrap();
        let c: TargetEvent = decode(br#"{"fireId": -3.0}"#).unwrap();
        let d: TargetEvent = decode(br#"{"fireId": 1.5}"#).unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "1");
        assert_eq!(c.id, "-3");
        assert_eq!(d.id, "1.5");
    }

    #[test]
    fn satellite_status_short_keys() {
        let body = br#"{"id": "A", "lat": 10, "lon": 20, "alt": 500000, "radius": 100000}"#;
        let sat: SatelliteStatus = decode(body).unwrap();
        assert_eq!(sat.id, "A");
        assert_eq!(sat.latitude, 10.0);
        assert_eq!(sat.longitude, 20.0);
        assert_eq!(sat.altitude, 500000.0);
        assert_eq!(sat.comm_range, None);
    }

    #[test]
    fn satellite_latitude_out_of_range() {
        let body = br#"{"id": "A", "lat": 91, "lon": 20, "alt": 1}"#;
        let err = decode::<SatelliteStatus>(body).unwrap_err();
        assert!(matches!(err, WireError::InvalidValue { field: "latitude", .. }));
    }

    #[test]
    fn empty_identifier_is_malformed() {
        let body = br#"{"id": "", "lat": 1, "lon": 2, "alt": 3}"#;
        assert!(matches!(
            decode::<SatelliteStatus>(body).unwrap_err(),
            WireError::Malformed { .. }
        ));
        let body = br#"{"id": null, "lat": 1, "lon": 2, "alt": 3}"#;
        assert!(decode::<SatelliteStatus>(body).is_err());
    }

    #[test]
    fn ground_location_camel_case() {
        let body = br#"{"groundId": 3, "latitude": 78.2, "longitude": 15.4,
                        "elevAngle": 5.0, "operational": true, "downlinkRate": 1e9}"#;
        let ground: GroundLocation = decode(body).unwrap();
        assert_eq!(ground.ground_id, "3");
        assert_eq!(ground.elev_angle, Some(5.0));
        assert_eq!(ground.operational, Some(true));
        assert_eq!(ground.cost_per_second, None);
    }

    #[test]
    fn target_aliases() {
        let loc: TargetLocation =
            decode(br#"{"fireId": 17, "latitude": 1.0, "longitude": 2.0, "start": "2020-01-01T07:21:00"}"#)
                .unwrap();
        assert_eq!(loc.id, "17");
        assert!(loc.started.is_some());

        let detected: TargetEvent =
            decode(br#"{"fireId": 17, "detected": "2020-01-01 07:30:00.000001", "detectedBy": "SAT-1"}"#)
                .unwrap();
        assert_eq!(detected.id, "17");
        assert_eq!(detected.by.as_deref(), Some("SAT-1"));
        assert!(detected.at.is_some());

        let reported: TargetEvent = decode(
            br#"{"floodId": "f-2", "downlinked": "2020-01-01T08:00:00Z", "downlinkedBy": "SAT-1", "downlinkedTo": "SVALBARD"}"#,
        )
        .unwrap();
        assert_eq!(reported.id, "f-2");
        assert_eq!(reported.to.as_deref(), Some("SVALBARD"));
    }

    #[test]
    fn serialized_status_decodes_back() {
        let sat = SatelliteStatus {
            id: "7".to_owned(),
            name: None,
            latitude: 1.0,
            longitude: 2.0,
            altitude: 3.0,
            radius: Some(4.0),
            velocity: None,
            ecef: None,
            state: None,
            comm_range: Some(false),
            swath: None,
            time: None,
            category: Some("science".to_owned()),
        };
        let bytes = serde_json::to_vec(&sat).unwrap();
        let decoded: SatelliteStatus = decode(&bytes).unwrap();
        assert_eq!(decoded, sat);
    }
}
