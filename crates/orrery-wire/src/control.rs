//! Coordinator control messages.
//!
//! The coordinator (the "manager" app) drives every run with five messages.
//! Only the fields the observer acts on are decoded; everything else in the
//! coordinator's documents (required apps, wallclock start times) is ignored.
//!
//! | Kind          | Topic suffix                          | Fields used                               |
//! |---------------|---------------------------------------|-------------------------------------------|
//! | `Init`        | `manager.init`                        | `taskingParameters.simStartTime/StopTime` |
//! | `Start`       | `manager.start`                       | `taskingParameters.timeScalingFactor`     |
//! | `TimeUpdate`  | `manager.time`, `manager.status.time` | `properties.simTime`                      |
//! | `RateUpdate`  | `manager.update`                      | `taskingParameters.timeScalingFactor`     |
//! | `Stop`        | `manager.stop`                        | none                                      |

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instant::de_instant;
use crate::{decode, require_finite, Payload, WireError};

// ---------------------------------------------------------------------------
// ControlKind
// ---------------------------------------------------------------------------

/// Discriminant of a [`ControlMessage`], known from the topic before the
/// payload is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    Init,
    Start,
    TimeUpdate,
    RateUpdate,
    Stop,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlKind::Init => "init",
            ControlKind::Start => "start",
            ControlKind::TimeUpdate => "time",
            ControlKind::RateUpdate => "update",
            ControlKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// ControlMessage
// ---------------------------------------------------------------------------

/// A decoded coordinator control message. Transient: consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Sets the scenario epoch.
    Init {
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    },
    /// Begins (or resumes) execution at the given rate multiplier.
    Start { multiplier: f64 },
    /// Authoritative simulated instant from the coordinator.
    TimeUpdate { instant: DateTime<Utc> },
    /// Changes the rate multiplier mid-run.
    RateUpdate { multiplier: f64 },
    /// Freezes the run.
    Stop,
}

impl ControlMessage {
    /// The discriminant of this message.
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Init { .. } => ControlKind::Init,
            ControlMessage::Start { .. } => ControlKind::Start,
            ControlMessage::TimeUpdate { .. } => ControlKind::TimeUpdate,
            ControlMessage::RateUpdate { .. } => ControlKind::RateUpdate,
            ControlMessage::Stop => ControlKind::Stop,
        }
    }

    /// Decode the payload of a control topic of the given kind.
    ///
    /// `Stop` carries no required fields, so its body is not inspected.
    pub fn decode(kind: ControlKind, body: &[u8]) -> Result<Self, WireError> {
        match kind {
            ControlKind::Init => {
                let cmd: InitCommand = decode(body)?;
                Ok(ControlMessage::Init {
                    start: cmd.tasking_parameters.sim_start_time,
                    stop: cmd.tasking_parameters.sim_stop_time,
                })
            }
            ControlKind::Start => {
                let cmd: RateCommand = decode(body)?;
                Ok(ControlMessage::Start {
                    multiplier: cmd.tasking_parameters.time_scaling_factor,
                })
            }
            ControlKind::RateUpdate => {
                let cmd: RateCommand = decode(body)?;
                Ok(ControlMessage::RateUpdate {
                    multiplier: cmd.tasking_parameters.time_scaling_factor,
                })
            }
            ControlKind::TimeUpdate => {
                let status: TimeStatus = decode(body)?;
                Ok(ControlMessage::TimeUpdate {
                    instant: status.properties.sim_time,
                })
            }
            ControlKind::Stop => Ok(ControlMessage::Stop),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload documents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitCommand {
    tasking_parameters: InitTasking,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitTasking {
    #[serde(deserialize_with = "de_instant")]
    sim_start_time: DateTime<Utc>,
    #[serde(deserialize_with = "de_instant")]
    sim_stop_time: DateTime<Utc>,
}

impl Payload for InitCommand {
    const NAME: &'static str = "init command";

    fn validate(&self) -> Result<(), WireError> {
        let t = &self.tasking_parameters;
        if t.sim_start_time > t.sim_stop_time {
            return Err(WireError::InvalidValue {
                field: "simStopTime",
                value: t.sim_stop_time.to_rfc3339(),
                reason: "precedes simStartTime",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateCommand {
    tasking_parameters: RateTasking,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateTasking {
    time_scaling_factor: f64,
}

impl Payload for RateCommand {
    const NAME: &'static str = "rate command";

    fn validate(&self) -> Result<(), WireError> {
        let factor = self.tasking_parameters.time_scaling_factor;
        require_finite("timeScalingFactor", factor)?;
        if factor < 0.0 {
            return Err(WireError::InvalidValue {
                field: "timeScalingFactor",
                value: factor.to_string(),
                reason: "must not be negative",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TimeStatus {
    properties: TimeProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeProperties {
    #[serde(deserialize_with = "de_instant")]
    sim_time: DateTime<Utc>,
}

impl Payload for TimeStatus {
    const NAME: &'static str = "time status";
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
