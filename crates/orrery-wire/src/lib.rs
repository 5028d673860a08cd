//! Orrery Wire -- topic grammar and payload types of the simulation bus.
//!
//! Every participant of a testbed run publishes JSON documents on
//! dot-segmented topics below a shared namespace prefix
//! (`<prefix>.<app>.<topic>`). This crate holds the pieces of that contract an
//! observer needs:
//!
//! - [`topic`]: the [`Namespace`](topic::Namespace) prefix and multi-level
//!   wildcard [`TopicPattern`](topic::TopicPattern) matching.
//! - [`control`]: coordinator control messages (`init`, `start`, `time`,
//!   `update`, `stop`) decoded into a [`ControlMessage`](control::ControlMessage).
//! - [`entity`]: snapshots published by satellites, ground stations and
//!   observation targets.
//!
//! # Example
//!
//! ```
//! use orrery_wire::control::{ControlKind, ControlMessage};
//! use orrery_wire::topic::Namespace;
//!
//! let ns = Namespace::new("greenfield").unwrap();
//! assert!(ns.wildcard().matches("greenfield.manager.init"));
//!
//! let body = br#"{"taskingParameters": {"timeScalingFactor": 60.0}}"#;
//! let msg = ControlMessage::decode(ControlKind::Start, body).unwrap();
//! assert_eq!(msg, ControlMessage::Start { multiplier: 60.0 });
//! ```

#![deny(unsafe_code)]

pub mod control;
pub mod entity;
pub mod topic;

mod instant;

pub use instant::parse_instant;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while interpreting topics and payloads.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The namespace prefix cannot be used to build topics.
    #[error("invalid namespace prefix '{prefix}': {reason}")]
    InvalidNamespace {
        prefix: String,
        reason: &'static str,
    },

    /// The payload is not a document of the expected shape.
    #[error("malformed {expected} payload: {details}")]
    Malformed {
        /// Name of the payload type that was expected.
        expected: &'static str,
        details: String,
    },

    /// The payload parsed but one of its values is out of range.
    #[error("invalid {field} value {value}: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

/// A JSON document published on a known topic.
///
/// Implementors name themselves for error messages and may reject values that
/// parse but make no sense (non-finite coordinates, negative rates).
pub trait Payload: serde::de::DeserializeOwned {
    /// Human-readable payload name used in [`WireError::Malformed`].
    const NAME: &'static str;

    /// Semantic validation run after a successful parse.
    fn validate(&self) -> Result<(), WireError> {
        Ok(())
    }
}

/// Decode and validate a payload body.
pub fn decode<P: Payload>(body: &[u8]) -> Result<P, WireError> {
    let payload: P = serde_json::from_slice(body).map_err(|e| WireError::Malformed {
        expected: P::NAME,
        details: e.to_string(),
    })?;
    payload.validate()?;
    Ok(payload)
}

/// Reject NaN and infinities for a named numeric field.
pub(crate) fn require_finite(field: &'static str, value: f64) -> Result<(), WireError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(WireError::InvalidValue {
            field,
            value: value.to_string(),
            reason: "must be finite",
        })
    }
}
