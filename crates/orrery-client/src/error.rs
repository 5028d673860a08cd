//! Error types of the observer client.
//!
//! Errors are split by who has to react to them:
//!
//! - [`ConnectError`] and [`AuthError`] concern the bus session and are
//!   handled by the connection layer (retry or give up).
//! - [`HandleError`] concerns one delivery and decides how it is
//!   acknowledged; it never stops the dispatch loop.
//! - [`ObserverError`] is what ends [`Observer::run`](crate::observer::Observer::run).

use orrery_state::identity::EntityKey;
use orrery_wire::control::ControlKind;
use orrery_wire::WireError;

use crate::session::Phase;
use crate::transport::SessionId;

/// Transport-level failures. Retried with backoff.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// The bus could not be reached.
    #[error("bus unreachable at {endpoint}: {details}")]
    Unreachable {
        endpoint: String,
        details: String,
    },

    /// The connection was closed by the broker or the network.
    #[error("connection closed: {reason}")]
    Closed {
        reason: String,
    },

    /// An operation carried a session that has since been replaced.
    #[error("operation on stale session {stale}; current session is {current:?}")]
    StaleSession {
        stale: SessionId,
        current: Option<SessionId>,
    },

    /// The broker refused the subscription.
    #[error("subscription to '{pattern}' failed: {details}")]
    Subscribe {
        pattern: String,
        details: String,
    },
}

/// Credential exchange failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// The token endpoint answered with an error status.
    #[error("token endpoint rejected the {grant} grant with status {status}: {details}")]
    Rejected {
        grant: &'static str,
        status: u16,
        details: String,
    },

    /// The token endpoint could not be reached.
    #[error("token endpoint unreachable: {details}")]
    Unreachable {
        details: String,
    },

    /// The token endpoint answered with a document we cannot use.
    #[error("invalid token response: {details}")]
    InvalidResponse {
        details: String,
    },

    /// No usable grant is configured.
    #[error("no credentials configured for the token endpoint")]
    MissingCredentials,
}

/// Failure to establish a session: either half of the handshake.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// A control message arrived in a phase that does not expect it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} control message is not accepted in phase {phase:?}")]
pub struct ProtocolStateError {
    pub kind: ControlKind,
    pub phase: Phase,
}

/// Per-delivery handler failures. Each variant maps to an acknowledgment
/// decision in [`SyncEngine::dispatch`](crate::engine::SyncEngine::dispatch).
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    /// The payload does not match its topic's shape. Acknowledged and skipped.
    #[error(transparent)]
    Malformed(#[from] WireError),

    /// A status event named an entity that was never sighted. The first
    /// delivery is requeued; a redelivered copy is dropped.
    #[error("status event for unknown entity {key}")]
    UnknownIdentity {
        key: EntityKey,
    },

    /// A control message arrived out of order. Acknowledged and ignored.
    #[error(transparent)]
    ProtocolState(#[from] ProtocolStateError),
}

/// Errors that end the observer run loop.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// The initial credential could not be obtained.
    #[error("initial authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Consecutive reconnect attempts ran out.
    #[error("giving up after {attempts} reconnect attempts; last error: {last}")]
    ReconnectExhausted {
        attempts: u32,
        last: String,
    },
}
