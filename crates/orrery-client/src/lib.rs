//! Orrery Client -- observer for a time-scaled simulation testbed.
//!
//! A testbed run is coordinated over a message bus: a manager app publishes
//! control messages (init, start, time, rate update, stop) and simulated
//! participants publish their state under a shared topic namespace. This
//! crate joins such a run as a passive observer and keeps a local mirror of
//! it: the session phase, the scaled simulation clock, and the latest state
//! of every satellite, ground station and observation target.
//!
//! The pieces, bottom-up:
//!
//! - [`transport`]: bus abstraction, the AMQP [`AmqpTransport`](transport::AmqpTransport) and the
//!   in-process [`MemoryBus`](transport::MemoryBus);
//! - [`credential`]: OpenID Connect token acquisition and refresh;
//! - [`connection`]: sessions, background credential refresh, reconnect backoff;
//! - [`router`] and [`handlers`]: topic to handler dispatch and ack decisions;
//! - [`session`] and [`clock`]: the lifecycle phase and the simulated clock;
//! - [`engine`]: all of the above minus the transport, fed with deliveries;
//! - [`observer`]: the dispatch loop tying a session to an engine.
//!
//! # Quick Start
//!
//! ```
//! use orrery_client::prelude::*;
//! use orrery_wire::topic::Namespace;
//! use tokio::time::Instant;
//!
//! let config = ObserverConfig::new(Namespace::new("sos").unwrap());
//! let mut engine = SyncEngine::new(&config);
//! engine.begin_connect();
//! engine.subscribed();
//!
//! let now = Instant::now();
//! engine.dispatch(
//!     "sos.manager.init",
//!     br#"{"taskingParameters": {"simStartTime": "2024-01-01T00:00:00Z",
//!                                "simStopTime": "2024-01-01T06:00:00Z"}}"#,
//!     false,
//!     now,
//! );
//! engine.dispatch("sos.manager.start", br#"{"taskingParameters": {"timeScalingFactor": 60}}"#, false, now);
//! engine.dispatch(
//!     "sos.constellation.location",
//!     br#"{"id": "A", "latitude": 10, "longitude": 20, "altitude": 500000}"#,
//!     false,
//!     now,
//! );
//!
//! assert_eq!(engine.phase(), Phase::Running);
//! assert_eq!(engine.clock().multiplier(), 60.0);
//! assert_eq!(engine.store().len(), 1);
//! ```

#![deny(unsafe_code)]

pub mod backoff;
pub mod clock;
pub mod config;
pub mod connection;
pub mod credential;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod observer;
pub mod replay;
pub mod router;
pub mod session;
pub mod snapshot;
pub mod telemetry;
pub mod transport;

/// Re-export the wire crate for convenience.
pub use orrery_wire;

/// Re-export the state crate for convenience.
pub use orrery_state;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common observer usage.
pub mod prelude {
    pub use orrery_state::prelude::*;

    pub use crate::backoff::{Backoff, BackoffPolicy};
    pub use crate::clock::{ClockController, ClockError, ClockState};
    pub use crate::config::{
        BusEndpoint, LoggingConfig, ObserverConfig, PreRunPolicy, RefreshPolicy,
        TokenEndpointConfig,
    };
    pub use crate::connection::{ConnectionManager, Session};
    pub use crate::credential::{Credential, CredentialSource, StaticIssuer, TokenEndpoint};
    pub use crate::engine::{EngineState, PendingUpdate, SyncEngine};
    pub use crate::error::{
        AuthError, ConnectError, HandleError, ObserverError, ProtocolStateError, SessionError,
    };
    pub use crate::observer::{Observer, ObserverEvent, ObserverHandle};
    pub use crate::replay::{
        replay, DeliveryLog, RecordedDelivery, ReplayDivergence, ReplayEntry, ReplayResult,
    };
    pub use crate::router::{DispatchOutcome, Envelope, Handled, HandlerFn, Subscription, TopicMatch, TopicRouter};
    pub use crate::session::{Phase, SessionStateMachine};
    pub use crate::snapshot::ObserverSnapshot;
    pub use crate::telemetry::init_tracing;
    pub use crate::transport::{AmqpTransport, BusConnection, BusTransport, Delivery, MemoryBus, SessionId};
}
