//! Message bus abstraction.
//!
//! The observer needs a small slice of a broker client: open an
//! authenticated connection, bind one wildcard subscription with explicit
//! acknowledgment, pull deliveries, ack or reject them, and swap the
//! connection secret in place when the credential is refreshed.
//!
//! [`BusTransport`] opens connections; [`BusConnection`] is one live
//! connection. [`AmqpTransport`] talks to a real broker, [`MemoryBus`] runs
//! in process for tests and replays. Every connection belongs to exactly one [`SessionId`]; an
//! operation carrying another session's delivery fails with
//! [`ConnectError::StaleSession`].

pub mod amqp;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use orrery_wire::topic::TopicPattern;
use serde::{Deserialize, Serialize};

use crate::config::BusEndpoint;
use crate::credential::Credential;
use crate::error::ConnectError;

pub use amqp::AmqpTransport;
pub use memory::MemoryBus;

/// Monotonically increasing identifier of a bus session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// One message handed to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Session the delivery arrived on; acks must go back to the same one.
    pub session: SessionId,
    /// Broker delivery tag, unique within the session.
    pub tag: u64,
    /// Full topic, namespace prefix included.
    pub topic: String,
    pub body: Vec<u8>,
    /// The broker has delivered this message before.
    pub redelivered: bool,
}

/// Opens authenticated connections to the bus.
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn open(
        &self,
        endpoint: &BusEndpoint,
        credential: &Credential,
        session: SessionId,
    ) -> Result<Box<dyn BusConnection>, ConnectError>;
}

/// A live connection with at most one subscription.
#[async_trait]
pub trait BusConnection: Send {
    fn session(&self) -> SessionId;

    /// Bind the subscription. Deliveries require an explicit ack.
    async fn subscribe(&mut self, pattern: &TopicPattern) -> Result<(), ConnectError>;

    /// Wait for the next delivery. An error means the connection is gone.
    ///
    /// Must be cancel-safe: it is raced against the refresh channel and
    /// shutdown.
    async fn next_delivery(&mut self) -> Result<Delivery, ConnectError>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), ConnectError>;

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), ConnectError>;

    /// Replace the connection secret without closing the connection or
    /// dropping the subscription.
    async fn update_secret(&mut self, credential: &Credential) -> Result<(), ConnectError>;

    async fn close(&mut self);
}
