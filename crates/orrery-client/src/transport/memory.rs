//! In-process message bus.
//!
//! [`MemoryBus`] behaves like a topic exchange with one durable queue: it
//! holds messages published while no subscriber is bound, delivers them with
//! explicit acknowledgment, and redelivers unacknowledged messages (flagged
//! `redelivered`) after a requeue or a lost connection.
//!
//! It also records every connection-level event ([`BusLog`]) and lets tests
//! inject failures ([`MemoryBus::sever`], [`MemoryBus::refuse_connects`]), so
//! it doubles as the observer's test harness.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use orrery_wire::topic::TopicPattern;
use tokio::sync::mpsc;

use super::{BusConnection, BusTransport, Delivery, SessionId};
use crate::config::BusEndpoint;
use crate::credential::Credential;
use crate::error::ConnectError;

// ---------------------------------------------------------------------------
// Recorded activity
// ---------------------------------------------------------------------------

/// Everything the bus observed, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusLog {
    /// Sessions opened, with the secret each presented.
    pub connects: Vec<(SessionId, String)>,
    /// Subscriptions bound.
    pub subscriptions: Vec<(SessionId, String)>,
    /// Acknowledged deliveries: session and topic.
    pub acks: Vec<(SessionId, String)>,
    /// Rejected deliveries: session, topic and requeue flag.
    pub rejects: Vec<(SessionId, String, bool)>,
    /// Secrets swapped in place.
    pub secret_updates: Vec<(SessionId, String)>,
    /// Sessions closed by the client.
    pub closes: Vec<SessionId>,
}

#[derive(Debug, Clone)]
struct Message {
    topic: String,
    body: Vec<u8>,
    redelivered: bool,
}

enum LinkEvent {
    Deliver(Delivery),
    Lost(String),
}

struct Link {
    session: SessionId,
    pattern: Option<TopicPattern>,
    tx: mpsc::UnboundedSender<LinkEvent>,
    unacked: BTreeMap<u64, Message>,
}

#[derive(Default)]
struct BusState {
    backlog: VecDeque<Message>,
    link: Option<Link>,
    next_tag: u64,
    refuse_connects: u32,
    refuse_subscriptions: u32,
    log: BusLog,
}

impl BusState {
    fn current_session(&self) -> Option<SessionId> {
        self.link.as_ref().map(|l| l.session)
    }

    fn check_session(&self, session: SessionId) -> Result<(), ConnectError> {
        match self.current_session() {
            Some(current) if current == session => Ok(()),
            current => Err(ConnectError::StaleSession {
                stale: session,
                current,
            }),
        }
    }

    /// Route a message to the bound subscription or park it.
    fn offer(&mut self, message: Message) {
        let Some(link) = self.link.as_mut() else {
            self.backlog.push_back(message);
            return;
        };
        let Some(pattern) = &link.pattern else {
            self.backlog.push_back(message);
            return;
        };
        if !pattern.matches(&message.topic) {
            return;
        }
        self.next_tag += 1;
        let delivery = Delivery {
            session: link.session,
            tag: self.next_tag,
            topic: message.topic.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        link.unacked.insert(self.next_tag, message);
        let _ = link.tx.send(LinkEvent::Deliver(delivery));
    }

    /// Tear down the current link; unacked messages go back to the queue.
    fn drop_link(&mut self, reason: Option<String>) {
        if let Some(link) = self.link.take() {
            if let Some(reason) = reason {
                let _ = link.tx.send(LinkEvent::Lost(reason));
            }
            let mut requeued: VecDeque<Message> = link
                .unacked
                .into_values()
                .map(|m| Message {
                    redelivered: true,
                    ..m
                })
                .collect();
            requeued.append(&mut self.backlog);
            self.backlog = requeued;
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a message on a full topic.
    pub fn publish(&self, topic: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.lock().offer(Message {
            topic: topic.into(),
            body: body.into(),
            redelivered: false,
        });
    }

    /// Publish a JSON document.
    pub fn publish_json(&self, topic: impl Into<String>, body: &serde_json::Value) {
        self.publish(topic, body.to_string());
    }

    /// Simulate a network failure on the current connection.
    pub fn sever(&self) {
        self.lock().drop_link(Some("connection reset by peer".to_owned()));
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.lock().refuse_connects = count;
    }

    /// Refuse the next `count` subscription attempts.
    pub fn refuse_subscriptions(&self, count: u32) {
        self.lock().refuse_subscriptions = count;
    }

    /// Snapshot of recorded activity.
    pub fn log(&self) -> BusLog {
        self.lock().log.clone()
    }

    /// Session currently holding the connection.
    pub fn current_session(&self) -> Option<SessionId> {
        self.lock().current_session()
    }

    /// Deliveries handed out but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.lock().link.as_ref().map_or(0, |l| l.unacked.len())
    }

    /// Messages parked waiting for a subscriber.
    pub fn queued(&self) -> usize {
        self.lock().backlog.len()
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    async fn open(
        &self,
        endpoint: &BusEndpoint,
        credential: &Credential,
        session: SessionId,
    ) -> Result<Box<dyn BusConnection>, ConnectError> {
        let mut state = self.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(ConnectError::Unreachable {
                endpoint: endpoint.to_string(),
                details: "connection refused".to_owned(),
            });
        }
        // A broker serves one consumer here; a new session replaces the old.
        state.drop_link(None);
        let (tx, rx) = mpsc::unbounded_channel();
        state.link = Some(Link {
            session,
            pattern: None,
            tx,
            unacked: BTreeMap::new(),
        });
        state
            .log
            .connects
            .push((session, credential.access_token().to_owned()));
        Ok(Box::new(MemoryConnection {
            session,
            bus: self.clone(),
            rx,
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

struct MemoryConnection {
    session: SessionId,
    bus: MemoryBus,
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
impl BusConnection for MemoryConnection {
    fn session(&self) -> SessionId {
        self.session
    }

    async fn subscribe(&mut self, pattern: &TopicPattern) -> Result<(), ConnectError> {
        let mut state = self.bus.lock();
        state.check_session(self.session)?;
        if state.refuse_subscriptions > 0 {
            state.refuse_subscriptions -= 1;
            return Err(ConnectError::Subscribe {
                pattern: pattern.to_string(),
                details: "access refused".to_owned(),
            });
        }
        if let Some(link) = state.link.as_mut() {
            link.pattern = Some(pattern.clone());
        }
        state
            .log
            .subscriptions
            .push((self.session, pattern.to_string()));
        let parked: Vec<Message> = state.backlog.drain(..).collect();
        for message in parked {
            state.offer(message);
        }
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Delivery, ConnectError> {
        match self.rx.recv().await {
            Some(LinkEvent::Deliver(delivery)) => Ok(delivery),
            Some(LinkEvent::Lost(reason)) => Err(ConnectError::Closed { reason }),
            None => Err(ConnectError::Closed {
                reason: "connection replaced".to_owned(),
            }),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), ConnectError> {
        let mut state = self.bus.lock();
        state.check_session(delivery.session)?;
        if let Some(link) = state.link.as_mut() {
            link.unacked.remove(&delivery.tag);
        }
        state
            .log
            .acks
            .push((delivery.session, delivery.topic.clone()));
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), ConnectError> {
        let mut state = self.bus.lock();
        state.check_session(delivery.session)?;
        let message = state
            .link
            .as_mut()
            .and_then(|link| link.unacked.remove(&delivery.tag));
        state
            .log
            .rejects
            .push((delivery.session, delivery.topic.clone(), requeue));
        if let (true, Some(message)) = (requeue, message) {
            state.offer(Message {
                redelivered: true,
                ..message
            });
        }
        Ok(())
    }

    async fn update_secret(&mut self, credential: &Credential) -> Result<(), ConnectError> {
        let mut state = self.bus.lock();
        state.check_session(self.session)?;
        state
            .log
            .secret_updates
            .push((self.session, credential.access_token().to_owned()));
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.bus.lock();
        if state.current_session() == Some(self.session) {
            state.drop_link(None);
        }
        state.log.closes.push(self.session);
    }
}
