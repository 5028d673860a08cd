//! The observer: one dispatch loop per testbed run.
//!
//! [`Observer::run`] owns the bus session and serializes everything that
//! mutates state (deliveries, credential swaps, reconnects) through a
//! single `tokio::select!` loop. Readers get an [`ObserverHandle`] with a
//! shared read view of the [`SyncEngine`]; each delivery is applied under
//! one write lock, so a reader never sees half an update.
//!
//! ```no_run
//! use std::sync::Arc;
//! use orrery_client::config::ObserverConfig;
//! use orrery_client::credential::TokenEndpoint;
//! use orrery_client::observer::Observer;
//! use orrery_client::transport::MemoryBus;
//! use orrery_wire::topic::Namespace;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = ObserverConfig::new(Namespace::new("sos")?);
//! let tokens = TokenEndpoint::new(config.token.clone())?;
//! let (observer, handle) = Observer::new(config, Arc::new(MemoryBus::new()), Arc::new(tokens));
//! let run = tokio::spawn(observer.run());
//!
//! let mut events = handle.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! handle.shutdown();
//! run.await??;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;

use crate::config::ObserverConfig;
use crate::connection::{ConnectionManager, Session};
use crate::credential::{Credential, CredentialSource};
use crate::engine::SyncEngine;
use crate::error::{ConnectError, ObserverError, SessionError};
use crate::router::DispatchOutcome;
use crate::session::Phase;
use crate::transport::{BusTransport, Delivery, SessionId};

// ---------------------------------------------------------------------------
// Events and handle
// ---------------------------------------------------------------------------

/// Notifications broadcast to observer subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    PhaseChanged { from: Phase, to: Phase },
    Disconnected { session: SessionId, reason: String },
    /// A replacement session is subscribed.
    Reconnected { session: SessionId },
    CredentialRefreshed { session: SessionId },
}

/// Shared access to a running observer.
#[derive(Clone)]
pub struct ObserverHandle {
    view: Arc<RwLock<SyncEngine>>,
    events: broadcast::Sender<ObserverEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ObserverHandle {
    /// The engine the observer mutates. Hold read guards briefly: the
    /// dispatch loop needs the write lock for every delivery.
    pub fn view(&self) -> &Arc<RwLock<SyncEngine>> {
        &self.view
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.events.subscribe()
    }

    /// Ask the run loop to close the session and return. Dropping every
    /// handle has the same effect.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Resolves once shutdown is requested or every handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

enum Wake {
    Shutdown,
    Refreshed(Credential),
    Delivery(Delivery),
    Lost(ConnectError),
}

/// A testbed observer bound to one namespace.
pub struct Observer {
    manager: ConnectionManager,
    view: Arc<RwLock<SyncEngine>>,
    events: broadcast::Sender<ObserverEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Observer {
    pub fn new(
        config: ObserverConfig,
        transport: Arc<dyn BusTransport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> (Self, ObserverHandle) {
        let engine = SyncEngine::new(&config);
        Self::with_engine(config, engine, transport, credentials)
    }

    /// Observer around a prepared engine, e.g. one restored from a snapshot
    /// or carrying a custom route table.
    pub fn with_engine(
        config: ObserverConfig,
        engine: SyncEngine,
        transport: Arc<dyn BusTransport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> (Self, ObserverHandle) {
        let view = Arc::new(RwLock::new(engine));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let manager = ConnectionManager::new(
            transport,
            credentials,
            config.bus,
            config.refresh,
            config.backoff,
        );
        let handle = ObserverHandle {
            view: Arc::clone(&view),
            events: events.clone(),
            shutdown: Arc::new(shutdown_tx),
        };
        (
            Self {
                manager,
                view,
                events,
                shutdown,
            },
            handle,
        )
    }

    /// Register a callback run on every session loss.
    pub fn on_disconnect(
        &mut self,
        callback: impl Fn(SessionId, &ConnectError) + Send + Sync + 'static,
    ) {
        self.manager.on_disconnect(callback);
    }

    fn emit(&self, event: ObserverEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run `f` on the engine and broadcast a phase change if it caused one.
    async fn update<R>(&self, f: impl FnOnce(&mut SyncEngine) -> R) -> R {
        let (result, from, to) = {
            let mut engine = self.view.write().await;
            let from = engine.phase();
            let result = f(&mut engine);
            (result, from, engine.phase())
        };
        if from != to {
            self.emit(ObserverEvent::PhaseChanged { from, to });
        }
        result
    }

    /// Connect, subscribe and dispatch until shutdown or a fatal error.
    ///
    /// # Errors
    ///
    /// [`ObserverError::Auth`] if the first credential cannot be obtained,
    /// [`ObserverError::ReconnectExhausted`] once the backoff gives up. The
    /// engine is left `Faulted` in both cases.
    pub async fn run(mut self) -> Result<(), ObserverError> {
        let mut shutdown = self.shutdown.clone();
        let mut session = tokio::select! {
            result = self.establish() => result?,
            () = shutdown_requested(&mut shutdown) => {
                tracing::info!("observer shut down before a session was established");
                return Ok(());
            }
        };
        loop {
            let wake = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => Wake::Shutdown,
                Some(fresh) = session.refreshed.recv() => Wake::Refreshed(fresh),
                next = session.connection.next_delivery() => match next {
                    Ok(delivery) => Wake::Delivery(delivery),
                    Err(e) => Wake::Lost(e),
                },
            };

            let lost = match wake {
                Wake::Shutdown => {
                    tracing::info!(session = %session.id(), "observer shutting down");
                    session.close().await;
                    return Ok(());
                }
                Wake::Refreshed(fresh) => {
                    match self.manager.apply_refreshed(&mut session, fresh).await {
                        Ok(()) => {
                            self.emit(ObserverEvent::CredentialRefreshed {
                                session: session.id(),
                            });
                            None
                        }
                        Err(e) => Some(e),
                    }
                }
                Wake::Delivery(delivery) => self.deliver(&mut session, delivery).await.err(),
                Wake::Lost(e) => Some(e),
            };

            if let Some(error) = lost {
                session = tokio::select! {
                    result = self.recover(session, error) => result?,
                    () = shutdown_requested(&mut shutdown) => {
                        tracing::info!("observer shut down while reconnecting");
                        return Ok(());
                    }
                };
            }
        }
    }

    /// Apply one delivery and acknowledge it according to the outcome.
    async fn deliver(&self, session: &mut Session, delivery: Delivery) -> Result<(), ConnectError> {
        let outcome = self
            .update(|engine| {
                engine.dispatch(&delivery.topic, &delivery.body, delivery.redelivered, Instant::now())
            })
            .await;
        if outcome.acknowledges() {
            session.connection.ack(&delivery).await
        } else {
            let requeue = matches!(outcome, DispatchOutcome::Reject { requeue: true });
            session.connection.reject(&delivery, requeue).await
        }
    }

    /// First session. An authentication failure is fatal; a transport
    /// failure falls through to the reconnect loop.
    async fn establish(&mut self) -> Result<Session, ObserverError> {
        self.update(|engine| {
            if engine.phase() == Phase::Faulted {
                engine.reset();
            }
            engine.begin_connect();
        })
        .await;

        match self.manager.connect().await {
            Ok(mut session) => match self.bind(&mut session).await {
                Ok(()) => {
                    self.manager.mark_established();
                    Ok(session)
                }
                Err(e) => self.recover(session, e).await,
            },
            Err(SessionError::Auth(e)) => {
                tracing::error!(error = %e, "initial authentication failed");
                self.update(SyncEngine::fault).await;
                Err(ObserverError::Auth(e))
            }
            Err(e @ SessionError::Connect(_)) => {
                tracing::warn!(error = %e, "initial connect failed");
                self.manager.note_failure(&e);
                self.update(SyncEngine::transport_lost).await;
                self.reestablish().await
            }
        }
    }

    /// Tear down a lost session and bring up its replacement.
    async fn recover(&mut self, lost: Session, error: ConnectError) -> Result<Session, ObserverError> {
        let id = lost.id();
        drop(lost);
        self.manager.handle_disconnect(id, &error);
        self.update(SyncEngine::transport_lost).await;
        self.emit(ObserverEvent::Disconnected {
            session: id,
            reason: error.to_string(),
        });

        let session = self.reestablish().await?;
        self.emit(ObserverEvent::Reconnected {
            session: session.id(),
        });
        Ok(session)
    }

    async fn reestablish(&mut self) -> Result<Session, ObserverError> {
        loop {
            self.update(SyncEngine::begin_connect).await;
            let mut session = match self.manager.reconnect().await {
                Ok(session) => session,
                Err(e) => {
                    self.update(SyncEngine::fault).await;
                    return Err(e);
                }
            };
            match self.bind(&mut session).await {
                Ok(()) => {
                    self.manager.mark_established();
                    return Ok(session);
                }
                Err(e) => {
                    self.manager.handle_disconnect(session.id(), &e);
                    self.update(SyncEngine::transport_lost).await;
                }
            }
        }
    }

    /// Subscribe the session and settle the phase. The engine lock is not
    /// held while the broker answers.
    async fn bind(&self, session: &mut Session) -> Result<(), ConnectError> {
        let pattern = self.view.read().await.router().pattern();
        session.subscribe(pattern).await?;
        let phase = self.update(SyncEngine::subscribed).await;
        tracing::info!(session = %session.id(), phase = ?phase, "observer ready");
        Ok(())
    }
}
