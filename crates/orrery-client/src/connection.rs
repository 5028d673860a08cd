//! Authenticated bus sessions.
//!
//! The [`ConnectionManager`] turns a credential source and a transport into
//! [`Session`]s. Each session owns its connection and a background refresh
//! task; the task performs the token round trip off the dispatch path and
//! hands fresh credentials over a channel, and the dispatch loop swaps them
//! into the live connection with
//! [`apply_refreshed`](ConnectionManager::apply_refreshed). Dropping a
//! session cancels its refresh task.
//!
//! Reconnects wait out a capped exponential backoff. The backoff is reset
//! only once a new session is fully established (subscribed), so a broker
//! that accepts connections but refuses subscriptions still exhausts it.

use std::sync::Arc;

use orrery_wire::topic::TopicPattern;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::{BusEndpoint, RefreshPolicy};
use crate::credential::{Credential, CredentialSource};
use crate::error::{ConnectError, ObserverError, SessionError};
use crate::router::Subscription;
use crate::transport::{BusConnection, BusTransport, SessionId};

/// Called with the lost session and the reason whenever a session drops.
pub type DisconnectCallback = Box<dyn Fn(SessionId, &ConnectError) + Send + Sync>;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One authenticated connection and its refresh task.
pub struct Session {
    id: SessionId,
    pub(crate) connection: Box<dyn BusConnection>,
    credential: Credential,
    pub(crate) refreshed: mpsc::Receiver<Credential>,
    refresh_task: JoinHandle<()>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Credential currently presented to the bus.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn connection(&mut self) -> &mut dyn BusConnection {
        self.connection.as_mut()
    }

    /// Bind the session's one subscription.
    pub async fn subscribe(&mut self, pattern: TopicPattern) -> Result<Subscription, ConnectError> {
        self.connection.subscribe(&pattern).await?;
        tracing::info!(session = %self.id, pattern = %pattern, "subscribed");
        Ok(Subscription {
            session: self.id,
            pattern,
        })
    }

    /// Wait for the refresh task to deliver a new credential.
    pub async fn next_refresh(&mut self) -> Option<Credential> {
        self.refreshed.recv().await
    }

    /// Close the connection. The refresh task stops with the session.
    pub async fn close(mut self) {
        self.connection.close().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

fn spawn_refresh(
    session: SessionId,
    source: Arc<dyn CredentialSource>,
    policy: RefreshPolicy,
    mut current: Credential,
    tx: mpsc::Sender<Credential>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = policy.delay(current.expires_in());
        loop {
            tokio::time::sleep(delay).await;
            match source.refresh(&current).await {
                Ok(fresh) => {
                    delay = policy.delay(fresh.expires_in());
                    current = fresh.clone();
                    if tx.send(fresh).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    delay = policy.retry_delay();
                    tracing::warn!(
                        session = %session,
                        error = %e,
                        retry_secs = delay.as_secs(),
                        "credential refresh failed; keeping current credential"
                    );
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Opens, refreshes and re-opens bus sessions.
pub struct ConnectionManager {
    transport: Arc<dyn BusTransport>,
    credentials: Arc<dyn CredentialSource>,
    endpoint: BusEndpoint,
    refresh: RefreshPolicy,
    backoff: Backoff,
    next_session: u64,
    callbacks: Vec<DisconnectCallback>,
    last_error: Option<String>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        credentials: Arc<dyn CredentialSource>,
        endpoint: BusEndpoint,
        refresh: RefreshPolicy,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            credentials,
            endpoint,
            refresh,
            backoff: Backoff::new(backoff),
            next_session: 0,
            callbacks: Vec::new(),
            last_error: None,
        }
    }

    /// Register a callback run on every session loss.
    pub fn on_disconnect(&mut self, callback: impl Fn(SessionId, &ConnectError) + Send + Sync + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Acquire a credential and open a new session.
    ///
    /// # Errors
    ///
    /// [`SessionError::Auth`] if no credential could be obtained,
    /// [`SessionError::Connect`] if the bus refused the connection.
    pub async fn connect(&mut self) -> Result<Session, SessionError> {
        let credential = self.credentials.acquire().await?;
        self.next_session += 1;
        let id = SessionId(self.next_session);
        let connection = self.transport.open(&self.endpoint, &credential, id).await?;

        let (tx, rx) = mpsc::channel(1);
        let refresh_task = spawn_refresh(
            id,
            Arc::clone(&self.credentials),
            self.refresh,
            credential.clone(),
            tx,
        );
        tracing::info!(session = %id, endpoint = %self.endpoint, "bus session opened");
        Ok(Session {
            id,
            connection,
            credential,
            refreshed: rx,
            refresh_task,
        })
    }

    /// Wait out the next backoff delay and connect, until a connect succeeds
    /// or the backoff is exhausted. Authentication failures count as failed
    /// attempts here.
    pub async fn reconnect(&mut self) -> Result<Session, ObserverError> {
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                let last = self.last_error.clone().unwrap_or_default();
                tracing::error!(attempts, last_error = %last, "reconnect attempts exhausted");
                return Err(ObserverError::ReconnectExhausted { attempts, last });
            };
            tracing::info!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::time::sleep(delay).await;
            match self.connect().await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::warn!(error = %e, "reconnect attempt failed");
                    self.last_error = Some(e.to_string());
                }
            }
        }
    }

    /// The session is subscribed; past failures are forgotten.
    pub fn mark_established(&mut self) {
        self.backoff.reset();
        self.last_error = None;
    }

    /// Record a failed attempt that never produced a session.
    pub fn note_failure(&mut self, error: &SessionError) {
        self.last_error = Some(error.to_string());
    }

    /// Run the disconnect callbacks for a lost session.
    pub fn handle_disconnect(&mut self, session: SessionId, error: &ConnectError) {
        tracing::warn!(session = %session, error = %error, "bus session lost");
        self.last_error = Some(error.to_string());
        for callback in &self.callbacks {
            callback(session, error);
        }
    }

    /// Refresh the session credential now, off schedule.
    pub async fn refresh_credential(&self, session: &mut Session) -> Result<(), SessionError> {
        let fresh = self.credentials.refresh(&session.credential).await?;
        self.apply_refreshed(session, fresh).await?;
        Ok(())
    }

    /// Present `fresh` on the live connection without reconnecting.
    pub async fn apply_refreshed(&self, session: &mut Session, fresh: Credential) -> Result<(), ConnectError> {
        session.connection.update_secret(&fresh).await?;
        session.credential = fresh;
        tracing::debug!(session = %session.id, "credential refreshed");
        Ok(())
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::StaticIssuer;
    use crate::error::AuthError;
    use crate::transport::MemoryBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn manager(bus: &MemoryBus, issuer: Arc<StaticIssuer>, refresh: RefreshPolicy) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(bus.clone()),
            issuer,
            BusEndpoint::default(),
            refresh,
            BackoffPolicy {
                jitter: 0.0,
                max_attempts: Some(3),
                ..BackoffPolicy::default()
            },
        )
    }

    fn issuer() -> Arc<StaticIssuer> {
        Arc::new(StaticIssuer::new("token", Duration::from_secs(300)))
    }

    #[tokio::test]
    async fn sessions_are_numbered() {
        let bus = MemoryBus::new();
        let mut mgr = manager(&bus, issuer(), RefreshPolicy::default());
        let first = mgr.connect().await.unwrap();
        let second = mgr.connect().await.unwrap();
        assert_eq!(first.id(), SessionId(1));
        assert_eq!(second.id(), SessionId(2));
        assert_eq!(bus.current_session(), Some(SessionId(2)));
    }

    #[tokio::test]
    async fn auth_failure_surfaces_from_connect() {
        let bus = MemoryBus::new();
        let issuer = issuer();
        issuer.fail_next(1);
        let mut mgr = manager(&bus, issuer, RefreshPolicy::default());
        assert!(matches!(mgr.connect().await, Err(SessionError::Auth(AuthError::Rejected { .. }))));
        assert!(bus.log().connects.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_task_follows_fixed_policy() {
        let bus = MemoryBus::new();
        let mut mgr = manager(&bus, issuer(), RefreshPolicy::Fixed { interval_secs: 180 });
        let start = Instant::now();
        let mut session = mgr.connect().await.unwrap();

        let fresh = session.next_refresh().await.unwrap();
        assert_eq!(Instant::now() - start, Duration::from_secs(180));
        assert_eq!(fresh.access_token(), "token-2");

        mgr.apply_refreshed(&mut session, fresh).await.unwrap();
        assert_eq!(session.credential().access_token(), "token-2");
        assert_eq!(bus.log().secret_updates, vec![(SessionId(1), "token-2".to_owned())]);
        assert_eq!(bus.log().connects.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_retries_on_the_retry_delay() {
        let bus = MemoryBus::new();
        let issuer = issuer();
        let mut mgr = manager(
            &bus,
            Arc::clone(&issuer),
            RefreshPolicy::BeforeExpiry {
                margin_secs: 30,
                min_interval_secs: 10,
            },
        );
        let start = Instant::now();
        let mut session = mgr.connect().await.unwrap();
        issuer.fail_next(1);

        session.next_refresh().await.unwrap();
        assert_eq!(Instant::now() - start, Duration::from_secs(270 + 10));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_the_backoff_delay() {
        let bus = MemoryBus::new();
        let mut mgr = manager(&bus, issuer(), RefreshPolicy::default());
        let start = Instant::now();
        let session = mgr.reconnect().await.unwrap();
        assert_eq!(Instant::now() - start, Duration::from_secs(1));
        assert_eq!(session.id(), SessionId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_max_attempts() {
        let bus = MemoryBus::new();
        bus.refuse_connects(10);
        let mut mgr = manager(&bus, issuer(), RefreshPolicy::default());
        let start = Instant::now();
        let err = mgr.reconnect().await.unwrap_err();
        assert!(matches!(err, ObserverError::ReconnectExhausted { attempts: 3, .. }));
        assert_eq!(Instant::now() - start, Duration::from_secs(1 + 2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn established_session_resets_backoff() {
        let bus = MemoryBus::new();
        bus.refuse_connects(1);
        let mut mgr = manager(&bus, issuer(), RefreshPolicy::default());
        let _session = mgr.reconnect().await.unwrap();
        assert_eq!(mgr.backoff().attempts(), 2);
        mgr.mark_established();
        assert_eq!(mgr.backoff().attempts(), 0);
    }

    #[tokio::test]
    async fn disconnect_callbacks_all_fire() {
        let bus = MemoryBus::new();
        let mut mgr = manager(&bus, issuer(), RefreshPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            mgr.on_disconnect(move |session, _| {
                assert_eq!(session, SessionId(4));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        mgr.handle_disconnect(
            SessionId(4),
            &ConnectError::Closed {
                reason: "test".to_owned(),
            },
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn subscribe_binds_the_pattern() {
        let bus = MemoryBus::new();
        let mut mgr = manager(&bus, issuer(), RefreshPolicy::default());
        let mut session = mgr.connect().await.unwrap();
        let subscription = session.subscribe(TopicPattern::new("sos.#")).await.unwrap();
        assert_eq!(subscription.session, SessionId(1));
        assert_eq!(bus.log().subscriptions, vec![(SessionId(1), "sos.#".to_owned())]);
    }

    #[tokio::test]
    async fn manual_refresh_swaps_the_secret() {
        let bus = MemoryBus::new();
        let mut mgr = manager(&bus, issuer(), RefreshPolicy::default());
        let mut session = mgr.connect().await.unwrap();
        mgr.refresh_credential(&mut session).await.unwrap();
        assert_eq!(session.credential().access_token(), "token-2");
        assert_eq!(bus.log().secret_updates.len(), 1);
    }
}
