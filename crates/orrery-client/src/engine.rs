//! The synchronization engine: session phase, simulated clock and entity
//! store, driven by routed deliveries.
//!
//! [`SyncEngine`] is transport-free. Feeding it `(topic, body)` pairs is all
//! it takes to reconstruct the testbed state, which is what the observer's
//! dispatch loop does and what [`replay`](crate::replay::replay) does
//! offline.
//!
//! ```
//! use orrery_client::config::ObserverConfig;
//! use orrery_client::engine::SyncEngine;
//! use orrery_client::session::Phase;
//! use orrery_wire::topic::Namespace;
//! use tokio::time::Instant;
//!
//! let config = ObserverConfig::new(Namespace::new("sos").unwrap());
//! let mut engine = SyncEngine::new(&config);
//! engine.begin_connect();
//! engine.subscribed();
//!
//! let init = br#"{"taskingParameters": {"simStartTime": "2024-01-01T00:00:00Z",
//!                                        "simStopTime": "2024-01-01T06:00:00Z"}}"#;
//! let outcome = engine.dispatch("sos.manager.init", init, false, Instant::now());
//! assert!(outcome.acknowledges());
//! assert_eq!(engine.phase(), Phase::Initialized);
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use orrery_state::attributes::EntitySnapshot;
use orrery_state::category::CategoryTable;
use orrery_state::identity::EntityKey;
use orrery_state::journal::ChangeBatch;
use orrery_state::record::{EntityRecord, TargetStatus};
use orrery_state::store::EntityStateStore;
use orrery_state::trail::TrailConfig;
use orrery_state::StateError;
use orrery_wire::control::{ControlKind, ControlMessage};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::{ClockController, ClockError};
use crate::config::{ObserverConfig, PreRunPolicy};
use crate::error::{HandleError, ProtocolStateError};
use crate::replay::DeliveryRecorder;
use crate::router::{DispatchOutcome, Handled, TopicRouter};
use crate::session::{Phase, SessionStateMachine};

// ---------------------------------------------------------------------------
// PendingUpdate
// ---------------------------------------------------------------------------

/// An entity mutation, possibly held back until the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingUpdate {
    /// Full-state snapshot of one entity.
    Upsert(EntitySnapshot),
    /// Status advance of an existing target.
    Status {
        key: EntityKey,
        status: TargetStatus,
        actor: Option<String>,
        at: Option<DateTime<Utc>>,
    },
}

// ---------------------------------------------------------------------------
// EngineState
// ---------------------------------------------------------------------------

/// Everything a handler may touch.
#[derive(Debug)]
pub struct EngineState {
    session: SessionStateMachine,
    clock: ClockController,
    store: EntityStateStore,
    pre_run: PreRunPolicy,
    pending: VecDeque<PendingUpdate>,
}

impl EngineState {
    pub fn new(trail: TrailConfig, categories: CategoryTable, pre_run: PreRunPolicy) -> Self {
        Self {
            session: SessionStateMachine::new(),
            clock: ClockController::new(),
            store: EntityStateStore::new(trail, categories),
            pre_run,
            pending: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn session(&self) -> &SessionStateMachine {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut SessionStateMachine {
        &mut self.session
    }

    pub fn clock(&self) -> &ClockController {
        &self.clock
    }

    pub(crate) fn clock_mut(&mut self) -> &mut ClockController {
        &mut self.clock
    }

    pub fn store(&self) -> &EntityStateStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EntityStateStore {
        &mut self.store
    }

    pub fn pre_run(&self) -> PreRunPolicy {
        self.pre_run
    }

    /// Updates held back by [`PreRunPolicy::Buffer`], oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingUpdate> {
        self.pending.iter()
    }

    pub(crate) fn replace_pending(&mut self, pending: Vec<PendingUpdate>) {
        self.pending = pending.into();
    }

    /// Apply a control message: the session phase is checked first, then
    /// the clock; the phase transition is committed only if both accept.
    pub fn apply_control(&mut self, msg: ControlMessage, real_now: Instant) -> Result<(), HandleError> {
        let kind = msg.kind();
        let from = self.session.phase();
        let next = self.session.check_control(kind)?;

        self.clock.apply_control(&msg, real_now).map_err(|e| match e {
            ClockError::Invalid(wire) => HandleError::Malformed(wire),
            ClockError::Uninitialized { kind } => {
                HandleError::ProtocolState(ProtocolStateError { kind, phase: from })
            }
        })?;
        self.session.commit(next);

        if from != next {
            tracing::info!(control = %kind, from = ?from, to = ?next, "phase changed");
        }
        if kind == ControlKind::Start && from != Phase::Running {
            self.flush_pending();
        }
        Ok(())
    }

    /// Apply an entity mutation, honoring the pre-run policy. A buffered
    /// update counts as applied; one discarded by the phase or the policy is
    /// [`Handled::Skipped`].
    pub fn apply_entity(&mut self, update: PendingUpdate) -> Result<Handled, HandleError> {
        let phase = self.session.phase();
        if !phase.accepts_entities() {
            tracing::debug!(phase = ?phase, "entity update outside a session; ignored");
            return Ok(Handled::Skipped);
        }
        if !phase.is_pre_run() {
            return self.apply_now(update).map(|()| Handled::Applied);
        }
        match self.pre_run {
            PreRunPolicy::Apply => self.apply_now(update).map(|()| Handled::Applied),
            PreRunPolicy::Buffer { capacity } => {
                self.pending.push_back(update);
                while self.pending.len() > capacity {
                    self.pending.pop_front();
                    tracing::warn!(capacity, "pre-run buffer full; oldest update dropped");
                }
                Ok(Handled::Applied)
            }
            PreRunPolicy::Drop => {
                tracing::debug!(phase = ?phase, "pre-run entity update dropped");
                Ok(Handled::Skipped)
            }
        }
    }

    fn apply_now(&mut self, update: PendingUpdate) -> Result<(), HandleError> {
        match update {
            PendingUpdate::Upsert(snapshot) => {
                self.store.upsert(snapshot);
                Ok(())
            }
            PendingUpdate::Status {
                key,
                status,
                actor,
                at,
            } => match self.store.set_status(&key, status, actor, at) {
                Ok(outcome) => {
                    tracing::debug!(entity = %key, outcome = ?outcome, "status event applied");
                    Ok(())
                }
                Err(StateError::UnknownIdentity { key } | StateError::NoStatus { key }) => {
                    Err(HandleError::UnknownIdentity { key })
                }
            },
        }
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        tracing::info!(count = self.pending.len(), "applying updates buffered before start");
        while let Some(update) = self.pending.pop_front() {
            if let Err(e) = self.apply_now(update) {
                tracing::warn!(error = %e, "buffered update dropped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// Router plus state, with optional delivery recording.
#[derive(Debug)]
pub struct SyncEngine {
    router: TopicRouter,
    state: EngineState,
    recorder: Option<DeliveryRecorder>,
}

impl SyncEngine {
    /// Engine with the default route table and the configured store and
    /// pre-run policy.
    pub fn new(config: &ObserverConfig) -> Self {
        let mut state = EngineState::new(config.trail, config.categories.clone(), config.pre_run);
        state.store_mut().set_journal_capacity(config.journal_capacity);
        Self::with_router(
            TopicRouter::with_default_routes(config.namespace.clone(), &config.target_app),
            state,
        )
    }

    pub fn with_router(router: TopicRouter, state: EngineState) -> Self {
        Self {
            router,
            state,
            recorder: None,
        }
    }

    /// Route one delivery and apply it.
    pub fn dispatch(
        &mut self,
        topic: &str,
        body: &[u8],
        redelivered: bool,
        real_now: Instant,
    ) -> DispatchOutcome {
        let outcome = self
            .router
            .dispatch(&mut self.state, topic, body, redelivered, real_now);

        if let Some(mut recorder) = self.recorder.take() {
            recorder.record(topic, body, redelivered, real_now);
            if recorder.checkpoint_due() {
                recorder.checkpoint(self.state_hash());
            }
            self.recorder = Some(recorder);
        }
        outcome
    }

    /// Apply a control message directly, bypassing routing.
    pub fn apply_control(&mut self, msg: ControlMessage, real_now: Instant) -> Result<(), HandleError> {
        self.state.apply_control(msg, real_now)
    }

    // -- accessors ------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn clock(&self) -> &ClockController {
        self.state.clock()
    }

    pub fn store(&self) -> &EntityStateStore {
        self.state.store()
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EngineState {
        &mut self.state
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Drop an entity the presentation considers gone.
    pub fn evict(&mut self, key: &EntityKey) -> Option<EntityRecord> {
        self.state.store.evict(key)
    }

    /// Store changes since the last drain, for incremental redraw.
    pub fn drain_changes(&mut self) -> ChangeBatch {
        self.state.store.drain_changes()
    }

    // -- session lifecycle ----------------------------------------------------

    pub fn begin_connect(&mut self) {
        self.state.session.begin_connect();
    }

    /// The namespace subscription is bound; returns the settled phase.
    pub fn subscribed(&mut self) -> Phase {
        self.state.session.subscribed()
    }

    pub fn transport_lost(&mut self) {
        self.state.session.transport_lost();
    }

    pub fn fault(&mut self) {
        self.state.session.fault();
    }

    /// Leave `Faulted` for a fresh start. Entity and clock state are kept;
    /// the remembered scenario phase and any buffered updates are not.
    pub fn reset(&mut self) {
        self.state.session.reset();
        self.state.pending.clear();
    }

    // -- recording ------------------------------------------------------------

    /// Start recording deliveries for offline replay, with a state hash
    /// checkpoint every `checkpoint_interval` deliveries (0 disables
    /// checkpoints). Replaces any recording in progress.
    pub fn start_recording(&mut self, checkpoint_interval: usize) {
        let initial = self.capture_snapshot();
        self.recorder = Some(DeliveryRecorder::new(initial, Instant::now(), checkpoint_interval));
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Stop recording and return the log, if a recording was in progress.
    pub fn finish_recording(&mut self) -> Option<crate::replay::DeliveryLog> {
        self.recorder.take().map(DeliveryRecorder::finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orrery_state::identity::EntityKey;
    use orrery_wire::topic::Namespace;

    const INIT: &[u8] = br#"{"taskingParameters": {
        "simStartTime": "2024-01-01T00:00:00Z",
        "simStopTime": "2024-01-01T06:00:00Z"}}"#;

    fn sat(id: &str, lat: f64) -> Vec<u8> {
        format!(r#"{{"id": "{id}", "latitude": {lat}, "longitude": 0, "altitude": 500000}}"#).into_bytes()
    }

    fn engine(pre_run: PreRunPolicy) -> SyncEngine {
        let mut config = ObserverConfig::new(Namespace::new("sos").unwrap());
        config.pre_run = pre_run;
        let mut engine = SyncEngine::new(&config);
        engine.begin_connect();
        engine.subscribed();
        engine
    }

    fn start(engine: &mut SyncEngine, now: Instant) {
        engine.dispatch("sos.manager.init", INIT, false, now);
        engine.dispatch(
            "sos.manager.start",
            br#"{"taskingParameters": {"timeScalingFactor": 60}}"#,
            false,
            now,
        );
    }

    // -- 1. Acknowledgment ---------------------------------------------------

    #[test]
    fn handled_deliveries_are_acked() {
        let mut engine = engine(PreRunPolicy::Apply);
        let outcome = engine.dispatch("sos.manager.init", INIT, false, Instant::now());
        assert_eq!(outcome, DispatchOutcome::Ack);
    }

    #[test]
    fn unrouted_and_malformed_deliveries_are_ignored() {
        let mut engine = engine(PreRunPolicy::Apply);
        let now = Instant::now();
        assert_eq!(engine.dispatch("sos.planner.plan", b"{}", false, now), DispatchOutcome::Ignored);
        assert_eq!(
            engine.dispatch("sos.constellation.location", b"not json", false, now),
            DispatchOutcome::Ignored
        );
        assert!(engine.store().is_empty());
    }

    #[test]
    fn unknown_identity_is_requeued_once() {
        let mut engine = engine(PreRunPolicy::Apply);
        let body = br#"{"fireId": 7, "detectedBy": "A"}"#;
        let now = Instant::now();
        assert_eq!(
            engine.dispatch("sos.constellation.detected", body, false, now),
            DispatchOutcome::Reject { requeue: true }
        );
        assert_eq!(
            engine.dispatch("sos.constellation.detected", body, true, now),
            DispatchOutcome::Ignored
        );
        assert!(!engine.store().contains(&EntityKey::target("7")));
    }

    #[test]
    fn out_of_order_control_is_ignored() {
        let mut engine = engine(PreRunPolicy::Apply);
        let outcome = engine.dispatch(
            "sos.manager.start",
            br#"{"taskingParameters": {"timeScalingFactor": 1}}"#,
            false,
            Instant::now(),
        );
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert_eq!(engine.phase(), Phase::AwaitingInit);
        assert!(!engine.clock().is_initialized());
    }

    // -- 2. Control ----------------------------------------------------------

    #[test]
    fn invalid_rate_keeps_phase_and_clock() {
        let mut engine = engine(PreRunPolicy::Apply);
        let now = Instant::now();
        start(&mut engine, now);
        let outcome = engine.dispatch(
            "sos.manager.update",
            br#"{"taskingParameters": {"timeScalingFactor": -2}}"#,
            false,
            now,
        );
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert_eq!(engine.clock().multiplier(), 60.0);
        assert_eq!(engine.phase(), Phase::Running);
    }

    #[test]
    fn stop_keeps_state_and_start_resumes() {
        let mut engine = engine(PreRunPolicy::Apply);
        let now = Instant::now();
        start(&mut engine, now);
        engine.dispatch("sos.constellation.location", &sat("A", 1.0), false, now);
        engine.dispatch("sos.manager.stop", b"{}", false, now);
        assert_eq!(engine.phase(), Phase::Stopped);
        assert_eq!(engine.clock().multiplier(), 0.0);
        assert_eq!(engine.store().len(), 1);

        engine.dispatch(
            "sos.manager.start",
            br#"{"taskingParameters": {"timeScalingFactor": 10}}"#,
            false,
            now,
        );
        assert_eq!(engine.phase(), Phase::Running);
        assert_eq!(engine.clock().multiplier(), 10.0);
    }

    // -- 3. Pre-run policy ---------------------------------------------------

    #[test]
    fn buffered_updates_apply_on_start() {
        let mut engine = engine(PreRunPolicy::Buffer { capacity: 2 });
        let now = Instant::now();
        for (i, id) in ["A", "B", "C"].iter().enumerate() {
            engine.dispatch("sos.constellation.location", &sat(id, i as f64), false, now);
        }
        assert!(engine.store().is_empty());
        assert_eq!(engine.state().pending().count(), 2);

        start(&mut engine, now);
        assert_eq!(engine.state().pending().count(), 0);
        assert!(!engine.store().contains(&EntityKey::satellite("A")));
        assert!(engine.store().contains(&EntityKey::satellite("B")));
        assert!(engine.store().contains(&EntityKey::satellite("C")));
    }

    #[test]
    fn buffered_status_for_unknown_target_is_dropped_on_flush() {
        let mut engine = engine(PreRunPolicy::Buffer { capacity: 8 });
        let now = Instant::now();
        engine.dispatch(
            "sos.constellation.detected",
            br#"{"fireId": 7, "detectedBy": "A"}"#,
            false,
            now,
        );
        start(&mut engine, now);
        assert!(engine.store().is_empty());
        assert_eq!(engine.phase(), Phase::Running);
    }

    #[test]
    fn dropped_pre_run_updates_are_ignored() {
        let mut engine = engine(PreRunPolicy::Drop);
        let outcome = engine.dispatch("sos.constellation.location", &sat("A", 0.0), false, Instant::now());
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert!(outcome.acknowledges());
        assert!(engine.store().is_empty());
    }

    #[test]
    fn buffered_pre_run_updates_are_acked() {
        let mut engine = engine(PreRunPolicy::Buffer { capacity: 4 });
        let outcome = engine.dispatch("sos.constellation.location", &sat("A", 0.0), false, Instant::now());
        assert_eq!(outcome, DispatchOutcome::Ack);
    }

    #[test]
    fn entities_are_ignored_when_not_subscribed() {
        let config = ObserverConfig::new(Namespace::new("sos").unwrap());
        let mut engine = SyncEngine::new(&config);
        let outcome = engine.dispatch("sos.constellation.location", &sat("A", 0.0), false, Instant::now());
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert!(engine.store().is_empty());
    }

    // -- 4. Lifecycle --------------------------------------------------------

    #[test]
    fn reconnect_resumes_the_run() {
        let mut engine = engine(PreRunPolicy::Apply);
        let now = Instant::now();
        start(&mut engine, now);
        engine.transport_lost();
        assert_eq!(engine.phase(), Phase::Disconnected);
        engine.begin_connect();
        assert_eq!(engine.subscribed(), Phase::Running);
        assert_eq!(engine.clock().multiplier(), 60.0);
    }

    #[test]
    fn evict_and_drain_changes() {
        let mut engine = engine(PreRunPolicy::Apply);
        let now = Instant::now();
        engine.dispatch("sos.constellation.location", &sat("A", 0.0), false, now);
        assert_eq!(engine.drain_changes().len(), 1);
        assert!(engine.evict(&EntityKey::satellite("A")).is_some());
        assert_eq!(engine.drain_changes().len(), 1);
        assert!(engine.store().is_empty());
    }

    #[test]
    fn undrained_journal_stays_bounded() {
        let mut config = ObserverConfig::new(Namespace::new("sos").unwrap());
        config.journal_capacity = 64;
        let mut engine = SyncEngine::new(&config);
        engine.begin_connect();
        engine.subscribed();
        let now = Instant::now();
        for i in 0..5_000 {
            engine.dispatch("sos.constellation.location", &sat("A", f64::from(i % 80)), false, now);
        }
        assert_eq!(engine.store().len(), 1);
        assert_eq!(engine.store().journal().len(), 64);

        let batch = engine.drain_changes();
        assert!(batch.overflowed);
        assert_eq!(batch.len(), 64);
        assert!(!engine.drain_changes().overflowed);
    }
}
