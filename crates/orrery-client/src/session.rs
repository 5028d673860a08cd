//! Observer session lifecycle.
//!
//! ```text
//! Disconnected -> Authenticating -> Subscribed -> AwaitingInit
//!     -> Initialized (Init) -> Running (Start) <-> Stopped (Stop / Start)
//! ```
//!
//! `Faulted` is reachable from anywhere and has no way out except
//! [`SessionStateMachine::reset`].
//!
//! The scenario phases (`AwaitingInit` onwards) are remembered across a
//! transport loss: the coordinator does not resend `Init` to an observer that
//! reconnects, so after resubscribing the machine returns to where it was.

use orrery_wire::control::ControlKind;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolStateError;

/// Lifecycle phase of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disconnected,
    Authenticating,
    Subscribed,
    AwaitingInit,
    /// `Init` received, `Start` pending.
    Initialized,
    Running,
    Stopped,
    Faulted,
}

impl Phase {
    /// Phases that describe the scenario rather than the connection.
    pub fn is_scenario(self) -> bool {
        matches!(
            self,
            Phase::AwaitingInit | Phase::Initialized | Phase::Running | Phase::Stopped
        )
    }

    /// Entity updates may mutate state in this phase.
    pub fn accepts_entities(self) -> bool {
        self == Phase::Subscribed || self.is_scenario()
    }

    /// Entity updates in this phase arrived before the run started.
    pub fn is_pre_run(self) -> bool {
        matches!(
            self,
            Phase::Subscribed | Phase::AwaitingInit | Phase::Initialized
        )
    }
}

/// Tracks the observer phase and gates control messages.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: Phase,
    /// Scenario phase to restore after the next successful subscription.
    remembered: Option<Phase>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            remembered: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Scenario phase that will be restored on resubscription, if any.
    pub fn remembered(&self) -> Option<Phase> {
        self.remembered
    }

    // -- connection lifecycle -------------------------------------------------

    /// Start (or restart) authentication for a new session.
    pub fn begin_connect(&mut self) {
        if self.phase == Phase::Faulted {
            return;
        }
        self.phase = Phase::Authenticating;
    }

    /// The subscription is bound. Passes through `Subscribed` and settles on
    /// the remembered scenario phase, or `AwaitingInit` for a fresh
    /// scenario. Returns the settled phase.
    pub fn subscribed(&mut self) -> Phase {
        if self.phase == Phase::Faulted {
            return self.phase;
        }
        self.phase = Phase::Subscribed;
        self.phase = self.remembered.take().unwrap_or(Phase::AwaitingInit);
        self.phase
    }

    /// The transport is gone. Scenario progress is kept for restoration.
    pub fn transport_lost(&mut self) {
        if self.phase == Phase::Faulted {
            return;
        }
        if self.phase.is_scenario() {
            self.remembered = Some(self.phase);
        }
        self.phase = Phase::Disconnected;
    }

    pub fn fault(&mut self) {
        self.phase = Phase::Faulted;
    }

    /// Back to `Disconnected`, forgetting any remembered scenario phase.
    pub fn reset(&mut self) {
        self.phase = Phase::Disconnected;
        self.remembered = None;
    }

    /// Force a phase, e.g. when restoring a captured observer.
    pub fn restore(&mut self, phase: Phase) {
        self.phase = phase;
        self.remembered = None;
    }

    // -- scenario control -----------------------------------------------------

    /// The phase a control message of `kind` would lead to, without
    /// committing it.
    ///
    /// # Errors
    ///
    /// [`ProtocolStateError`] if the current phase does not expect `kind`.
    pub fn check_control(&self, kind: ControlKind) -> Result<Phase, ProtocolStateError> {
        use Phase::*;
        let next = match (kind, self.phase) {
            (ControlKind::Init, AwaitingInit | Initialized | Stopped) => Some(Initialized),
            (ControlKind::Start, Initialized | Running | Stopped) => Some(Running),
            (ControlKind::TimeUpdate, Initialized | Running | Stopped) => Some(self.phase),
            (ControlKind::RateUpdate, Initialized | Running) => Some(self.phase),
            (ControlKind::Stop, Initialized | Running | Stopped) => Some(Stopped),
            _ => None,
        };
        next.ok_or(ProtocolStateError {
            kind,
            phase: self.phase,
        })
    }

    /// Commit a phase obtained from [`check_control`](Self::check_control).
    pub fn commit(&mut self, next: Phase) {
        self.phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribed() -> SessionStateMachine {
        let mut sm = SessionStateMachine::new();
        sm.begin_connect();
        assert_eq!(sm.phase(), Phase::Authenticating);
        assert_eq!(sm.subscribed(), Phase::AwaitingInit);
        sm
    }

    fn apply(sm: &mut SessionStateMachine, kind: ControlKind) -> Result<Phase, ProtocolStateError> {
        let next = sm.check_control(kind)?;
        sm.commit(next);
        Ok(next)
    }

    #[test]
    fn happy_path() {
        let mut sm = subscribed();
        assert_eq!(apply(&mut sm, ControlKind::Init), Ok(Phase::Initialized));
        assert_eq!(apply(&mut sm, ControlKind::TimeUpdate), Ok(Phase::Initialized));
        assert_eq!(apply(&mut sm, ControlKind::Start), Ok(Phase::Running));
        assert_eq!(apply(&mut sm, ControlKind::RateUpdate), Ok(Phase::Running));
        assert_eq!(apply(&mut sm, ControlKind::Stop), Ok(Phase::Stopped));
        assert_eq!(apply(&mut sm, ControlKind::Start), Ok(Phase::Running));
    }

    #[test]
    fn init_is_the_only_way_out_of_awaiting_init() {
        for kind in [
            ControlKind::Start,
            ControlKind::TimeUpdate,
            ControlKind::RateUpdate,
            ControlKind::Stop,
        ] {
            let sm = subscribed();
            let err = sm.check_control(kind).unwrap_err();
            assert_eq!(err.phase, Phase::AwaitingInit);
            assert_eq!(err.kind, kind);
        }
    }

    #[test]
    fn init_while_running_is_rejected() {
        let mut sm = subscribed();
        apply(&mut sm, ControlKind::Init).unwrap();
        apply(&mut sm, ControlKind::Start).unwrap();
        assert!(sm.check_control(ControlKind::Init).is_err());
        assert_eq!(sm.phase(), Phase::Running);
    }

    #[test]
    fn rate_update_does_not_resume_a_stopped_run() {
        let mut sm = subscribed();
        apply(&mut sm, ControlKind::Init).unwrap();
        apply(&mut sm, ControlKind::Start).unwrap();
        apply(&mut sm, ControlKind::Stop).unwrap();
        assert!(sm.check_control(ControlKind::RateUpdate).is_err());
    }

    #[test]
    fn control_before_subscription_is_rejected() {
        let sm = SessionStateMachine::new();
        assert!(sm.check_control(ControlKind::Init).is_err());
    }

    #[test]
    fn reconnect_restores_scenario_phase() {
        let mut sm = subscribed();
        apply(&mut sm, ControlKind::Init).unwrap();
        apply(&mut sm, ControlKind::Start).unwrap();

        sm.transport_lost();
        assert_eq!(sm.phase(), Phase::Disconnected);
        assert_eq!(sm.remembered(), Some(Phase::Running));

        sm.begin_connect();
        assert_eq!(sm.subscribed(), Phase::Running);
        assert_eq!(sm.remembered(), None);
    }

    #[test]
    fn loss_during_reconnect_keeps_memory() {
        let mut sm = subscribed();
        apply(&mut sm, ControlKind::Init).unwrap();
        sm.transport_lost();
        sm.begin_connect();
        sm.transport_lost();
        sm.begin_connect();
        assert_eq!(sm.subscribed(), Phase::Initialized);
    }

    #[test]
    fn faulted_is_sticky_until_reset() {
        let mut sm = subscribed();
        apply(&mut sm, ControlKind::Init).unwrap();
        sm.fault();
        sm.begin_connect();
        sm.transport_lost();
        assert_eq!(sm.subscribed(), Phase::Faulted);

        sm.reset();
        assert_eq!(sm.phase(), Phase::Disconnected);
        sm.begin_connect();
        assert_eq!(sm.subscribed(), Phase::AwaitingInit);
    }

    #[test]
    fn entity_gate() {
        assert!(!Phase::Disconnected.accepts_entities());
        assert!(!Phase::Authenticating.accepts_entities());
        assert!(!Phase::Faulted.accepts_entities());
        assert!(Phase::Subscribed.accepts_entities());
        assert!(Phase::Stopped.accepts_entities());
        assert!(Phase::Initialized.is_pre_run());
        assert!(!Phase::Running.is_pre_run());
        assert!(!Phase::Stopped.is_pre_run());
    }
}
