//! Route handlers of the default table.
//!
//! Control handlers decode the coordinator message and hand it to the engine,
//! which checks it against the session phase before the clock sees it.
//! Entity handlers decode a full-state snapshot, stamp it with the current
//! simulated instant when the payload carries none, and apply it under the
//! pre-run policy. Status handlers advance the status of a known target.

use orrery_state::attributes::EntitySnapshot;
use orrery_state::identity::EntityKey;
use orrery_state::record::TargetStatus;
use orrery_wire::control::{ControlKind, ControlMessage};
use orrery_wire::entity::{GroundLocation, SatelliteStatus, TargetEvent, TargetLocation};
use orrery_wire::{decode, Payload};

use crate::engine::{EngineState, PendingUpdate};
use crate::error::HandleError;
use crate::router::{Envelope, Handled};

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

fn control(state: &mut EngineState, env: &Envelope<'_>, kind: ControlKind) -> Result<Handled, HandleError> {
    let msg = ControlMessage::decode(kind, env.body)?;
    state.apply_control(msg, env.real_now)?;
    Ok(Handled::Applied)
}

pub fn on_init(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    control(state, env, ControlKind::Init)
}

pub fn on_start(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    control(state, env, ControlKind::Start)
}

/// Serves both `manager.time` and `manager.status.time`.
pub fn on_time(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    control(state, env, ControlKind::TimeUpdate)
}

pub fn on_update(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    control(state, env, ControlKind::RateUpdate)
}

pub fn on_stop(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    control(state, env, ControlKind::Stop)
}

// ---------------------------------------------------------------------------
// Entity snapshots
// ---------------------------------------------------------------------------

fn location<P>(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError>
where
    P: Payload,
    EntitySnapshot: From<P>,
{
    let payload: P = decode(env.body)?;
    let snapshot = EntitySnapshot::from(payload).observed_at_or(state.clock().now());
    state.apply_entity(PendingUpdate::Upsert(snapshot))
}

pub fn on_satellite_location(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    location::<SatelliteStatus>(state, env)
}

pub fn on_ground_location(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    location::<GroundLocation>(state, env)
}

pub fn on_target_location(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    location::<TargetLocation>(state, env)
}

// ---------------------------------------------------------------------------
// Target status events
// ---------------------------------------------------------------------------

fn status(state: &mut EngineState, env: &Envelope<'_>, status: TargetStatus) -> Result<Handled, HandleError> {
    let event: TargetEvent = decode(env.body)?;
    let at = event.at.or_else(|| state.clock().now());
    state.apply_entity(PendingUpdate::Status {
        key: EntityKey::target(event.id),
        status,
        actor: event.by,
        at,
    })
}

pub fn on_detected(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    status(state, env, TargetStatus::Detected)
}

pub fn on_reported(state: &mut EngineState, env: &Envelope<'_>) -> Result<Handled, HandleError> {
    status(state, env, TargetStatus::Reported)
}
