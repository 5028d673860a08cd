//! Local virtual simulation clock.
//!
//! The coordinator owns simulated time. The [`ClockController`] mirrors it
//! from control messages only:
//!
//! | Message          | Effect                                               |
//! |------------------|------------------------------------------------------|
//! | `Init(start, stop)` | epoch bounds set, instant = start, multiplier 0   |
//! | `Start(m)`       | multiplier = m, real-time anchor reset               |
//! | `RateUpdate(m)`  | multiplier = m                                       |
//! | `TimeUpdate(t)`  | instant = t clamped to the epoch, anchor reset       |
//! | `Stop`           | multiplier = 0                                       |
//!
//! [`ClockController::now`] is the last authoritative instant and never
//! moves between control messages. [`ClockController::projected`] is a
//! presentation aid that extrapolates along the current multiplier from the
//! real-time anchor.
//!
//! ```
//! use chrono::{Duration, TimeZone, Utc};
//! use orrery_client::clock::ClockController;
//! use orrery_wire::control::ControlMessage;
//! use tokio::time::Instant;
//!
//! let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let mut clock = ClockController::new();
//! let real = Instant::now();
//!
//! clock.apply_control(&ControlMessage::Init { start: t0, stop: t0 + Duration::hours(1) }, real).unwrap();
//! clock.apply_control(&ControlMessage::Start { multiplier: 2.0 }, real).unwrap();
//! clock.apply_control(&ControlMessage::TimeUpdate { instant: t0 + Duration::seconds(10) }, real).unwrap();
//! assert_eq!(clock.now(), Some(t0 + Duration::seconds(10)));
//! ```

use chrono::{DateTime, Utc};
use orrery_wire::control::{ControlKind, ControlMessage};
use orrery_wire::WireError;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a control message leaves the clock untouched.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// The message carries an unusable value.
    #[error(transparent)]
    Invalid(#[from] WireError),

    /// Only `Init` is meaningful before the epoch is known.
    #[error("{kind} received before init")]
    Uninitialized {
        kind: ControlKind,
    },
}

// ---------------------------------------------------------------------------
// ClockState
// ---------------------------------------------------------------------------

/// Serializable view of an initialized clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockState {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    /// Simulated seconds per real second; 0 while paused.
    pub multiplier: f64,
    /// Last authoritative simulated instant.
    pub current: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct SimulatedClock {
    state: ClockState,
    /// Real instant the projection base refers to.
    anchor: Instant,
    /// Simulated instant at `anchor`, the origin of projection.
    base: DateTime<Utc>,
}

impl SimulatedClock {
    fn clamp(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t.clamp(self.state.start, self.state.stop)
    }

    fn projected(&self, real_now: Instant) -> DateTime<Utc> {
        let elapsed = real_now.saturating_duration_since(self.anchor).as_secs_f64();
        let advance_us = self.state.multiplier * elapsed * 1e6;
        if advance_us <= 0.0 {
            return self.base;
        }
        let room_us = (self.state.stop - self.base)
            .num_microseconds()
            .unwrap_or(i64::MAX) as f64;
        if advance_us >= room_us {
            return self.state.stop;
        }
        self.clamp(self.base + chrono::Duration::microseconds(advance_us as i64))
    }

    /// Move the projection origin to `real_now` so a multiplier change does
    /// not make the projection jump.
    fn reanchor(&mut self, real_now: Instant) {
        self.base = self.projected(real_now);
        self.anchor = real_now;
    }
}

// ---------------------------------------------------------------------------
// ClockController
// ---------------------------------------------------------------------------

/// Mirror of the coordinator's scaled simulation clock.
#[derive(Debug, Clone, Default)]
pub struct ClockController {
    clock: Option<SimulatedClock>,
}

fn validate_multiplier(multiplier: f64) -> Result<(), ClockError> {
    if !multiplier.is_finite() || multiplier < 0.0 {
        return Err(WireError::InvalidValue {
            field: "timeScalingFactor",
            value: multiplier.to_string(),
            reason: "must be finite and not negative",
        }
        .into());
    }
    Ok(())
}

impl ClockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one control message received at `real_now`.
    ///
    /// # Errors
    ///
    /// [`ClockError::Invalid`] for an inverted epoch or a negative /
    /// non-finite multiplier, [`ClockError::Uninitialized`] for anything but
    /// `Init` before the first `Init`. The clock is unchanged on error.
    pub fn apply_control(&mut self, msg: &ControlMessage, real_now: Instant) -> Result<(), ClockError> {
        match *msg {
            ControlMessage::Init { start, stop } => {
                if start > stop {
                    return Err(WireError::InvalidValue {
                        field: "simStopTime",
                        value: stop.to_rfc3339(),
                        reason: "precedes simStartTime",
                    }
                    .into());
                }
                self.clock = Some(SimulatedClock {
                    state: ClockState {
                        start,
                        stop,
                        multiplier: 0.0,
                        current: start,
                    },
                    anchor: real_now,
                    base: start,
                });
            }
            ControlMessage::Start { multiplier } | ControlMessage::RateUpdate { multiplier } => {
                let clock = self.initialized_mut(msg.kind())?;
                validate_multiplier(multiplier)?;
                clock.reanchor(real_now);
                clock.state.multiplier = multiplier;
            }
            ControlMessage::TimeUpdate { instant } => {
                let clock = self.initialized_mut(msg.kind())?;
                let t = clock.clamp(instant);
                if t != instant {
                    tracing::warn!(
                        instant = %instant,
                        clamped = %t,
                        "coordinator time outside the epoch; clamped"
                    );
                }
                clock.state.current = t;
                clock.base = t;
                clock.anchor = real_now;
            }
            ControlMessage::Stop => {
                let clock = self.initialized_mut(msg.kind())?;
                clock.reanchor(real_now);
                clock.state.multiplier = 0.0;
            }
        }
        Ok(())
    }

    fn initialized_mut(&mut self, kind: ControlKind) -> Result<&mut SimulatedClock, ClockError> {
        self.clock.as_mut().ok_or(ClockError::Uninitialized { kind })
    }

    /// Last authoritative simulated instant; `None` before `Init`.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.clock.map(|c| c.state.current)
    }

    /// Extrapolated simulated instant at `real_now`, clamped to the epoch.
    pub fn projected(&self, real_now: Instant) -> Option<DateTime<Utc>> {
        self.clock.map(|c| c.projected(real_now))
    }

    /// Current rate multiplier (0 before `Init` and while paused).
    pub fn multiplier(&self) -> f64 {
        self.clock.map_or(0.0, |c| c.state.multiplier)
    }

    pub fn epoch(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.clock.map(|c| (c.state.start, c.state.stop))
    }

    pub fn is_initialized(&self) -> bool {
        self.clock.is_some()
    }

    pub fn state(&self) -> Option<ClockState> {
        self.clock.map(|c| c.state)
    }

    /// Reinstate a captured clock, anchored at `real_now`.
    pub fn restore(&mut self, state: Option<ClockState>, real_now: Instant) {
        self.clock = state.map(|state| SimulatedClock {
            state,
            anchor: real_now,
            base: state.current,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as SimDuration, TimeZone};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn initialized(real: Instant) -> ClockController {
        let mut clock = ClockController::new();
        clock
            .apply_control(
                &ControlMessage::Init {
                    start: t0(),
                    stop: t0() + SimDuration::hours(1),
                },
                real,
            )
            .unwrap();
        clock
    }

    #[test]
    fn init_sets_bounds_and_pauses() {
        let real = Instant::now();
        let clock = initialized(real);
        assert_eq!(clock.now(), Some(t0()));
        assert_eq!(clock.multiplier(), 0.0);
        assert_eq!(clock.epoch(), Some((t0(), t0() + SimDuration::hours(1))));
        assert_eq!(clock.projected(real + Duration::from_secs(60)), Some(t0()));
    }

    #[test]
    fn inverted_epoch_is_rejected() {
        let mut clock = ClockController::new();
        let err = clock
            .apply_control(
                &ControlMessage::Init {
                    start: t0() + SimDuration::hours(1),
                    stop: t0(),
                },
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, ClockError::Invalid(_)));
        assert!(!clock.is_initialized());
    }

    #[test]
    fn messages_before_init_are_rejected() {
        let mut clock = ClockController::new();
        let err = clock
            .apply_control(&ControlMessage::Start { multiplier: 1.0 }, Instant::now())
            .unwrap_err();
        assert!(matches!(err, ClockError::Uninitialized { kind: ControlKind::Start }));
        assert_eq!(clock.now(), None);
    }

    #[test]
    fn time_update_is_authoritative() {
        let real = Instant::now();
        let mut clock = initialized(real);
        clock
            .apply_control(&ControlMessage::Start { multiplier: 2.0 }, real)
            .unwrap();
        clock
            .apply_control(
                &ControlMessage::TimeUpdate {
                    instant: t0() + SimDuration::seconds(10),
                },
                real,
            )
            .unwrap();
        assert_eq!(clock.now(), Some(t0() + SimDuration::seconds(10)));
        assert_eq!(clock.multiplier(), 2.0);
    }

    #[test]
    fn now_does_not_extrapolate_but_projection_does() {
        let real = Instant::now();
        let mut clock = initialized(real);
        clock
            .apply_control(&ControlMessage::Start { multiplier: 60.0 }, real)
            .unwrap();
        let later = real + Duration::from_secs(2);
        assert_eq!(clock.now(), Some(t0()));
        assert_eq!(clock.projected(later), Some(t0() + SimDuration::seconds(120)));
    }

    #[test]
    fn projection_is_clamped_to_stop() {
        let real = Instant::now();
        let mut clock = initialized(real);
        clock
            .apply_control(&ControlMessage::Start { multiplier: 1_000.0 }, real)
            .unwrap();
        let much_later = real + Duration::from_secs(3_600);
        assert_eq!(clock.projected(much_later), Some(t0() + SimDuration::hours(1)));
    }

    #[test]
    fn time_update_outside_epoch_is_clamped() {
        let real = Instant::now();
        let mut clock = initialized(real);
        clock
            .apply_control(
                &ControlMessage::TimeUpdate {
                    instant: t0() + SimDuration::hours(2),
                },
                real,
            )
            .unwrap();
        assert_eq!(clock.now(), Some(t0() + SimDuration::hours(1)));
        clock
            .apply_control(
                &ControlMessage::TimeUpdate {
                    instant: t0() - SimDuration::hours(2),
                },
                real,
            )
            .unwrap();
        assert_eq!(clock.now(), Some(t0()));
    }

    #[test]
    fn stop_freezes_now_and_projection() {
        let real = Instant::now();
        let mut clock = initialized(real);
        clock
            .apply_control(&ControlMessage::Start { multiplier: 10.0 }, real)
            .unwrap();
        let stop_at = real + Duration::from_secs(3);
        clock.apply_control(&ControlMessage::Stop, stop_at).unwrap();
        assert_eq!(clock.multiplier(), 0.0);

        let frozen_now = clock.now();
        let frozen_projection = clock.projected(stop_at);
        assert_eq!(frozen_projection, Some(t0() + SimDuration::seconds(30)));
        for secs in [10, 100, 1_000] {
            let later = stop_at + Duration::from_secs(secs);
            assert_eq!(clock.now(), frozen_now);
            assert_eq!(clock.projected(later), frozen_projection);
        }
    }

    #[test]
    fn rate_change_keeps_projection_continuous() {
        let real = Instant::now();
        let mut clock = initialized(real);
        clock
            .apply_control(&ControlMessage::Start { multiplier: 1.0 }, real)
            .unwrap();
        let switch = real + Duration::from_secs(10);
        clock
            .apply_control(&ControlMessage::RateUpdate { multiplier: 5.0 }, switch)
            .unwrap();
        assert_eq!(clock.projected(switch), Some(t0() + SimDuration::seconds(10)));
        assert_eq!(
            clock.projected(switch + Duration::from_secs(2)),
            Some(t0() + SimDuration::seconds(20))
        );
    }

    #[test]
    fn invalid_multiplier_leaves_clock_untouched() {
        let real = Instant::now();
        let mut clock = initialized(real);
        clock
            .apply_control(&ControlMessage::Start { multiplier: 3.0 }, real)
            .unwrap();
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let err = clock
                .apply_control(&ControlMessage::RateUpdate { multiplier: bad }, real)
                .unwrap_err();
            assert!(matches!(err, ClockError::Invalid(_)));
            assert_eq!(clock.multiplier(), 3.0);
        }
    }
}
