//! Delivery recording and offline replay.
//!
//! While recording, a [`SyncEngine`] appends every delivery it dispatches to
//! a [`DeliveryLog`], together with periodic state hash checkpoints. The log
//! is plain JSON; replaying it into another engine reconstructs the same
//! state without a bus, which turns a field session into a regression
//! fixture.
//!
//! # Recording
//!
//! ```
//! use orrery_client::config::ObserverConfig;
//! use orrery_client::engine::SyncEngine;
//! use orrery_wire::topic::Namespace;
//! use tokio::time::Instant;
//!
//! let config = ObserverConfig::new(Namespace::new("sos").unwrap());
//! let mut engine = SyncEngine::new(&config);
//! engine.begin_connect();
//! engine.subscribed();
//!
//! engine.start_recording(1); // checkpoint after every delivery
//! engine.dispatch(
//!     "sos.ground.location",
//!     br#"{"groundId": 1, "latitude": 10, "longitude": 20}"#,
//!     false,
//!     Instant::now(),
//! );
//! let log = engine.finish_recording().unwrap();
//! assert_eq!(log.total_deliveries, 1);
//! ```
//!
//! # Replaying
//!
//! ```no_run
//! use orrery_client::config::ObserverConfig;
//! use orrery_client::engine::SyncEngine;
//! use orrery_client::replay::{replay, DeliveryLog};
//! use orrery_wire::topic::Namespace;
//!
//! # let log: DeliveryLog = todo!();
//! let config = ObserverConfig::new(Namespace::new("sos").unwrap());
//! let mut engine = SyncEngine::new(&config);
//! let result = replay(&mut engine, &log).expect("log should be valid");
//! assert!(result.completed);
//! assert!(result.first_divergence.is_none());
//! ```
//!
//! Bodies are stored as text; a non-UTF-8 body is recorded lossily.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::engine::SyncEngine;
use crate::snapshot::ObserverSnapshot;

// ---------------------------------------------------------------------------
// DeliveryLog
// ---------------------------------------------------------------------------

/// A recorded session: the engine snapshot at the start of recording plus
/// the ordered deliveries and checkpoints that followed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    /// Replay starts by restoring this snapshot.
    pub initial_snapshot: ObserverSnapshot,
    /// Number of [`ReplayEntry::Delivery`] entries.
    pub total_deliveries: u64,
    pub entries: Vec<ReplayEntry>,
}

/// One delivery as it was dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDelivery {
    /// Real milliseconds since recording started.
    pub offset_ms: u64,
    pub topic: String,
    pub body: String,
    pub redelivered: bool,
}

/// An entry of a [`DeliveryLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayEntry {
    Delivery(RecordedDelivery),
    /// State hash after the given number of deliveries.
    Checkpoint { deliveries: u64, state_hash: String },
}

// ---------------------------------------------------------------------------
// ReplayResult
// ---------------------------------------------------------------------------

/// The outcome of replaying a [`DeliveryLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResult {
    /// All deliveries were replayed without divergence.
    pub completed: bool,
    pub deliveries_replayed: u64,
    /// The first checkpoint whose hash did not match. Replay stops there.
    pub first_divergence: Option<ReplayDivergence>,
}

/// A checkpoint mismatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayDivergence {
    /// Deliveries replayed when the mismatch was detected.
    pub deliveries: u64,
    pub expected_hash: String,
    pub actual_hash: String,
}

// ---------------------------------------------------------------------------
// DeliveryRecorder
// ---------------------------------------------------------------------------

/// Builds a [`DeliveryLog`]; owned by a recording [`SyncEngine`].
#[derive(Debug)]
pub struct DeliveryRecorder {
    log: DeliveryLog,
    started: Instant,
    checkpoint_interval: usize,
}

impl DeliveryRecorder {
    pub fn new(initial_snapshot: ObserverSnapshot, started: Instant, checkpoint_interval: usize) -> Self {
        Self {
            log: DeliveryLog {
                initial_snapshot,
                total_deliveries: 0,
                entries: Vec::new(),
            },
            started,
            checkpoint_interval,
        }
    }

    pub fn record(&mut self, topic: &str, body: &[u8], redelivered: bool, real_now: Instant) {
        let offset = real_now.saturating_duration_since(self.started);
        self.log.entries.push(ReplayEntry::Delivery(RecordedDelivery {
            offset_ms: u64::try_from(offset.as_millis()).unwrap_or(u64::MAX),
            topic: topic.to_owned(),
            body: String::from_utf8_lossy(body).into_owned(),
            redelivered,
        }));
        self.log.total_deliveries += 1;
    }

    /// Whether the delivery just recorded falls on the checkpoint interval.
    pub fn checkpoint_due(&self) -> bool {
        self.checkpoint_interval > 0
            && self.log.total_deliveries % self.checkpoint_interval as u64 == 0
    }

    pub fn checkpoint(&mut self, state_hash: String) {
        self.log.entries.push(ReplayEntry::Checkpoint {
            deliveries: self.log.total_deliveries,
            state_hash,
        });
    }

    pub fn finish(self) -> DeliveryLog {
        self.log
    }
}

// ---------------------------------------------------------------------------
// replay()
// ---------------------------------------------------------------------------

/// Replay a [`DeliveryLog`] into `engine`, verifying every checkpoint.
///
/// The log is validated before `engine` is touched: checkpoints must agree
/// with their position in the log, appear at most once per count, and
/// delivery offsets must not go backwards. The initial snapshot is then
/// restored and the deliveries dispatched in order, each at its recorded
/// real-time offset from the start of replay. Replay stops at the first
/// divergent checkpoint.
///
/// A recording in progress on `engine` records the replayed deliveries too.
///
/// # Errors
///
/// Returns an error if the log is inconsistent or the initial snapshot
/// fails to restore. On error `engine` is unmodified.
pub fn replay(engine: &mut SyncEngine, log: &DeliveryLog) -> Result<ReplayResult, anyhow::Error> {
    let mut deliveries: u64 = 0;
    let mut last_offset: u64 = 0;
    let mut checkpoints = BTreeSet::new();
    for entry in &log.entries {
        match entry {
            ReplayEntry::Delivery(d) => {
                if d.offset_ms < last_offset {
                    return Err(anyhow::anyhow!(
                        "delivery {deliveries} goes back in time: offset {} ms after {last_offset} ms",
                        d.offset_ms
                    ));
                }
                last_offset = d.offset_ms;
                deliveries += 1;
            }
            ReplayEntry::Checkpoint { deliveries: at, .. } => {
                if *at != deliveries {
                    return Err(anyhow::anyhow!(
                        "checkpoint claims {at} deliveries but follows {deliveries}"
                    ));
                }
                if !checkpoints.insert(*at) {
                    return Err(anyhow::anyhow!(
                        "replay log contains duplicate checkpoint after {at} deliveries"
                    ));
                }
            }
        }
    }
    if deliveries != log.total_deliveries {
        return Err(anyhow::anyhow!(
            "replay log declares {} deliveries but contains {deliveries}",
            log.total_deliveries
        ));
    }

    engine
        .restore_from_snapshot(&log.initial_snapshot)
        .map_err(|e| anyhow::anyhow!("failed to restore initial snapshot for replay: {e}"))?;

    let base = Instant::now();
    let mut deliveries_replayed: u64 = 0;
    for entry in &log.entries {
        match entry {
            ReplayEntry::Delivery(d) => {
                let real_now = base + Duration::from_millis(d.offset_ms);
                engine.dispatch(&d.topic, d.body.as_bytes(), d.redelivered, real_now);
                deliveries_replayed += 1;
            }
            ReplayEntry::Checkpoint { state_hash, .. } => {
                let actual_hash = engine.state_hash();
                if &actual_hash != state_hash {
                    tracing::warn!(
                        deliveries = deliveries_replayed,
                        expected = %state_hash,
                        actual = %actual_hash,
                        "replay diverged"
                    );
                    return Ok(ReplayResult {
                        completed: false,
                        deliveries_replayed,
                        first_divergence: Some(ReplayDivergence {
                            deliveries: deliveries_replayed,
                            expected_hash: state_hash.clone(),
                            actual_hash,
                        }),
                    });
                }
            }
        }
    }

    Ok(ReplayResult {
        completed: true,
        deliveries_replayed,
        first_divergence: None,
    })
}
