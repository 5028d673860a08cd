//! Observer snapshot and restore with BLAKE3 hashing.
//!
//! An [`ObserverSnapshot`] captures what a [`SyncEngine`] has reconstructed:
//! the session phase, the simulated clock, the entity store and any
//! updates buffered before the run started. The digest lets two observers
//! (or an observer and a replay of its deliveries) compare state cheaply.
//!
//! ```
//! use orrery_client::config::ObserverConfig;
//! use orrery_client::engine::SyncEngine;
//! use orrery_wire::topic::Namespace;
//!
//! let config = ObserverConfig::new(Namespace::new("sos").unwrap());
//! let engine = SyncEngine::new(&config);
//! let snapshot = engine.capture_snapshot();
//! assert_eq!(snapshot.hash, engine.state_hash());
//!
//! let mut other = SyncEngine::new(&config);
//! other.restore_from_snapshot(&snapshot).unwrap();
//! assert_eq!(other.state_hash(), engine.state_hash());
//! ```
//!
//! Not captured: the route table, the clock's real-time anchor (a restored
//! clock is anchored at restore time) and any delivery recording.

use orrery_state::snapshot::StoreSnapshot;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::ClockState;
use crate::engine::{PendingUpdate, SyncEngine};
use crate::session::Phase;

/// A serializable snapshot of an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverSnapshot {
    pub phase: Phase,
    /// `None` before `Init`.
    pub clock: Option<ClockState>,
    /// Updates held back until the run starts.
    pub pending: Vec<PendingUpdate>,
    pub store: StoreSnapshot,
    /// BLAKE3 hex digest of phase, clock, pending updates and store digest.
    pub hash: String,
}

fn compute_hash(
    phase: Phase,
    clock: Option<&ClockState>,
    pending: &[PendingUpdate],
    store_hash: &str,
) -> String {
    #[derive(Serialize)]
    struct HashableState<'a> {
        phase: Phase,
        clock: Option<&'a ClockState>,
        pending: &'a [PendingUpdate],
        store: &'a str,
    }

    let json_bytes = serde_json::to_vec(&HashableState {
        phase,
        clock,
        pending,
        store: store_hash,
    })
    .expect("observer state should always be JSON-serializable");
    blake3::hash(&json_bytes).to_hex().to_string()
}

impl SyncEngine {
    pub fn capture_snapshot(&self) -> ObserverSnapshot {
        let phase = self.phase();
        let clock = self.clock().state();
        let pending: Vec<PendingUpdate> = self.state().pending().cloned().collect();
        let store = self.store().capture_snapshot();
        let hash = compute_hash(phase, clock.as_ref(), &pending, &store.hash);
        ObserverSnapshot {
            phase,
            clock,
            pending,
            store,
            hash,
        }
    }

    /// Replace the engine state with a snapshot.
    ///
    /// Both digests (observer and store) are verified before anything is
    /// modified. The route table and recording state are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if either digest does not match its content or the
    /// store snapshot is inconsistent.
    pub fn restore_from_snapshot(&mut self, snapshot: &ObserverSnapshot) -> Result<(), anyhow::Error> {
        let expected = compute_hash(
            snapshot.phase,
            snapshot.clock.as_ref(),
            &snapshot.pending,
            &snapshot.store.hash,
        );
        if expected != snapshot.hash {
            return Err(anyhow::anyhow!(
                "observer snapshot hash mismatch: recorded {} but recomputed {}",
                snapshot.hash,
                expected
            ));
        }

        let state = self.state_mut();
        state.store_mut().restore_from_snapshot(&snapshot.store)?;
        state.clock_mut().restore(snapshot.clock, Instant::now());
        state.session_mut().restore(snapshot.phase);
        state.replace_pending(snapshot.pending.clone());
        tracing::debug!(phase = ?snapshot.phase, "observer restored from snapshot");
        Ok(())
    }

    /// BLAKE3 hex digest of the current engine state.
    pub fn state_hash(&self) -> String {
        let pending: Vec<PendingUpdate> = self.state().pending().cloned().collect();
        compute_hash(
            self.phase(),
            self.clock().state().as_ref(),
            &pending,
            &self.store().state_hash(),
        )
    }
}
