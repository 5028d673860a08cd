//! Store snapshot and restore with BLAKE3 hashing.
//!
//! A [`StoreSnapshot`] captures every record plus the store sequence counter,
//! together with a BLAKE3 hex digest of that content. Two stores that applied
//! the same deliveries hash identically regardless of arrival order across
//! identities, which makes the digest a cheap convergence check between
//! observers.
//!
//! ```
//! use orrery_state::prelude::*;
//!
//! let mut store = EntityStateStore::default();
//! store.upsert(EntitySnapshot::new(
//!     EntityKey::satellite("A"),
//!     Attributes::at(GeoPosition::new(0.0, 0.0, 0.0)),
//! ));
//! let snapshot = store.capture_snapshot();
//! assert_eq!(snapshot.hash.len(), 64);
//!
//! let mut other = EntityStateStore::default();
//! other.restore_from_snapshot(&snapshot).unwrap();
//! assert_eq!(other.state_hash(), store.state_hash());
//! ```
//!
//! The change journal, category table and trail configuration are not part
//! of a snapshot; a restored store keeps its own.

use serde::{Deserialize, Serialize};

use crate::record::EntityRecord;
use crate::store::EntityStateStore;

/// A serializable snapshot of the store contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// All records in key order.
    pub records: Vec<EntityRecord>,
    /// Store sequence counter at capture time.
    pub seq: u64,
    /// BLAKE3 hex digest of the records.
    pub hash: String,
}

/// Digest over the records in key order. Sequence numbers are zeroed: they
/// record arrival order, which differs between observers that converge on
/// the same state.
pub(crate) fn compute_hash<'a>(records: impl Iterator<Item = &'a EntityRecord>) -> String {
    let mut hasher = blake3::Hasher::new();
    for record in records {
        let mut canonical = record.clone();
        canonical.first_seq = 0;
        canonical.last_seq = 0;
        let bytes = serde_json::to_vec(&canonical)
            .expect("EntityRecord should always be JSON-serializable");
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    hasher.finalize().to_hex().to_string()
}

impl EntityStateStore {
    /// Capture every record and the sequence counter.
    pub fn capture_snapshot(&self) -> StoreSnapshot {
        let records: Vec<EntityRecord> = self.records.values().cloned().collect();
        let hash = compute_hash(records.iter());
        StoreSnapshot {
            records,
            seq: self.seq,
            hash,
        }
    }

    /// Replace the store contents with a snapshot.
    ///
    /// The hash is verified first; on mismatch the store is left untouched.
    /// Restored trails adopt this store's trail configuration. The change
    /// journal is cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the hash does not match the records or if the
    /// snapshot lists the same key twice.
    pub fn restore_from_snapshot(&mut self, snapshot: &StoreSnapshot) -> Result<(), anyhow::Error> {
        let expected = compute_hash(snapshot.records.iter());
        if expected != snapshot.hash {
            return Err(anyhow::anyhow!(
                "store snapshot hash mismatch: recorded {} but recomputed {}",
                snapshot.hash,
                expected
            ));
        }

        let mut records = std::collections::BTreeMap::new();
        for record in &snapshot.records {
            let mut record = record.clone();
            record.trail.reconfigure(self.trail_config);
            if let Some(dup) = records.insert(record.key.clone(), record) {
                return Err(anyhow::anyhow!(
                    "store snapshot lists {} more than once",
                    dup.key
                ));
            }
        }

        self.records = records;
        self.seq = snapshot.seq;
        self.journal.clear();
        tracing::debug!(records = self.records.len(), seq = self.seq, "store restored from snapshot");
        Ok(())
    }

    /// BLAKE3 hex digest of the current records.
    pub fn state_hash(&self) -> String {
        compute_hash(self.records.values())
    }
}
