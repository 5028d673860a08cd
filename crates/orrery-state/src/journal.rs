//! Change journal for incremental redraw.
//!
//! The [`ChangeJournal`] records every store mutation in application order.
//! Presentation code drains it after each batch of deliveries and touches
//! only the entities that changed.
//!
//! The journal is bounded. Once `capacity` changes are pending the oldest is
//! dropped and the next [`ChangeBatch`] reports `overflowed`: the drained
//! changes are then incomplete and the consumer must redraw everything.
//!
//! # Example
//!
//! ```
//! use orrery_state::identity::EntityKey;
//! use orrery_state::journal::{ChangeJournal, ChangeKind, StoreChange};
//!
//! let mut journal = ChangeJournal::with_capacity(2);
//! journal.record(StoreChange { seq: 1, key: EntityKey::satellite("A"), kind: ChangeKind::Added });
//! journal.record(StoreChange { seq: 2, key: EntityKey::satellite("A"), kind: ChangeKind::Updated });
//! assert_eq!(journal.changes_for(&EntityKey::satellite("A")).count(), 2);
//!
//! journal.record(StoreChange { seq: 3, key: EntityKey::satellite("B"), kind: ChangeKind::Added });
//! let batch = journal.drain();
//! assert!(batch.overflowed);
//! assert_eq!(batch.changes.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![2, 3]);
//! assert!(journal.is_empty());
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::identity::EntityKey;
use crate::record::TargetStatus;

/// Pending changes kept when no capacity is configured.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 4096;

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// First sighting; the record was created.
    Added,
    /// The attribute snapshot was replaced.
    Updated,
    /// A target status advanced.
    StatusChanged {
        from: Option<TargetStatus>,
        to: TargetStatus,
    },
    /// The record was explicitly evicted.
    Evicted,
}

/// A single recorded store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChange {
    /// Store sequence number of the mutation.
    pub seq: u64,
    pub key: EntityKey,
    pub kind: ChangeKind,
}

/// Everything drained from the journal in one go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub changes: Vec<StoreChange>,
    /// Changes were dropped since the previous drain; redraw everything.
    pub overflowed: bool,
}

impl ChangeBatch {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.overflowed
    }
}

/// Accumulates [`StoreChange`] entries until drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeJournal {
    changes: VecDeque<StoreChange>,
    capacity: usize,
    overflowed: bool,
}

impl Default for ChangeJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeJournal {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }

    /// A journal holding at most `capacity` pending changes. With 0 nothing
    /// is kept and every drain after a mutation reports an overflow.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            changes: VecDeque::new(),
            capacity,
            overflowed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the bound, dropping the oldest pending changes if needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.trim();
    }

    pub fn record(&mut self, change: StoreChange) {
        self.changes.push_back(change);
        self.trim();
    }

    fn trim(&mut self) {
        if self.changes.len() > self.capacity {
            let excess = self.changes.len() - self.capacity;
            self.changes.drain(..excess);
            if !self.overflowed {
                tracing::warn!(capacity = self.capacity, "change journal full; oldest changes dropped");
            }
            self.overflowed = true;
        }
    }

    /// Take every pending change, leaving the journal empty.
    pub fn drain(&mut self) -> ChangeBatch {
        ChangeBatch {
            changes: self.changes.drain(..).collect(),
            overflowed: std::mem::take(&mut self.overflowed),
        }
    }

    pub fn clear(&mut self) {
        self.changes.clear();
        self.overflowed = false;
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether changes were dropped since the last drain.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Pending changes in application order.
    pub fn all_changes(&self) -> impl Iterator<Item = &StoreChange> {
        self.changes.iter()
    }

    /// Changes that affected the given entity.
    pub fn changes_for<'a>(&'a self, key: &'a EntityKey) -> impl Iterator<Item = &'a StoreChange> {
        self.changes.iter().filter(move |c| &c.key == key)
    }
}
