//! The entity state store.
//!
//! [`EntityStateStore`] maps [`EntityKey`]s to [`EntityRecord`]s. Its merge
//! policy is a full-snapshot replace: every inbound snapshot carries the
//! entity's complete state, so applying one twice leaves the attributes
//! unchanged and only the trail grows.
//!
//! Records are never removed implicitly. Publishers send no removal message;
//! callers decide when an entity is gone (see [`EntityStateStore::stale_since`])
//! and call [`EntityStateStore::evict`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::attributes::EntitySnapshot;
use crate::category::CategoryTable;
use crate::identity::{EntityKey, EntityKind};
use crate::journal::{ChangeBatch, ChangeJournal, ChangeKind, StoreChange};
use crate::record::{EntityRecord, Footprint, StatusOutcome, TargetStatus};
use crate::trail::{Trail, TrailConfig, TrailPoint};
use crate::StateError;

/// Result of [`EntityStateStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Latest known state of every tracked entity.
#[derive(Debug, Clone)]
pub struct EntityStateStore {
    pub(crate) records: BTreeMap<EntityKey, EntityRecord>,
    pub(crate) trail_config: TrailConfig,
    pub(crate) categories: CategoryTable,
    pub(crate) journal: ChangeJournal,
    /// Sequence number of the most recent mutation.
    pub(crate) seq: u64,
}

impl EntityStateStore {
    pub fn new(trail_config: TrailConfig, categories: CategoryTable) -> Self {
        Self {
            records: BTreeMap::new(),
            trail_config,
            categories,
            journal: ChangeJournal::new(),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    // -- mutation ------------------------------------------------------------

    /// Apply one entity snapshot.
    ///
    /// A missing record is created (the only creation path); an existing one
    /// has its attributes replaced in place, category and footprint
    /// re-derived, and the new position appended to its trail. A target's
    /// status is never touched by a location snapshot.
    pub fn upsert(&mut self, snapshot: EntitySnapshot) -> UpsertOutcome {
        let seq = self.next_seq();
        let EntitySnapshot { key, attributes } = snapshot;
        let category = self.categories.resolve(
            attributes.category.as_deref(),
            &key,
            attributes.name.as_deref(),
        );
        let footprint = Footprint::derive(&attributes);
        let point = TrailPoint {
            position: attributes.position,
            at: attributes.observed_at,
        };

        let outcome = match self.records.get_mut(&key) {
            Some(record) => {
                record.attributes = attributes;
                record.category = category;
                record.footprint = footprint;
                record.trail.push(point);
                record.last_seq = seq;
                record.sightings += 1;
                UpsertOutcome::Updated
            }
            None => {
                let mut trail = Trail::new(self.trail_config);
                trail.push(point);
                let status = (key.kind == EntityKind::Target).then_some(TargetStatus::Started);
                tracing::debug!(entity = %key, category = %category, "tracking new entity");
                self.records.insert(
                    key.clone(),
                    EntityRecord {
                        key: key.clone(),
                        attributes,
                        category,
                        trail,
                        footprint,
                        status,
                        status_actor: None,
                        status_at: None,
                        first_seq: seq,
                        last_seq: seq,
                        sightings: 1,
                    },
                );
                UpsertOutcome::Created
            }
        };

        let kind = match outcome {
            UpsertOutcome::Created => ChangeKind::Added,
            UpsertOutcome::Updated => ChangeKind::Updated,
        };
        self.journal.record(StoreChange { seq, key, kind });
        outcome
    }

    /// Advance the status of an existing target.
    ///
    /// # Errors
    ///
    /// [`StateError::UnknownIdentity`] if no record exists for `key` (no
    /// record is created), [`StateError::NoStatus`] if `key` is not a target.
    pub fn set_status(
        &mut self,
        key: &EntityKey,
        status: TargetStatus,
        actor: Option<String>,
        at: Option<DateTime<Utc>>,
    ) -> Result<StatusOutcome, StateError> {
        if key.kind != EntityKind::Target {
            return Err(StateError::NoStatus { key: key.clone() });
        }
        let Some(record) = self.records.get(key) else {
            return Err(StateError::UnknownIdentity { key: key.clone() });
        };
        let from = record.status;
        if from.is_some_and(|current| current >= status) {
            return Ok(StatusOutcome::Unchanged);
        }

        let seq = self.next_seq();
        if let Some(record) = self.records.get_mut(key) {
            record.status = Some(status);
            record.status_actor = actor;
            record.status_at = at;
            record.last_seq = seq;
        }
        self.journal.record(StoreChange {
            seq,
            key: key.clone(),
            kind: ChangeKind::StatusChanged { from, to: status },
        });
        Ok(StatusOutcome::Advanced { from, to: status })
    }

    /// Remove a record and everything derived from it.
    pub fn evict(&mut self, key: &EntityKey) -> Option<EntityRecord> {
        let record = self.records.remove(key)?;
        let seq = self.next_seq();
        self.journal.record(StoreChange {
            seq,
            key: key.clone(),
            kind: ChangeKind::Evicted,
        });
        Some(record)
    }

    /// Change trail configuration, truncating existing trails if needed.
    pub fn set_trail_config(&mut self, config: TrailConfig) {
        self.trail_config = config;
        for record in self.records.values_mut() {
            record.trail.reconfigure(config);
        }
    }

    // -- queries -------------------------------------------------------------

    pub fn get(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.records.contains_key(key)
    }

    /// Every record, ordered by key.
    pub fn all(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Records of one kind, ordered by identifier.
    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &EntityRecord> {
        self.records.values().filter(move |r| r.key.kind == kind)
    }

    /// Keys of records whose latest snapshot describes an instant before
    /// `cutoff`. Records without a known instant are not reported.
    pub fn stale_since(&self, cutoff: DateTime<Utc>) -> Vec<EntityKey> {
        self.records
            .values()
            .filter(|r| r.last_observed().is_some_and(|t| t < cutoff))
            .map(|r| r.key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence number of the most recent mutation (0 if none).
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    pub fn trail_config(&self) -> TrailConfig {
        self.trail_config
    }

    // -- journal -------------------------------------------------------------

    pub fn journal(&self) -> &ChangeJournal {
        &self.journal
    }

    /// Bound the change journal; see [`ChangeJournal::set_capacity`].
    pub fn set_journal_capacity(&mut self, capacity: usize) {
        self.journal.set_capacity(capacity);
    }

    pub fn with_journal_capacity(mut self, capacity: usize) -> Self {
        self.set_journal_capacity(capacity);
        self
    }

    /// Take every change recorded since the last drain.
    pub fn drain_changes(&mut self) -> ChangeBatch {
        self.journal.drain()
    }
}

impl Default for EntityStateStore {
    fn default() -> Self {
        Self::new(TrailConfig::default(), CategoryTable::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
