//! Orrery State -- incremental reconstruction of per-entity simulation state.
//!
//! Every participant of a run republishes its full state as it changes. The
//! [`EntityStateStore`](store::EntityStateStore) folds that stream of partial
//! snapshots into one [`EntityRecord`](record::EntityRecord) per identity:
//! the latest attributes, a bounded position trail, a derived footprint, a
//! display category and (for targets) a monotone status.
//!
//! Every mutation is appended to a bounded
//! [`ChangeJournal`](journal::ChangeJournal) that presentation code drains to
//! redraw incrementally.
//!
//! # Quick Start
//!
//! ```
//! use orrery_state::prelude::*;
//!
//! let mut store = EntityStateStore::new(TrailConfig::default(), CategoryTable::default());
//!
//! let snapshot = EntitySnapshot::new(
//!     EntityKey::satellite("A"),
//!     Attributes::at(GeoPosition::new(10.0, 20.0, 500_000.0)),
//! );
//! assert_eq!(store.upsert(snapshot.clone()), UpsertOutcome::Created);
//! assert_eq!(store.upsert(snapshot), UpsertOutcome::Updated);
//!
//! let record = store.get(&EntityKey::satellite("A")).unwrap();
//! assert_eq!(record.trail.len(), 2);
//! assert_eq!(store.drain_changes().len(), 2);
//! ```

#![deny(unsafe_code)]

pub mod attributes;
pub mod category;
pub mod identity;
pub mod journal;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod trail;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A status event referenced an entity that has never been sighted.
    #[error("no record for {key}; status events cannot create entities")]
    UnknownIdentity {
        key: identity::EntityKey,
    },

    /// A status event targeted an entity kind that carries no status.
    #[error("{key} does not carry a status")]
    NoStatus {
        key: identity::EntityKey,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::attributes::{Attributes, EntitySnapshot, GeoPosition, GroundLink, SensorGeometry};
    pub use crate::category::CategoryTable;
    pub use crate::identity::{EntityKey, EntityKind};
    pub use crate::journal::{ChangeBatch, ChangeJournal, ChangeKind, StoreChange};
    pub use crate::record::{EntityRecord, Footprint, StatusOutcome, TargetStatus};
    pub use crate::snapshot::StoreSnapshot;
    pub use crate::store::{EntityStateStore, UpsertOutcome};
    pub use crate::trail::{Trail, TrailConfig, TrailPoint};
    pub use crate::StateError;
}
