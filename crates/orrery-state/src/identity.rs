//! Stable entity identity.
//!
//! Publishers only guarantee uniqueness of identifiers within one app, so a
//! satellite `"3"` and a ground station `"3"` are different entities. An
//! [`EntityKey`] pairs the identifier with its [`EntityKind`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of participant an identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Satellite,
    GroundStation,
    /// An observation target (fire, flood, survey site).
    Target,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Satellite => "satellite",
            EntityKind::GroundStation => "ground_station",
            EntityKind::Target => "target",
        })
    }
}

/// Stable key of one tracked entity across snapshots.
///
/// Ordering is by kind, then identifier, which gives the store a
/// deterministic iteration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn satellite(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Satellite, id)
    }

    pub fn ground_station(id: impl Into<String>) -> Self {
        Self::new(EntityKind::GroundStation, id)
    }

    pub fn target(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Target, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
