//! Display category lookup.
//!
//! Presentation code colors and groups entities by category. A publisher may
//! state the category in its payload; otherwise the [`CategoryTable`] decides
//! from the entity's name or identifier:
//!
//! 1. payload category, if present;
//! 2. exact match of the name, then of the identifier;
//! 3. longest prefix match of the name, then of the identifier;
//! 4. the table default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::EntityKey;

/// Injected name/prefix -> category table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryTable {
    /// Exact name or identifier -> category.
    pub exact: BTreeMap<String, String>,
    /// Name or identifier prefix -> category.
    pub prefixes: BTreeMap<String, String>,
    /// Category used when nothing matches.
    pub default: String,
}

impl Default for CategoryTable {
    fn default() -> Self {
        Self {
            exact: BTreeMap::new(),
            prefixes: BTreeMap::new(),
            default: "default".to_owned(),
        }
    }
}

impl CategoryTable {
    pub fn with_exact(mut self, name: impl Into<String>, category: impl Into<String>) -> Self {
        self.exact.insert(name.into(), category.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, category: impl Into<String>) -> Self {
        self.prefixes.insert(prefix.into(), category.into());
        self
    }

    /// Resolve the display category of an entity.
    pub fn resolve(&self, payload: Option<&str>, key: &EntityKey, name: Option<&str>) -> String {
        if let Some(category) = payload.filter(|c| !c.is_empty()) {
            return category.to_owned();
        }
        let candidates = name.into_iter().chain(std::iter::once(key.id.as_str()));
        for candidate in candidates.clone() {
            if let Some(category) = self.exact.get(candidate) {
                return category.clone();
            }
        }
        for candidate in candidates {
            if let Some(category) = self.longest_prefix(candidate) {
                return category.to_owned();
            }
        }
        self.default.clone()
    }

    fn longest_prefix(&self, candidate: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| candidate.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, category)| category.as_str())
    }
}
