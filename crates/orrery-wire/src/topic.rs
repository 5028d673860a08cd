//! Topic namespace and wildcard patterns.
//!
//! Topics are dot-segmented routing keys of the form
//! `<prefix>.<app>.<topic...>`. A [`TopicPattern`] may use `*` to match
//! exactly one segment and `#` to match zero or more segments, following the
//! usual topic-exchange conventions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::WireError;

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// The namespace prefix shared by every topic of one testbed run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    /// Validate and wrap a namespace prefix.
    ///
    /// The prefix may itself contain dots, but no empty segments and no
    /// wildcard characters.
    pub fn new(prefix: impl Into<String>) -> Result<Self, WireError> {
        let prefix = prefix.into();
        let reason = if prefix.is_empty() {
            Some("must not be empty")
        } else if prefix.split('.').any(str::is_empty) {
            Some("must not contain empty segments")
        } else if prefix.contains(['*', '#']) {
            Some("must not contain wildcards")
        } else if prefix.chars().any(char::is_whitespace) {
            Some("must not contain whitespace")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(WireError::InvalidNamespace { prefix, reason }),
            None => Ok(Self(prefix)),
        }
    }

    /// The raw prefix string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The multi-level wildcard covering every topic of this namespace.
    pub fn wildcard(&self) -> TopicPattern {
        TopicPattern(format!("{}.#", self.0))
    }

    /// Build the routing key `<prefix>.<app>.<topic>`.
    pub fn routing_key(&self, app: &str, topic: &str) -> String {
        format!("{}.{app}.{topic}", self.0)
    }

    /// Strip the namespace prefix, returning the remaining routing key.
    ///
    /// Returns `None` for topics outside the namespace and for the bare
    /// prefix itself.
    pub fn strip<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|rest| !rest.is_empty())
    }
}

impl TryFrom<String> for Namespace {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TopicPattern
// ---------------------------------------------------------------------------

/// A subscription pattern with `*` / `#` wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPattern(String);

impl TopicPattern {
    /// Wrap a pattern string verbatim.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// The raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `topic` is covered by this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let pattern: Vec<&str> = self.0.split('.').collect();
        let topic: Vec<&str> = topic.split('.').collect();
        match_segments(&pattern, &topic)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn match_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match (pattern.split_first(), topic.split_first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some((&"#", rest)), _) => {
            match_segments(rest, topic)
                || (!topic.is_empty() && match_segments(pattern, &topic[1..]))
        }
        (Some(_), None) => false,
        (Some((&"*", rest)), Some((_, topic_rest))) => match_segments(rest, topic_rest),
        (Some((segment, rest)), Some((head, topic_rest))) => {
            segment == head && match_segments(rest, topic_rest)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
