//! Bounded position history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attributes::GeoPosition;

// ---------------------------------------------------------------------------
// TrailConfig
// ---------------------------------------------------------------------------

/// Configuration of per-entity trail history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    /// Maximum number of retained points. The oldest point is dropped when
    /// the buffer is full. `0` disables trail recording.
    pub capacity: usize,
    /// Skip a point identical in position to the most recent one.
    pub dedupe_consecutive: bool,
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            dedupe_consecutive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Trail
// ---------------------------------------------------------------------------

/// One recorded point of a trail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub position: GeoPosition,
    pub at: Option<DateTime<Utc>>,
}

/// Ring buffer of the most recent positions of one entity, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trail {
    points: VecDeque<TrailPoint>,
    config: TrailConfig,
}

impl Trail {
    pub fn new(config: TrailConfig) -> Self {
        Self {
            points: VecDeque::with_capacity(config.capacity.min(64)),
            config,
        }
    }

    /// Append a point, evicting the oldest when full.
    ///
    /// Returns `false` if the point was not recorded (trail disabled, or a
    /// consecutive duplicate with deduplication enabled).
    pub fn push(&mut self, point: TrailPoint) -> bool {
        if self.config.capacity == 0 {
            return false;
        }
        if self.config.dedupe_consecutive
            && self.points.back().is_some_and(|last| last.position == point.position)
        {
            return false;
        }
        while self.points.len() >= self.config.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
        true
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn latest(&self) -> Option<&TrailPoint> {
        self.points.back()
    }

    /// Points from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &TrailPoint> {
        self.points.iter()
    }

    /// Apply a new configuration, truncating from the oldest end if the
    /// capacity shrank.
    pub fn reconfigure(&mut self, config: TrailConfig) {
        self.config = config;
        while self.points.len() > config.capacity {
            self.points.pop_front();
        }
    }
}
