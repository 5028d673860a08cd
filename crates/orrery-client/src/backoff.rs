//! Capped exponential reconnect backoff with jitter.
//!
//! Jitter comes from a PCG generator so a seeded policy yields the same
//! delay sequence on every run.

use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

/// Reconnect delay policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_ms: u64,
    /// Upper bound of any single delay (before jitter).
    pub max_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Fraction in `[0, 1]`: each delay is scaled by a factor drawn
    /// uniformly from `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    /// Consecutive failures tolerated before giving up. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
    /// Jitter seed. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: Some(10),
            seed: None,
        }
    }
}

/// Stateful delay generator for one run of consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    rng: Pcg64,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let rng = match policy.seed {
            Some(seed) => Pcg64::seed_from_u64(seed),
            None => Pcg64::from_entropy(),
        };
        Self {
            policy,
            attempt: 0,
            rng,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` delays
    /// have been handed out since the last [`reset`](Self::reset).
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
        {
            return None;
        }
        let exponent = self.attempt.min(63) as i32;
        self.attempt += 1;

        let base = (self.policy.initial_ms as f64 * self.policy.multiplier.max(1.0).powi(exponent))
            .min(self.policy.max_ms as f64);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            self.rng.gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Some(Duration::from_millis((base * factor).round() as u64))
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            max_attempts: Some(6),
            ..Default::default()
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = Backoff::new(BackoffPolicy {
            max_ms: 5_000,
            ..no_jitter()
        });
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000, 5_000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn unlimited_attempts_never_exhaust() {
        let mut backoff = Backoff::new(BackoffPolicy {
            max_attempts: None,
            ..no_jitter()
        });
        for _ in 0..200 {
            assert!(backoff.next_delay().is_some());
        }
    }

    #[test]
    fn seeded_jitter_is_reproducible_and_bounded() {
        let policy = BackoffPolicy {
            jitter: 0.5,
            seed: Some(7),
            max_attempts: Some(4),
            ..Default::default()
        };
        let a: Vec<Duration> = {
            let mut b = Backoff::new(policy.clone());
            std::iter::from_fn(|| b.next_delay()).collect()
        };
        let b: Vec<Duration> = {
            let mut b = Backoff::new(policy);
            std::iter::from_fn(|| b.next_delay()).collect()
        };
        assert_eq!(a, b);
        assert!(a[0] >= Duration::from_millis(500) && a[0] <= Duration::from_millis(1_500));
    }
}
