//! Exponential reconnect backoff with jitter.
//!
//! Delay for attempt `n` is `min(initial * 2^n, max)` plus a uniformly random
//! jitter in `[0, jitter]`, so a fleet of dashboards reconnecting after a
//! server restart does not arrive in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::constants::{BACKOFF_JITTER, INITIAL_BACKOFF, MAX_BACKOFF};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay.
    pub initial: Duration,
    /// Cap on the exponential part.
    pub max: Duration,
    /// Upper bound of the random jitter added on top.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: INITIAL_BACKOFF,
            max: MAX_BACKOFF,
            jitter: BACKOFF_JITTER,
        }
    }
}

/// Reconnect attempt counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start at attempt zero.
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt, without jitter.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.policy.initial.saturating_mul(factor).min(self.policy.max)
    }

    /// Delay to wait before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        base + self.jitter()
    }

    /// Back to the initial delay (after a successful connect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.policy.jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}
