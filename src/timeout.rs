//! Exponential backoff bounded by a total timeout budget.
//!
//! Each retry of a network operation asks for the next per-attempt timeout.
//! Timeouts double after every attempt up to `max_timeout`, and are never
//! larger than what remains of the total budget. Once the budget is spent,
//! [`ExponentialBackoffTimeout::next_timeout`] fails.

use std::time::{Duration, Instant};
use thiserror::Error;

/// Multiplier applied to the per-attempt timeout after every attempt.
const BACKOFF_COEFFICIENT: u32 = 2;

/// The total budget was exhausted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("operation timed out after {elapsed:?} (total budget {total:?})")]
pub struct TimeoutExhausted {
    pub elapsed: Duration,
    pub total: Duration,
}

/// Per-operation backoff state.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffTimeout {
    total_timeout: Duration,
    max_timeout: Duration,
    current: Duration,
    start: Instant,
}

impl ExponentialBackoffTimeout {
    /// Start a new budget now.
    pub fn new(total_timeout: Duration, initial_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            total_timeout,
            max_timeout,
            current: initial_timeout,
            start: Instant::now(),
        }
    }

    /// Next timeout after `timeout`, capped at `max_timeout`.
    pub fn backoff_timeout(timeout: Duration, max_timeout: Duration) -> Duration {
        timeout.saturating_mul(BACKOFF_COEFFICIENT).min(max_timeout)
    }

    /// Upper bound of the time spent over `attempts` tries, growing the running
    /// total by its own backoff until it reaches `max_timeout`.
    pub fn total_backoff_timeout(initial: Duration, max_timeout: Duration, attempts: u32) -> Duration {
        let mut total = initial;
        let mut i = 1;
        while i < attempts && total < max_timeout {
            total += Self::backoff_timeout(total, max_timeout);
            i += 1;
        }
        total
    }

    /// Timeout for the next attempt. Advances the backoff.
    pub fn next_timeout(&mut self) -> Result<Duration, TimeoutExhausted> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(TimeoutExhausted {
                elapsed: self.start.elapsed(),
                total: self.total_timeout,
            });
        }

        let prev = self.current;
        self.current = Self::backoff_timeout(self.current, self.max_timeout);
        Ok(prev.min(remaining))
    }

    /// Re-check a previously returned timeout against the remaining budget.
    pub fn verify_timeout(&self, timeout: Duration) -> Result<Duration, TimeoutExhausted> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(TimeoutExhausted {
                elapsed: self.start.elapsed(),
                total: self.total_timeout,
            });
        }
        Ok(timeout.min(remaining))
    }

    /// Time left in the total budget.
    pub fn remaining(&self) -> Duration {
        self.total_timeout.saturating_sub(self.start.elapsed())
    }

    /// Whether waiting `in_future` more would exceed the budget.
    pub fn check_timeout(&self, in_future: Duration) -> bool {
        self.start.elapsed() + in_future >= self.total_timeout
    }
}
