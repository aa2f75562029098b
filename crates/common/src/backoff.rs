//! Capped exponential backoff shared by reconnection and dispatch retries.

use std::time::Duration;

/// `delay(attempt) = min(base * 2^attempt, cap)` while `attempt < max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Backoff with no ceiling other than `Duration::MAX`.
    #[must_use]
    pub const fn uncapped(base: Duration, max_attempts: u32) -> Self {
        Self::new(base, Duration::MAX, max_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.exponential(attempt))
    }

    /// The capped exponential curve, ignoring the attempt limit.
    pub fn exponential(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}
