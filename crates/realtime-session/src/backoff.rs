//! Exponential retry delay with a hard cap.

use std::time::Duration;

/// `delay(attempt) = min(base * 2^(attempt - 1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after `attempt` consecutive failures.
    /// Attempt 0 is treated as attempt 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 already saturates any realistic base, so clamp the shift.
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Retry counter shared by the supervisor-owned and transport-owned retry
/// paths, so the two can never compound into a faster effective rate.
#[derive(Debug, Clone)]
pub struct BackoffState {
    attempt: u32,
    policy: BackoffPolicy,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { attempt: 0, policy }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Count one more failed attempt and return the new total.
    pub fn record_failure(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// Delay to wait after the most recent failure.
    pub fn next_delay(&self) -> Duration {
        self.policy.delay(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
