//! Retry policy: eligibility decision and optional backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// A requeued job is eligible on the next cycle
    #[default]
    None,
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: base * retry
    Linear,
    /// Exponential backoff: base * 2^(retry - 1)
    Exponential,
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue as `Pending` with the incremented count.
    Requeue { retry_count: u32 },
    /// Retries are used up; fail terminally, count unchanged.
    Exhausted { retry_count: u32 },
}

/// Retry policy shared by live failure handling and stale-job recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of requeues per job (0 = never retry)
    pub max_retries: u32,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that retries immediately, up to `max_retries` times.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
        }
    }

    /// Whether a job that has already been requeued `retries_used` times may be
    /// requeued once more.
    ///
    /// `retries_used` is the stored count before this failure is recorded.
    /// Counting the failure first gives the equivalent test
    /// `retries_used + 1 <= max_retries`.
    pub fn should_retry(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }

    /// Decide what happens to a job whose attempt just failed.
    pub fn decide(&self, retries_used: u32) -> RetryDecision {
        if self.should_retry(retries_used) {
            RetryDecision::Requeue {
                retry_count: retries_used + 1,
            }
        } else {
            RetryDecision::Exhausted {
                retry_count: retries_used,
            }
        }
    }

    /// Delay before the `retry`-th retry (1-indexed) may be dispatched.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::None => return Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => match 1u32.checked_shl(retry - 1) {
                Some(factor) => self.base_delay.saturating_mul(factor),
                None => self.max_delay,
            },
        };

        delay.min(self.max_delay)
    }

    /// Earliest instant a requeued job may be dispatched again.
    pub fn ready_at(&self, requeued_at: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = self.delay_for_retry(retry_count);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| requeued_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
