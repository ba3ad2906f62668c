//! Bounded-attempt retry decision with a table-driven backoff.

use cadence_core::config::SchedulerConfig;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Longest delay representable as a chrono `Duration`.
const MAX_DELAY_SECS: i64 = i64::MAX / 1_000;

/// Retry budget and backoff curve applied per occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed per occurrence, counting the first one.
    pub max_attempts: u32,
    /// Delay before retry N is `backoff_secs[N-1]`, clamped to the last entry.
    pub backoff_secs: Vec<u64>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_secs: Vec<u64>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_secs,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_attempts: u32, delay_secs: u64) -> Self {
        Self::new(max_attempts, vec![delay_secs])
    }

    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self::new(cfg.max_attempts, cfg.backoff_secs.clone())
    }

    /// `attempt_count` is the number of failed attempts already recorded,
    /// including the one that just failed.
    pub fn should_retry(attempt_count: u32, max_attempts: u32) -> bool {
        attempt_count < max_attempts
    }

    /// Delay before the retry that follows failed attempt `attempt_count`.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let idx = attempt_count.saturating_sub(1) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(0);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_DELAY_SECS))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_exhausted_at_max() {
        assert!(RetryPolicy::should_retry(1, 3));
        assert!(RetryPolicy::should_retry(2, 3));
        assert!(!RetryPolicy::should_retry(3, 3));
        assert!(!RetryPolicy::should_retry(1, 1));
    }

    #[test]
    fn backoff_follows_table_then_clamps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::seconds(60));
        assert_eq!(policy.delay_for(2), Duration::seconds(300));
        assert_eq!(policy.delay_for(3), Duration::seconds(900));
        assert_eq!(policy.delay_for(9), Duration::seconds(900));
    }

    #[test]
    fn empty_table_means_immediate_retry() {
        let policy = RetryPolicy::new(2, Vec::new());
        assert_eq!(policy.delay_for(1), Duration::zero());
    }

    #[test]
    fn zero_budget_is_raised_to_one_attempt() {
        assert_eq!(RetryPolicy::fixed(0, 5).max_attempts, 1);
    }
}
