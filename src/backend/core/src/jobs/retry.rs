//! Retry and backoff policy shared by step execution and notification delivery.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Linear increase in delay (initial + increment * retry)
    Linear { initial_ms: u64, increment_ms: u64 },
    /// Exponential increase in delay (initial * multiplier^retry), capped
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Linear {
                initial_ms,
                increment_ms,
            } => initial_ms.saturating_add(increment_ms.saturating_mul(retry as u64)),
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let delay = (*initial_ms as f64) * multiplier.powi(retry.min(64) as i32);
                delay.min(*max_ms as f64) as u64
            }
        };

        Duration::from_millis(ms)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// No delay at all. Useful in tests.
    pub fn immediate() -> Self {
        Self::Fixed { delay_ms: 0 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// How many times an operation is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with `max_attempts` and no delay between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::immediate(),
        }
    }

    /// Whether another attempt follows `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32, retryable: bool) -> bool {
        retryable && attempts_made < self.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_retry(attempt.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay_for_retry(0), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_retry(5), Duration::from_millis(250));
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffStrategy::default();
        assert_eq!(backoff.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_retry(4), Duration::from_secs(16));
        // Should cap at max
        assert_eq!(backoff.delay_for_retry(5), Duration::from_secs(30));
        assert_eq!(backoff.delay_for_retry(1_000), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = BackoffStrategy::Linear {
            initial_ms: 500,
            increment_ms: 300,
        };
        assert_eq!(backoff.delay_for_retry(0), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_retry(2), Duration::from_millis(1_100));
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1, true));
        assert!(policy.should_retry(2, true));
        assert!(!policy.should_retry(3, true)); // max attempts reached
        assert!(!policy.should_retry(1, false));
    }

    #[test]
    fn test_no_retry_policy() {
        assert!(!RetryPolicy::no_retry().should_retry(1, true));
    }

    #[test]
    fn test_delay_is_one_based() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(RetryPolicy::immediate(3).delay_for(2), Duration::ZERO);
    }
}
