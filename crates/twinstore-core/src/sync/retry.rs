//! Bounded retry with exponential backoff for transient store failures.

use rand::Rng;
use std::time::Duration;
use twinstore_types::{RetryConfig, StoreError};

/// Fraction of the computed delay added as random jitter.
const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self { max_attempts: 1, base_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }

    /// Whether a failure on attempt number `attempt` (1-based) earns another try.
    pub fn should_retry(&self, err: &StoreError, attempt: u32) -> bool {
        err.is_transient() && attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based), without jitter:
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let calculated_ms = base_ms.saturating_mul(2_u64.pow(exponent));
        Duration::from_millis(calculated_ms).min(self.max_delay)
    }

    /// Backoff plus up to 10% random jitter, still capped at `max_delay`.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let jitter_ms = (delay.as_millis() as f64 * JITTER_RATIO) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryConfig { max_attempts: 4, base_delay_ms: 200, max_delay_ms: 1_000 }.into()
    }

    fn connection() -> StoreError {
        StoreError::Connection { store: "sqlite".to_string(), message: "refused".to_string() }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy();
        for _ in 0..100 {
            let delay = policy.backoff_with_jitter(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(220));
        }
        assert_eq!(policy.backoff_with_jitter(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_only_transient_errors_retry() {
        let policy = policy();
        let constraint =
            StoreError::Constraint { store: "sqlite".to_string(), message: "dup".to_string() };

        assert!(policy.should_retry(&connection(), 1));
        assert!(policy.should_retry(&connection(), 3));
        assert!(!policy.should_retry(&connection(), 4));
        assert!(!policy.should_retry(&constraint, 1));
    }

    #[test]
    fn test_none_never_retries() {
        assert!(!RetryPolicy::none().should_retry(&connection(), 1));
    }
}
