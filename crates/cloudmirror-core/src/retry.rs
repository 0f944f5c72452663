//! Backoff schedule for transient cloud failures
//!
//! Shared by the client decorator, which retries whole requests, and by
//! the engines, which retry uploads by re-reading their source.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::ports::CloudError;

/// Exponential backoff with uniform jitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt + 1` of a call that failed with
    /// `err`, or `None` when the call should not be retried
    pub fn next_delay(&self, attempt: u32, err: &CloudError) -> Option<Duration> {
        (err.is_transient() && attempt < self.max_retries).then(|| self.delay_for(attempt, err))
    }

    /// `base * 2^attempt` capped at `max_delay`, plus up to half of that
    /// again as jitter (still capped). A server-provided retry-after wins
    /// when it is longer.
    pub fn delay_for(&self, attempt: u32, err: &CloudError) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
        let delay = (backoff + Duration::from_millis(jitter_ms)).min(self.max_delay);

        match err {
            CloudError::RateLimited {
                retry_after: Some(after),
            } => delay.max(*after),
            _ => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let p = policy();
        let err = CloudError::Transient("x".into());
        for _ in 0..20 {
            let d0 = p.delay_for(0, &err);
            assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(150));
            let d2 = p.delay_for(2, &err);
            assert!(d2 >= Duration::from_millis(400) && d2 <= Duration::from_millis(600));
            let d10 = p.delay_for(10, &err);
            assert_eq!(d10, Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_retry_after_is_respected() {
        let p = policy();
        let err = CloudError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(p.delay_for(0, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = policy();
        let d = p.delay_for(u32::MAX, &CloudError::ServerError("503".into()));
        assert_eq!(d, Duration::from_millis(1000));
    }

    #[test]
    fn test_next_delay_only_for_transient_errors_within_budget() {
        let p = policy();
        let transient = CloudError::ServerError("503".into());
        assert!(p.next_delay(0, &transient).is_some());
        assert!(p.next_delay(4, &transient).is_some());
        assert!(p.next_delay(5, &transient).is_none());
        assert!(p
            .next_delay(0, &CloudError::PermissionDenied("no".into()))
            .is_none());
        assert!(RetryPolicy::none().next_delay(0, &transient).is_none());
    }
}
