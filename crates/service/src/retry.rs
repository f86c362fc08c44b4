//! Opt-in retry for throttled store calls.
//!
//! The map itself never retries; a policy is only consulted when the caller
//! enables one. Only [`StoreError::Throttled`] is considered retryable.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::disabled() }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_max: Duration, enabled: bool) -> Self {
        Self { max_attempts, backoff_base, backoff_max, enabled }
    }

    pub fn disabled() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, false)
    }

    pub fn from_config(cfg: &configs::RetryConfig) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_max_ms),
            cfg.enabled,
        )
    }

    pub fn is_enabled(&self) -> bool { self.enabled }

    pub fn max_attempts(&self) -> u32 {
        if self.enabled { self.max_attempts.max(1) } else { 1 }
    }

    /// Exponential backoff for the given retry number (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if !self.enabled || attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(attempt - 1);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    pub fn should_retry(&self, attempt: u32, error: &StoreError) -> bool {
        if !self.enabled {
            return false;
        }
        if attempt >= self.max_attempts() {
            debug!("Max retry attempts ({}) reached", self.max_attempts);
            return false;
        }
        error.is_retryable()
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are exhausted.
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                attempt += 1;
                if !policy.should_retry(attempt, &error) {
                    return Err(error);
                }
                let wait = policy.backoff(attempt);
                warn!(attempt, ?wait, %error, "store call throttled, retrying");
                sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn enabled(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4), true)
    }

    #[tokio::test]
    async fn succeeds_after_throttling() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result = retry_with_policy(&enabled(3), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Throttled("slow down".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<(), _> = retry_with_policy(&enabled(2), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Throttled("always".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Throttled(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_throttling_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<(), _> = retry_with_policy(&enabled(5), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("connection reset".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_policy_runs_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let _: Result<(), _> = retry_with_policy(&RetryPolicy::disabled(), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Throttled("x".into()))
            }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_section_of_config_file_enables_retries() {
        let mut cfg = configs::parse("[retry]\nenabled = true\nmax_attempts = 4\nbackoff_base_ms = 1\nbackoff_max_ms = 2\n")
            .unwrap();
        cfg.normalize_and_validate().unwrap();
        let policy = RetryPolicy::from_config(&cfg.retry);
        assert!(policy.is_enabled());
        assert_eq!(policy.max_attempts(), 4);

        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result = retry_with_policy(&policy, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(StoreError::Throttled("slow down".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(result, Ok(()));
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        let defaults = configs::parse("").unwrap();
        assert!(!RetryPolicy::from_config(&defaults.retry).is_enabled());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350), true);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(RetryPolicy::disabled().backoff(3), Duration::ZERO);
    }
}
