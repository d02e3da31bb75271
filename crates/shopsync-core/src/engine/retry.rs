//! Bounded exponential backoff for transient external failures

use std::future::Future;
use std::time::Duration;

use crate::external::ExternalError;

/// Retry budget for calls to the external resource.
///
/// The delay before retry `n` (1-based) is `base_delay * 2^(n-1)`, capped
/// at `max_delay`. With the defaults (5 attempts, 200ms base, 5s cap) the
/// waits are 200ms, 400ms, 800ms, 1.6s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting; for tests
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based); zero for `retry == 0`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let multiplier = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `call` until it succeeds, fails permanently, or the budget runs out.
///
/// Each attempt is bounded by `timeout`; an elapsed attempt counts as a
/// transient failure. `on_attempt` runs before every attempt with its
/// 1-based number, so callers can persist progress.
pub async fn with_retry<T, F, Fut, A, AFut>(
    policy: &RetryPolicy,
    timeout: Duration,
    mut on_attempt: A,
    mut call: F,
) -> Result<T, ExternalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
    A: FnMut(u32) -> AFut,
    AFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        on_attempt(attempt).await;

        let error = match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => error,
            Err(_) => ExternalError::transient(format!(
                "external call timed out after {}ms",
                timeout.as_millis()
            )),
        };

        if !error.is_transient() || attempt >= max_attempts {
            return Err(error);
        }

        let delay = policy.delay_for_retry(attempt);
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Transient external failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_retry(6), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(
            &RetryPolicy::immediate(5),
            Duration::from_secs(1),
            |_| async {},
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExternalError::transient("flaky"))
                } else {
                    Ok(7)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry(
            &RetryPolicy::immediate(5),
            Duration::from_secs(1),
            |_| async {},
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::permanent("rejected"))
            },
        )
        .await;

        assert!(!result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_transient_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let attempts_seen = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            &RetryPolicy::immediate(3),
            Duration::from_secs(1),
            |attempt| {
                attempts_seen.store(attempt, Ordering::SeqCst);
                async {}
            },
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::transient("down"))
            },
        )
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(attempts_seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_as_transient() {
        let result: Result<(), _> = with_retry(
            &RetryPolicy::immediate(2),
            Duration::from_millis(50),
            |_| async {},
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await;

        let error = result.unwrap_err();
        assert!(error.is_transient());
        assert!(error.message.contains("timed out"));
    }
}
