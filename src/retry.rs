//! Exponential backoff shared by every retry loop in the crate.
//!
//! The same [`BackoffPolicy`] drives three retry loops:
//!
//! * page uploads (`crate::pipeline::upload`): short delays, a few retries.
//! * whole-job retries (`crate::queue`): the delay before a failed job
//!   becomes claimable again.
//! * control-plane calls (`claim`/`ack` in `crate::pool` and
//!   `crate::worker`): transient store errors are retried by the caller.
//!
//! ```text
//! delay_for(n) = min(max_delay, base_delay × multiplier^n)
//! ```
//!
//! With a 500 ms base and multiplier 2 the wait sequence is
//! 500 ms → 1 s → 2 s; with a 5 s base it is 5 s → 10 s → 20 s.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// A named exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive retries. Default: 2.
    pub multiplier: u32,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Retries after the initial attempt (so `max_retries + 1` attempts total).
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        // Saturate instead of overflowing for large retry counts.
        let factor = self.multiplier.max(1).checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Outcome of [`retry_with_backoff`] when every attempt failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Error returned by the final attempt.
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `label` only feeds the retry log line. Retries are not attempted when
/// `should_retry` returns `false` for an error.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    should_retry: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.max_retries || !should_retry(&e) {
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last_error: e,
                    });
                }
                let backoff = policy.delay_for(attempt);
                warn!(
                    "{}: attempt {} failed ({}), retry {}/{} after {}ms",
                    label,
                    attempt + 1,
                    e,
                    attempt + 1,
                    policy.max_retries,
                    backoff.as_millis()
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_from_base() {
        let p = BackoffPolicy::new(Duration::from_secs(5), 3).with_max_delay(Duration::from_secs(300));
        assert_eq!(p.delay_for(0), Duration::from_secs(5));
        assert_eq!(p.delay_for(1), Duration::from_secs(10));
        assert_eq!(p.delay_for(2), Duration::from_secs(20));
    }

    #[test]
    fn delays_are_capped() {
        let p = BackoffPolicy::new(Duration::from_secs(5), 10).with_max_delay(Duration::from_secs(12));
        assert_eq!(p.delay_for(1), Duration::from_secs(10));
        assert_eq!(p.delay_for(2), Duration::from_secs(12));
        assert_eq!(p.delay_for(40), Duration::from_secs(12));
    }

    #[test]
    fn max_attempts_counts_first_try() {
        assert_eq!(BackoffPolicy::new(Duration::ZERO, 3).max_attempts(), 4);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(Duration::from_millis(1), 3);
        let out: Result<u32, RetryExhausted<String>> =
            retry_with_backoff(&policy, "test", |_| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(format!("transient {n}"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(Duration::from_millis(1), 2);
        let out: Result<(), _> = retry_with_backoff(&policy, "test", |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("down".to_string())
        })
        .await;
        let err = out.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        // No sleep is reached, so no runtime timer is needed.
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(Duration::from_secs(60), 5);
        let out: Result<(), _> =
            tokio_test::block_on(retry_with_backoff(&policy, "test", |_| false, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("bad request".to_string())
            }));
        assert_eq!(out.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
