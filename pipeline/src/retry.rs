//! Bounded retry with linear backoff for a single unit of work.

use crate::metrics_defs::SUBMIT_ATTEMPTS;
use serde::Deserialize;
use shared::histogram;
use std::fmt::Display;
use std::future::Future;
use tokio::time::{Duration, sleep};

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_BACKOFF_BASE_MS: u64 = 200;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. The operation runs at most `max_retries + 1` times.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the linear backoff; retry `n` sleeps `n * backoff_base_ms`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            // Rounded up so a non-zero base never becomes a zero backoff
            backoff_base_ms: u64::try_from(backoff_base.as_nanos().div_ceil(1_000_000))
                .unwrap_or(u64::MAX),
        }
    }

    /// Sleep before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(attempt as u64))
    }
}

/// Calls `op` until it succeeds or `policy.max_retries` retries have failed.
///
/// Every retry is a fresh call to `op`, so the operation must be safe to invoke again. The last
/// error is returned unchanged once the retries are exhausted.
pub async fn submit_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    submit_with_retry_if(policy, operation, |_: &E| true, op).await
}

/// Like [`submit_with_retry`], but returns the first error for which `retryable` is false
/// without sleeping or calling `op` again.
pub async fn submit_with_retry_if<T, E, R, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    retryable: R,
    mut op: F,
) -> Result<T, E>
where
    R: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                histogram!(SUBMIT_ATTEMPTS, "operation" => operation).record((attempt + 1) as f64);
                tracing::debug!(operation, attempts = attempt + 1, "Submission succeeded");
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                tracing::warn!(
                    operation,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "Submission failed"
                );
                if !retryable(&e) {
                    histogram!(SUBMIT_ATTEMPTS, "operation" => operation).record(attempt as f64);
                    tracing::warn!(operation, "Error is not retryable, giving up");
                    return Err(e);
                }
                if attempt > policy.max_retries {
                    histogram!(SUBMIT_ATTEMPTS, "operation" => operation).record(attempt as f64);
                    return Err(e);
                }
                sleep(policy.backoff(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_policy_deserialization_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_retries: 5").unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff_base_ms, 200);
        assert_eq!(policy.backoff(3), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let policy = RetryPolicy::new(2, Duration::from_millis(200));
        let start = Instant::now();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let result: Result<&str, String> = submit_with_retry(&policy, "test", || {
            let calls = calls.clone();
            async move {
                let mut calls = calls.lock().unwrap();
                calls.push(start.elapsed());
                if calls.len() <= 2 {
                    Err("throttled".to_string())
                } else {
                    Ok("started")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("started"));
        // Sleeps of 0.2s and 0.4s between the three calls
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let gaps = [calls[1] - calls[0], calls[2] - calls[1]];
        for (gap, expected) in gaps.iter().zip([200u64, 400]) {
            assert!(*gap >= Duration::from_millis(expected));
            assert!(*gap < Duration::from_millis(expected + 5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        let mut calls = 0;

        let result: Result<(), String> = submit_with_retry(&policy, "test", || {
            calls += 1;
            let attempt = calls;
            async move { Err(format!("failure {attempt}")) }
        })
        .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let mut calls = 0;

        let result: Result<(), &str> =
            submit_with_retry_if(&policy, "test", |e: &&str| *e != "fatal", || {
                calls += 1;
                let error = if calls == 1 { "throttled" } else { "fatal" };
                async move { Err(error) }
            })
            .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_backoff_base_conversion() {
        assert_eq!(
            RetryPolicy::new(1, Duration::from_millis(250)).backoff_base_ms,
            250
        );
        assert_eq!(
            RetryPolicy::new(1, Duration::from_micros(900)).backoff_base_ms,
            1
        );
        assert_eq!(RetryPolicy::new(1, Duration::ZERO).backoff_base_ms, 0);
        assert_eq!(RetryPolicy::new(1, Duration::MAX).backoff_base_ms, u64::MAX);
        assert_eq!(
            RetryPolicy::new(1, Duration::MAX).backoff(2),
            Duration::from_millis(u64::MAX)
        );
    }

    #[tokio::test]
    async fn test_zero_retries_calls_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100));
        let mut calls = 0;

        let result: Result<(), &str> = submit_with_retry(&policy, "test", || {
            calls += 1;
            async { Err("nope") }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
