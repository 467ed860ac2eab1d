//! Retry and wait utilities.
//!
//! Every remote call in this crate (inventory RPCs, cluster API calls,
//! container invocations) may fail transiently. This module provides the
//! retry mechanism used for those calls, plus the wait-for-predicate helper
//! behind all the "poll until X" loops in the installer and the controller.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{Error, Result};

/// Deadline used for waits bounded only by context cancellation.
///
/// A century, not `Duration::MAX`: the value still has to survive being
/// added to an `Instant`.
pub const WAIT_FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is exhausted when it is
/// non-zero. The returned error is the last one observed.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Execute an async operation up to `attempts` times with a fixed gap.
///
/// Used for local retries such as image writes and container invocations,
/// where exponential growth buys nothing. No sleep after the final attempt.
pub async fn retry_fixed<F, Fut, T>(
    attempts: u32,
    gap: Duration,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Retrying after error"
                );
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(gap).await;
                }
            }
        }
    }
    let last = last_err.expect("at least one attempt");
    Err(Error::ops(format!(
        "{} failed after {} attempts, last error: {}",
        operation_name, attempts, last
    )))
}

/// Poll `predicate` every `interval` until it returns true, the `timeout`
/// elapses, or `cancel` fires.
///
/// Long waits in the install flow (bootkube, control plane) pass
/// [`WAIT_FOREVER`] and are bounded only by cancellation.
pub async fn wait_for_predicate<F, Fut>(
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::timeout("wait cancelled".to_string()));
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::timeout("timed out".to_string()));
            }
            _ = tokio::time::sleep(interval) => {
                if predicate().await {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn backoff_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: std::result::Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn backoff_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: std::result::Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: std::result::Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fixed_retry_reports_attempt_count() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_fixed(3, Duration::from_millis(1), "write image", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::ops("disk busy"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn predicate_wait_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_predicate(
            Duration::from_secs(5),
            Duration::from_millis(5),
            &cancel,
            || async { false },
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn predicate_wait_returns_on_success() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result = wait_for_predicate(
            Duration::from_secs(5),
            Duration::from_millis(1),
            &cancel,
            move || {
                let c = c.clone();
                async move { c.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
        )
        .await;
        assert!(result.is_ok());
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn predicate_wait_times_out() {
        let cancel = CancellationToken::new();
        let result = wait_for_predicate(
            Duration::from_millis(10),
            Duration::from_millis(2),
            &cancel,
            || async { false },
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
