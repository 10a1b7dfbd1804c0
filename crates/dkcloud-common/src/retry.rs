//! Bounded retry for calls to the remote resource store.
//!
//! Only failures that classify themselves as transient (transport errors,
//! 5xx, 429) are retried. A definitive rejection is returned after the first
//! attempt, so callers can tell "the store said no" apart from "the store
//! never answered".
//!
//! # Example
//!
//! ```ignore
//! use dkcloud_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let server = retry_with_backoff(
//!     &RetryConfig::fixed(3, Duration::from_secs(2)),
//!     "get_server",
//!     || async { api.get(&id).await },
//! ).await?;
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Classification hook for errors passed through [`retry_with_backoff`].
pub trait Transient {
    /// Whether another attempt may succeed
    fn is_transient(&self) -> bool;
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = fixed delay)
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
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

    /// Fixed cadence: `attempts` tries, `delay` apart, no jitter
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// A single attempt, for requests that are not safe to repeat
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }
}

/// Why a retried operation ultimately failed
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed transiently
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// The last failure seen
        last: E,
    },
    /// The operation failed with a non-transient error
    Rejected(E),
}

impl<E> RetryError<E> {
    /// The underlying error, regardless of how retrying ended
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Rejected(e) => e,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempt(s): {last}")
            }
            RetryError::Rejected(e) => write!(f, "{e}"),
        }
    }
}

/// Execute an async operation, retrying transient failures.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display + Transient,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(RetryError::Rejected(e)),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }

                let wait = if config.jitter {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                } else {
                    delay
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, RetryError<TestError>> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig::fixed(5, Duration::from_secs(2));

        let result = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_max_attempts_at_fixed_cadence() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let started = tokio::time::Instant::now();

        let config = RetryConfig::fixed(3, Duration::from_secs(2));

        let result: Result<i32, _> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: TestError::Flaky
            })
        );
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // two sleeps between three attempts
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_definitive_failure_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, _> =
            retry_with_backoff(&RetryConfig::with_max_attempts(5), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                }
            })
            .await;

        assert_eq!(result, Err(RetryError::Rejected(TestError::Fatal)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_inner_returns_last_error() {
        let err = RetryError::Exhausted {
            attempts: 2,
            last: TestError::Flaky,
        };
        assert_eq!(err.to_string(), "gave up after 2 attempt(s): Flaky");
        assert_eq!(err.into_inner(), TestError::Flaky);
    }
}
