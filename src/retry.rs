//! Bounded retry with configurable backoff.
//!
//! Deployment calls can fail transiently (connection resets, resource
//! conflicts, webhook timeouts). [`retry_with_policy`] re-runs such an
//! operation according to a [`RetryPolicy`] and a caller-supplied
//! classifier, and never blocks longer than the policy allows.
//!
//! # Example
//!
//! ```ignore
//! use cluster_manager::retry::{retry_with_policy, RetryPolicy};
//!
//! let result = retry_with_policy(
//!     &RetryPolicy::default(),
//!     "helm_upgrade",
//!     |e: &Error| e.is_retryable(),
//!     || async { helm.run(&args).await },
//! ).await;
//! ```

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

/// Delay strategy between attempts
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),
    /// Exponential backoff, capped at `max`
    Exponential {
        /// Delay before the first retry
        initial: Duration,
        /// Upper bound for any single delay
        max: Duration,
        /// Growth factor per attempt
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based), without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exp = multiplier.powi(retry.saturating_sub(1) as i32);
                Duration::from_secs_f64((initial.as_secs_f64() * exp).min(max.as_secs_f64()))
            }
        }
    }
}

/// Retry policy for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempt ceiling including the first call (must be at least 1)
    pub max_attempts: u32,
    /// Delay strategy between attempts
    pub backoff: Backoff,
    /// Apply 0.5x-1.5x jitter to each delay
    pub jitter: bool,
    /// Wall-clock budget; no retry is started once it would be exceeded
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(30),
                multiplier: 2.0,
            },
            jitter: true,
            max_elapsed: Some(Duration::from_secs(600)),
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed delay and no jitter
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
            jitter: false,
            max_elapsed: None,
        }
    }

    /// Upper bound on total time spent sleeping between attempts
    pub fn max_total_delay(&self) -> Duration {
        let factor = if self.jitter { 1.5 } else { 1.0 };
        let sum: Duration = (1..self.max_attempts.max(1))
            .map(|r| self.backoff.delay_for(r).mul_f64(factor))
            .sum();
        match self.max_elapsed {
            Some(cap) => sum.min(cap),
            None => sum,
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff.delay_for(retry);
        if self.jitter {
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(base.as_secs_f64() * jitter)
        } else {
            base
        }
    }
}

/// Why a retried operation ultimately failed
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// The classifier rejected the error; no further attempts were made
    Permanent {
        /// Attempts made, including the failing one
        attempts: u32,
        /// The non-retryable error
        error: E,
    },
    /// Every allowed attempt failed with a retryable error
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// The last error observed
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The last underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Execute an async operation under a retry policy.
///
/// # Arguments
/// * `policy` - Attempt ceiling, backoff and time budget
/// * `operation_name` - Name for logging purposes
/// * `is_retryable` - Classifies an error as transient
/// * `operation` - The async operation to retry
pub async fn retry_with_policy<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: C,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> bool,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_retryable(&e) {
            return Err(RetryError::Permanent { attempts: attempt, error: e });
        }

        let delay = policy.delay_for(attempt);
        let over_budget = policy
            .max_elapsed
            .is_some_and(|budget| started.elapsed() + delay > budget);

        if attempt >= max_attempts || over_budget {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(RetryError::Exhausted { attempts: attempt, last: e });
        }

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn always(_: &&str) -> bool {
        true
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: Result<i32, RetryError<&str>> =
            retry_with_policy(&policy, "op", always, || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_once_failures_stop_before_ceiling() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = RetryPolicy::fixed(5, Duration::from_secs(2));
        let result: Result<i32, RetryError<&str>> = retry_with_policy(&policy, "op", always, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection reset")
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
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let started = Instant::now();
        let result: Result<i32, RetryError<&str>> = retry_with_policy(&policy, "op", always, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: "always fails"
            })
        );
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // two sleeps between three attempts
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<i32, RetryError<&str>> =
            retry_with_policy(&policy, "op", |_: &&str| false, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("invalid chart")
                }
            })
            .await;

        assert_eq!(
            result,
            Err(RetryError::Permanent {
                attempts: 1,
                error: "invalid chart"
            })
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_stops_retrying_early() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Backoff::Fixed(Duration::from_secs(10)),
            jitter: false,
            max_elapsed: Some(Duration::from_secs(25)),
        };
        let result: Result<(), RetryError<&str>> = retry_with_policy(&policy, "op", always, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("conflict")
            }
        })
        .await;

        assert_eq!(result.unwrap_err().attempts(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(10));
    }

    #[test]
    fn test_max_total_delay_is_bounded() {
        let policy = RetryPolicy::fixed(4, Duration::from_secs(5));
        assert_eq!(policy.max_total_delay(), Duration::from_secs(15));
        assert_eq!(
            RetryPolicy::fixed(1, Duration::from_secs(5)).max_total_delay(),
            Duration::ZERO
        );
    }
}
