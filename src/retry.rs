//! Retry, reconnect and timeout policies.
//!
//! `ReconnectPolicy` drives the realtime client's fixed-delay reconnects.
//! `RetryPolicy`, [`retry_async`] and [`with_timeout`] bound the HTTP
//! collaborator's attempts and how long each one may take.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Bounded, constant-delay reconnect schedule.
///
/// The delay never grows between attempts, and one counter is shared by every
/// kind of unrequested close.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum reconnects after a close before giving up.
    pub limit: u32,
    /// Delay before each reconnect.
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Returns the 1-based attempt number and delay for the next reconnect, or
    /// `None` once `attempts_so_far` has reached the limit.
    pub fn next_attempt(&self, attempts_so_far: u32) -> Option<(u32, Duration)> {
        (attempts_so_far < self.limit).then(|| (attempts_so_far + 1, self.delay))
    }
}

/// Request retry policy with capped exponential backoff.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts including the first one. Zero is treated as one.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for backoff growth.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay applied after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        (1..attempt).fold(self.initial_backoff, |delay, _| {
            std::cmp::min(delay.saturating_mul(2), self.max_backoff)
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(100),
        }
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy runs out of attempts. `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_after(attempt);
        debug!(
            event = "request_retry",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Bounds one attempt; the caller maps `Elapsed` to its own error.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{retry_async, with_timeout, ReconnectPolicy, RetryPolicy};

    #[test]
    fn reconnect_policy_is_bounded_and_constant() {
        let policy = ReconnectPolicy {
            limit: 3,
            delay: Duration::from_millis(500),
        };

        assert_eq!(policy.next_attempt(0), Some((1, Duration::from_millis(500))));
        assert_eq!(policy.next_attempt(2), Some((3, Duration::from_millis(500))));
        assert_eq!(policy.next_attempt(3), None);
        assert_eq!(policy.next_attempt(7), None);
    }

    #[test]
    fn zero_limit_never_reconnects() {
        let policy = ReconnectPolicy {
            limit: 0,
            delay: Duration::from_millis(1),
        };
        assert_eq!(policy.next_attempt(0), None);
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(35),
        };

        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(35));
        assert_eq!(policy.delay_after(4), Duration::from_millis(35));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };

        let result = retry_async(
            &policy,
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("retry")
                    } else {
                        Ok("ok")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_when_retry_predicate_rejects() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        };

        let result: Result<(), &str> = retry_async(
            &policy,
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
            |_| false,
        )
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_timeout_reports_elapsed() {
        let result = with_timeout(
            Duration::from_millis(5),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert!(result.is_err());
    }
}
