//! Bounded retry with exponential backoff, shared by every collector and
//! the geocoder.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether the failed unit of work may succeed if
/// attempted again.
pub trait Transient {
    /// `true` when a retry may succeed.
    fn is_transient(&self) -> bool;
}

/// Backoff schedule: `base * factor^attempt` for attempts after the first.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Growth factor between consecutive delays
    pub factor: u32,
}

impl RetryPolicy {
    /// Policy with the given attempts, base delay and factor.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, factor: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            factor: factor.max(1),
        }
    }

    /// Delay after failed attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(attempt))
    }
}

/// Run `task_fn` until it succeeds, fails permanently or runs out of attempts.
///
/// Only errors for which [`Transient::is_transient`] holds are retried.
pub async fn retry_with_backoff<F, Fut, T, E>(
    label: &str,
    policy: RetryPolicy,
    mut task_fn: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0;
    loop {
        match task_fn().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    label,
                    attempt + 1,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(
                        "{} failed after {} attempts: {}",
                        label,
                        policy.max_attempts,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    enum Flaky {
        #[error("busy")]
        Busy,
        #[error("gone")]
        Gone,
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Busy)
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_secs(5), 3)
    }

    #[test]
    fn test_delay_schedule() {
        let p = policy(3);
        assert_eq!(p.delay_for(0), Duration::from_secs(5));
        assert_eq!(p.delay_for(1), Duration::from_secs(15));
        assert_eq!(p.delay_for(2), Duration::from_secs(45));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, 0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_between_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let started = tokio::time::Instant::now();

        let result = retry_with_backoff("lookup", policy(3), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky::Busy)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(5 + 15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), Flaky> = retry_with_backoff("lookup", policy(5), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Flaky::Gone)
            }
        })
        .await;

        assert!(matches!(result, Err(Flaky::Gone)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
