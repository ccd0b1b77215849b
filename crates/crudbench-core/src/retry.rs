//! Bounded retries with deterministic exponential backoff.

use std::future::Future;
use std::time::Duration;

/// Default number of attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between attempts.
pub const DEFAULT_DELAY_FACTOR: Duration = Duration::from_millis(500);

/// Retry configuration applied per call.
///
/// Attempt `i` (starting at 0) that fails is followed by a sleep of
/// `delay_factor * 2^i`. The last failure is returned to the caller without
/// sleeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay_factor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_DELAY_FACTOR)
    }
}

impl RetryPolicy {
    /// Create a policy. `max_retries` is clamped to at least one attempt.
    pub fn new(max_retries: u32, delay_factor: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            delay_factor,
        }
    }

    /// Total number of attempts.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_factor(&self) -> Duration {
        self.delay_factor
    }

    /// Backoff after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.delay_factor
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `operation` until it succeeds or attempts are exhausted.
    pub async fn run<T, E, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.max_retries => {
                    tracing::error!(
                        operation = name,
                        attempts = self.max_retries,
                        error = %e,
                        "operation failed after all retries"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        operation = name,
                        attempt = attempt + 1,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<&str, String> = quick()
            .run("flaky", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(format!("failure {}", n))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_failure_after_exhaustion() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = quick()
            .run("broken", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {}", n))
            })
            .await;

        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_success_runs_once() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, String> = quick()
            .run("ok", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy::new(4, Duration::from_millis(500));
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
    }

    #[test]
    fn test_max_retries_clamped() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_retries(), 1);
        assert_eq!(RetryPolicy::default().max_retries(), DEFAULT_MAX_RETRIES);
    }
}
