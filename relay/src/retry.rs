//! Explicit retry policy for the network steps of a session.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How often a fallible network step is attempted before giving up.
///
/// The default is fail-fast: a single attempt, no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly with each further attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn fail_fast() -> Self {
        Self::default()
    }

    /// Delay after the given failed attempt (1-based), saturating at [`Duration::MAX`].
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.checked_mul(attempt).unwrap_or(Duration::MAX)
    }

    /// Runs `op` until it succeeds or the attempts are exhausted, returning the last error.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        what,
                        attempt,
                        attempts,
                        error = %e,
                        ?delay,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn fail_fast_makes_a_single_attempt() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::fail_fast()
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;

        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let result: Result<u32, String> = policy
            .run("test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_grows_linearly_and_saturates() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(6));

        let huge = RetryPolicy {
            max_attempts: u32::MAX,
            backoff: Duration::MAX,
        };
        assert_eq!(huge.delay_after(1), Duration::MAX);
        assert_eq!(huge.delay_after(2), Duration::MAX);
        assert_eq!(huge.delay_after(u32::MAX), Duration::MAX);
    }
}
