//! Exponential backoff for storage writes.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::StorageResult;

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Jitter factor (0.0 to 1.0) added on top of each delay
    pub jitter: f64,
    /// Attempts including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay.mul_f64(1.0 + factor).min(self.max_delay)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds or attempts run out; returns the last error
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
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
    use crate::storage::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(5))
            .with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);

        let result = policy
            .run("flaky write", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Unavailable("down".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up() {
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2))
            .with_max_attempts(3);
        let calls = AtomicU32::new(0);

        let result: StorageResult<()> = policy
            .run("doomed write", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Unavailable("down".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
