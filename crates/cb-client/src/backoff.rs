//! Exponential backoff with jitter for transient legacy-API failures.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Wraps a call with bounded retries on transient failure.
///
/// The policy is agnostic to the error taxonomy: the caller supplies
/// `should_retry`, so the legacy client can retry only rate-limit and
/// transport failures while surfacing validation errors immediately.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Non-jittered delay before retrying after the given 1-based attempt:
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        // Jitter adds up to 30% on top of the capped exponential component
        let jitter = rand::thread_rng().gen_range(0.0..0.3);
        self.base_delay_for_attempt(attempt).mul_f64(1.0 + jitter)
    }

    /// Call `op`; on failure, retry while `should_retry(error, attempt)`
    /// holds and attempts remain, sleeping the jittered exponential delay
    /// between attempts. The most recent error is returned unchanged.
    pub async fn execute<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E, u32) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_attempts || !should_retry(&error, attempt) {
                        return Err(error);
                    }
                    let delay = self.jittered_delay(attempt);
                    debug!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
