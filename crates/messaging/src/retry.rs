//! Bounded retry with exponential backoff and full jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::Result;

/// How long to wait between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// `initial * multiplier^n`, capped, then uniformly jittered in `[0, computed]`.
    Exponential {
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
    /// A constant sleep between attempts, no jitter. Kept for callers that
    /// predate the exponential policy.
    Fixed(Duration),
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(
            5,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(5),
        )
    }
}

impl RetryPolicy {
    pub fn exponential(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                initial_delay,
                multiplier,
                max_delay,
            },
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Upper bound of the wait after the `retry`-th failure (0-based), before jitter.
    pub fn ceiling(&self, retry: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial_delay,
                multiplier,
                max_delay,
            } => {
                let factor = multiplier.max(1.0).powi(retry.min(64) as i32);
                let secs = (initial_delay.as_secs_f64() * factor).min(max_delay.as_secs_f64());
                Duration::try_from_secs_f64(secs).unwrap_or(*max_delay)
            }
        }
    }

    /// Actual wait after the `retry`-th failure (0-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        match self.backoff {
            Backoff::Fixed(_) => ceiling,
            Backoff::Exponential { .. } => {
                let max_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rand::rng().random_range(0..=max_ms))
            }
        }
    }

    /// Returns true if another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.should_retry(attempts) => {
                    let delay = self.delay_for_attempt(attempts - 1);
                    tracing::warn!(
                        operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
