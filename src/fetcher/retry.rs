//! Bounded retry with exponential backoff.
//!
//! The delay before attempt `n + 1` follows:
//! ```text
//! delay = min(base_delay * multiplier^(n-1), max_delay) + random_jitter(0..=jitter)
//! ```
//! Only errors for which [`FetchError::is_retriable`] holds are retried; anything else is
//! returned from the first attempt that produced it.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::{Rng, rng};
use tokio::time::sleep;
use tracing::{error, warn};

use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Backoff before the attempt following failed attempt `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            rng().random_range(0..=jitter_ms)
        };
        self.delay_for(attempt) + Duration::from_millis(extra)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Exhausting the budget yields
    /// [`FetchError::Exhausted`] wrapping the last underlying error.
    pub async fn run<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retriable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    error!(
                        url,
                        attempt,
                        max = self.max_attempts,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        error = %e,
                        "fetch exhausted retries"
                    );
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.jittered_delay_for(attempt);
                    warn!(
                        url,
                        attempt,
                        max = self.max_attempts,
                        ?delay,
                        error = %e,
                        "fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
