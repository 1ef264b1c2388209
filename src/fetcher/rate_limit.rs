//! Minimum-interval rate limiting for requests to the source site.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

/// Enforces a hard floor between the starts of two consecutive requests.
///
/// This is not an average: every [`acquire`](Self::acquire) returns no earlier than
/// `interval` after the previous one returned.
#[derive(Debug)]
pub struct MinIntervalLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl MinIntervalLimiter {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until a request may be issued, then claim the slot.
    ///
    /// Returns the instant the slot was claimed at.
    pub async fn acquire(&self) -> Instant {
        // Held across the sleep so concurrent callers queue behind each other.
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            sleep_until(prev + self.interval).await;
        }
        let now = Instant::now();
        *last = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let limiter = MinIntervalLimiter::new(Duration::from_secs(5));
        let t0 = Instant::now();
        limiter.acquire().await;
        assert!(t0.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_consecutive_acquires_respect_floor() {
        let floor = Duration::from_millis(40);
        let limiter = MinIntervalLimiter::new(floor);
        let mut stamps = Vec::new();
        for _ in 0..5 {
            stamps.push(limiter.acquire().await);
        }
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= floor);
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let floor = Duration::from_millis(30);
        let limiter = Arc::new(MinIntervalLimiter::new(floor));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.unwrap());
        }
        stamps.sort();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= floor);
        }
    }
}
