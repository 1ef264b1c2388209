//! Rate-limited, retrying page fetcher for the source site.
//!
//! [`PageSource`] is the seam the orchestrator depends on; [`HttpFetcher`] is the
//! production implementation over `reqwest`. Every attempt, retries included, passes
//! through the [`MinIntervalLimiter`] and is counted in [`PageSource::requests_made`].

mod rate_limit;
mod retry;

pub use rate_limit::MinIntervalLimiter;
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use reqwest::Client;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::FetchError;

/// Something that can return the raw body of a page on the source site.
pub trait PageSource: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;

    /// Number of request attempts issued so far, successful or not.
    fn requests_made(&self) -> u64 {
        0
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
    limiter: MinIntervalLimiter,
    policy: RetryPolicy,
    attempts: AtomicU64,
}

impl HttpFetcher {
    pub fn new(client: Client, limiter: MinIntervalLimiter, policy: RetryPolicy) -> Self {
        Self {
            client,
            limiter,
            policy,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::new(
            client,
            MinIntervalLimiter::new(config.min_request_interval()),
            config.retry_policy(),
        ))
    }

    async fn attempt(&self, url: &str, attempt: u32) -> Result<String, FetchError> {
        self.limiter.acquire().await;
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let t0 = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, attempt, status = status.as_u16(), "Source returned error status");
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        debug!(
            url,
            attempt,
            bytes = body.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetched page"
        );
        Ok(body)
    }
}

impl PageSource for HttpFetcher {
    #[instrument(level = "info", skip(self))]
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.policy
            .run(url, |attempt| self.attempt(url, attempt))
            .await
    }

    fn requests_made(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}
