//! Runtime configuration.
//!
//! Values come from an optional YAML file; CLI flags override individual fields
//! afterwards. Every field has a default so an empty or missing
//! file yields a working configuration for the Charleston news section.
//!
//! ```yaml
//! listing_url: https://www.milb.com/charleston/news
//! min_request_interval_ms: 1000
//! retry:
//!   max_attempts: 3
//!   base_delay_ms: 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, instrument};

use crate::error::ConfigError;
use crate::fetcher::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Page listing the article links.
    pub listing_url: String,
    /// Base that relative article links are resolved against.
    pub site_base_url: String,
    /// Path fragment every article link contains.
    pub article_path_fragment: String,
    pub user_agent: String,
    pub request_timeout_ms: u64,
    /// Hard floor between two consecutive requests to the source.
    pub min_request_interval_ms: u64,
    pub retry: RetrySettings,
    /// Articles with fewer body characters are rejected.
    pub min_content_chars: usize,
    /// Case-insensitive regexes; a title matching any of them is an error page.
    pub error_title_patterns: Vec<String>,
    /// Upper bound on links processed per run.
    pub max_articles: Option<usize>,
    /// A `running` ledger row whose heartbeat is older than this belongs to a dead process.
    pub run_lease_secs: u64,
    pub database_path: PathBuf,
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listing_url: "https://www.milb.com/charleston/news".to_string(),
            site_base_url: "https://www.milb.com".to_string(),
            article_path_fragment: "/charleston/news/".to_string(),
            user_agent: format!("charleston_news/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_ms: 10_000,
            min_request_interval_ms: 1_000,
            retry: RetrySettings::default(),
            min_content_chars: 50,
            error_title_patterns: vec![
                r"\bpage not found\b".to_string(),
                r"^\s*404\b".to_string(),
                r"\baccess denied\b".to_string(),
                r"^\s*error\b".to_string(),
            ],
            max_articles: None,
            run_lease_secs: 120,
            database_path: PathBuf::from("data/charleston_news.db"),
            backup_dir: PathBuf::from("data/articles"),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

impl Config {
    /// Load from `path` when given, otherwise use the defaults.
    #[instrument(level = "info")]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
                info!(path = %path.display(), "Loaded configuration file");
                config
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if url::Url::parse(&self.listing_url).is_err() {
            return Err(invalid("listing_url", "not an absolute URL"));
        }
        if url::Url::parse(&self.site_base_url).is_err() {
            return Err(invalid("site_base_url", "not an absolute URL"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier", "must be >= 1.0"));
        }
        if !(1..=MAX_LEASE_SECS).contains(&self.run_lease_secs) {
            return Err(invalid("run_lease_secs", "must be between 1 second and 1 day"));
        }
        for pattern in &self.error_title_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(invalid("error_title_patterns", &e.to_string()));
            }
        }
        Ok(())
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn run_lease(&self) -> Duration {
        Duration::from_secs(self.run_lease_secs)
    }

    /// How often a live run refreshes its lease.
    pub fn heartbeat_interval(&self) -> Duration {
        self.run_lease() / 4
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: Duration::from_millis(self.retry.jitter_ms),
        }
    }
}

const MAX_LEASE_SECS: u64 = 86_400;

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}
