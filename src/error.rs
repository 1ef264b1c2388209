//! Error taxonomy for the ingestion pipeline.
//!
//! Per-item errors ([`FetchError`], [`ExtractionError`], [`PersistError`]) are absorbed by
//! the orchestrator and only show up in progress counters. [`BackupWriteError`] never
//! changes an item's outcome. [`RunError`] is the only kind that fails a run.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::ArticleKey;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Timeouts, connection failures, 5xx, 408 and 429 are transient. Any other 4xx is
    /// permanent and must not consume retry budget.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Transport { source, .. } => !(source.is_builder() || source.is_redirect()),
            Self::Exhausted { .. } => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("no title found in page")]
    MissingTitle,
    #[error("no article body found in page")]
    MissingContent,
    #[error("embedded article data is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row for {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },
    #[error("search query must not be empty")]
    EmptyQuery,
    #[error("backup directory unreadable: {0}")]
    BackupDir(#[source] std::io::Error),
}

/// The relational write for an article failed; nothing was recorded for its key.
#[derive(Debug, Error)]
#[error("failed to persist article {key}: {source}")]
pub struct PersistError {
    pub key: ArticleKey,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Error)]
pub enum BackupWriteError {
    #[error("failed to write backup {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode backup for {key}: {source}")]
    Encode {
        key: ArticleKey,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("an ingestion run is already active{}", run_suffix(.run_id))]
pub struct RunAlreadyActiveError {
    pub run_id: Option<u64>,
}

fn run_suffix(run_id: &Option<u64>) -> String {
    run_id.map(|id| format!(" (run {id})")).unwrap_or_default()
}

/// Why [`crate::pipeline::Pipeline::start_run`] could not start a run.
#[derive(Debug, Error)]
pub enum StartRunError {
    #[error(transparent)]
    AlreadyActive(#[from] RunAlreadyActiveError),
    #[error("could not open run ledger: {0}")]
    Store(#[from] StoreError),
}

/// Conditions that end a run in the `failed` phase.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("link discovery failed: {0}")]
    Discovery(#[source] FetchError),
    #[error("no article URLs found on {0}")]
    NoLinks(String),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("run task aborted: {0}")]
    Aborted(String),
}

/// Failures while assembling a pipeline from its configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid site base URL: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("invalid error-title pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}
