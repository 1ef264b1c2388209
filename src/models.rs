//! Data models shared by the ingestion pipeline and its observers.
//!
//! An article moves through three explicit shapes:
//! - [`Candidate`]: what the extractor parsed from a page, unvalidated
//! - [`NewArticle`]: a candidate that passed validation and carries its [`ArticleKey`]
//! - [`Article`]: a persisted row, stamped with `created_at` by the persistence manager
//!
//! [`BackupRecord`] is the JSON projection of an [`Article`] written to the backup tree.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic identity of an article.
///
/// Derived from the normalized title and the source-reported date, never from a row id,
/// so the same article maps to the same key across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleKey(String);

impl ArticleKey {
    /// Compute the key for a title/date pair.
    ///
    /// The title is lowercased, trimmed and has whitespace runs collapsed, so casing or
    /// spacing differences between fetches do not produce a new key.
    pub fn derive(title: &str, date: Option<NaiveDate>) -> Self {
        let normalized = normalize_title(title);
        let date = date.map_or_else(|| "unknown".to_string(), |d| d.to_string());

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"\n");
        hasher.update(date.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a key read back from storage.
    ///
    /// Returns `None` unless the value is a 64-character lowercase hex digest, which also
    /// keeps arbitrary input from escaping the backup directory when used as a filename.
    pub fn parse(raw: &str) -> Option<Self> {
        let ok = raw.len() == 64
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        ok.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArticleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// An article as parsed from a page, before any quality or duplicate checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub title: String,
    pub subheadline: Option<String>,
    pub author: Option<String>,
    pub section: Option<String>,
    pub content: String,
    /// Source-reported publication date; `None` means "unknown".
    pub date: Option<NaiveDate>,
    pub image_urls: Vec<String>,
    pub source_url: String,
}

/// A candidate that passed validation and is ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub key: ArticleKey,
    pub title: String,
    pub subheadline: Option<String>,
    pub author: Option<String>,
    pub section: Option<String>,
    pub content: String,
    pub date: Option<NaiveDate>,
    pub image_urls: Vec<String>,
    pub source_url: String,
}

impl NewArticle {
    pub fn from_candidate(key: ArticleKey, candidate: Candidate) -> Self {
        Self {
            key,
            title: candidate.title,
            subheadline: candidate.subheadline,
            author: candidate.author,
            section: candidate.section,
            content: candidate.content,
            date: candidate.date,
            image_urls: candidate.image_urls,
            source_url: candidate.source_url,
        }
    }
}

/// A persisted article, as stored in the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub key: ArticleKey,
    pub title: String,
    pub subheadline: Option<String>,
    pub author: Option<String>,
    pub section: Option<String>,
    pub content: String,
    pub date: Option<NaiveDate>,
    pub image_urls: Vec<String>,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// JSON projection of a persisted [`Article`], one file per key in the backup tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub key: ArticleKey,
    pub title: String,
    pub subheadline: Option<String>,
    pub author: Option<String>,
    pub section: Option<String>,
    pub content: String,
    pub date: Option<NaiveDate>,
    pub image_urls: Vec<String>,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Article> for BackupRecord {
    fn from(article: &Article) -> Self {
        Self {
            key: article.key.clone(),
            title: article.title.clone(),
            subheadline: article.subheadline.clone(),
            author: article.author.clone(),
            section: article.section.clone(),
            content: article.content.clone(),
            date: article.date,
            image_urls: article.image_urls.clone(),
            source_url: article.source_url.clone(),
            created_at: article.created_at,
            updated_at: article.updated_at,
        }
    }
}

/// Short description of an article for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSummary {
    pub key: ArticleKey,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle phase of an ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted outcome of one ingestion run, as kept in the run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: u64,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

/// Pagination request used by the read API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

/// One page of results from the read API.
#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub pages: u32,
    pub items: Vec<T>,
}

impl<T> Paged<T> {
    pub fn new(request: PageRequest, total: u64, items: Vec<T>) -> Self {
        let pages = total.div_ceil(u64::from(request.per_page));
        Self {
            total,
            page: request.page,
            per_page: request.per_page,
            pages: u32::try_from(pages).unwrap_or(u32::MAX),
            items,
        }
    }
}
