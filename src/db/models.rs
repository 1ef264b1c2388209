use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::FromRow;

use crate::error::StoreError;
use crate::models::{Article, ArticleKey, ArticleSummary, Phase, RunSummary};

#[derive(Debug, FromRow)]
pub(crate) struct ArticleRow {
    pub key: String,
    pub title: String,
    pub subheadline: Option<String>,
    pub author: Option<String>,
    pub section: Option<String>,
    pub content: String,
    pub date: Option<String>,
    pub image_urls: String,
    pub source_url: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ArticleRow> for Article {
    type Error = StoreError;

    fn try_from(row: ArticleRow) -> Result<Self, Self::Error> {
        let key = parse_key(&row.key)?;
        let date = row
            .date
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
            .transpose()
            .map_err(|e| corrupt(&row.key, format!("date: {e}")))?;
        let image_urls: Vec<String> = serde_json::from_str(&row.image_urls)
            .map_err(|e| corrupt(&row.key, format!("image_urls: {e}")))?;

        Ok(Self {
            created_at: parse_timestamp(&row.key, &row.created_at)?,
            updated_at: parse_timestamp(&row.key, &row.updated_at)?,
            key,
            title: row.title,
            subheadline: row.subheadline,
            author: row.author,
            section: row.section,
            content: row.content,
            date,
            image_urls,
            source_url: row.source_url,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ArticleSummaryRow {
    pub key: String,
    pub title: String,
    pub created_at: String,
}

impl TryFrom<ArticleSummaryRow> for ArticleSummary {
    type Error = StoreError;

    fn try_from(row: ArticleSummaryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            key: parse_key(&row.key)?,
            created_at: parse_timestamp(&row.key, &row.created_at)?,
            title: row.title,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RunRow {
    pub id: i64,
    pub phase: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub total: i64,
    pub processed: i64,
    pub succeeded: i64,
    pub duplicates: i64,
    pub failed: i64,
    pub last_error: Option<String>,
    pub heartbeat_at: Option<String>,
}

impl RunRow {
    /// Still `running` but not refreshed since `stale_before` (a formatted timestamp).
    pub fn lease_expired(&self, stale_before: &str) -> bool {
        self.phase == Phase::Running.as_str()
            && self.heartbeat_at.as_deref().unwrap_or(&self.started_at) < stale_before
    }
}

impl TryFrom<RunRow> for RunSummary {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let label = format!("run {}", row.id);
        let phase = Phase::parse(&row.phase)
            .ok_or_else(|| corrupt(&label, format!("unknown phase {}", row.phase)))?;
        let finished_at = row
            .finished_at
            .as_deref()
            .map(|ts| parse_timestamp(&label, ts))
            .transpose()?;

        Ok(Self {
            run_id: u64::try_from(row.id).unwrap_or_default(),
            phase,
            started_at: parse_timestamp(&label, &row.started_at)?,
            finished_at,
            total: count(row.total),
            processed: count(row.processed),
            succeeded: count(row.succeeded),
            duplicates: count(row.duplicates),
            failed: count(row.failed),
            last_error: row.last_error,
        })
    }
}

/// Fixed-width UTC timestamps so string order matches time order in SQL.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(label: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(label, format!("timestamp {raw}: {e}")))
}

fn parse_key(raw: &str) -> Result<ArticleKey, StoreError> {
    ArticleKey::parse(raw).ok_or_else(|| corrupt(raw, "malformed key".to_string()))
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn corrupt(key: &str, message: String) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        message,
    }
}
