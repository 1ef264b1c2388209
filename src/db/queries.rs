use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{ArticleRow, ArticleSummaryRow, RunRow, format_timestamp};
use crate::error::StoreError;
use crate::models::{
    Article, ArticleKey, ArticleSummary, NewArticle, PageRequest, Paged, Phase, RunSummary,
};

const ARTICLE_COLUMNS: &str = "key, title, subheadline, author, section, content, date, \
                               image_urls, source_url, created_at, updated_at";

// ========== Articles ==========

/// Insert or replace the row for `article.key` inside one transaction.
///
/// A re-ingested key keeps its original `created_at`; every other column is overwritten.
pub async fn upsert_article(
    pool: &SqlitePool,
    article: &NewArticle,
    now: DateTime<Utc>,
) -> Result<Article, StoreError> {
    let image_urls = serde_json::to_string(&article.image_urls).map_err(|e| StoreError::Corrupt {
        key: article.key.to_string(),
        message: format!("image_urls: {e}"),
    })?;
    let now_str = format_timestamp(now);

    let mut tx = pool.begin().await?;
    let row: ArticleRow = sqlx::query_as(&format!(
        r"
        INSERT INTO articles ({ARTICLE_COLUMNS})
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            title = excluded.title,
            subheadline = excluded.subheadline,
            author = excluded.author,
            section = excluded.section,
            content = excluded.content,
            date = excluded.date,
            image_urls = excluded.image_urls,
            source_url = excluded.source_url,
            updated_at = excluded.updated_at
        RETURNING {ARTICLE_COLUMNS}
        "
    ))
    .bind(article.key.as_str())
    .bind(&article.title)
    .bind(&article.subheadline)
    .bind(&article.author)
    .bind(&article.section)
    .bind(&article.content)
    .bind(article.date.map(|d| d.to_string()))
    .bind(&image_urls)
    .bind(&article.source_url)
    .bind(&now_str)
    .bind(&now_str)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    Article::try_from(row)
}

pub async fn get_article(pool: &SqlitePool, key: &str) -> Result<Option<Article>, StoreError> {
    let row: Option<ArticleRow> =
        sqlx::query_as(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE key = ?"))
            .bind(key)
            .fetch_optional(pool)
            .await?;
    row.map(Article::try_from).transpose()
}

/// Every identity key currently stored.
pub async fn all_keys(pool: &SqlitePool) -> Result<HashSet<ArticleKey>, StoreError> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM articles")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(key,)| ArticleKey::parse(&key))
        .collect())
}

pub async fn count_articles(pool: &SqlitePool) -> Result<u64, StoreError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
        .fetch_one(pool)
        .await?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Newest source date first; unknown dates sort last.
pub async fn list_articles(
    pool: &SqlitePool,
    page: PageRequest,
) -> Result<Paged<Article>, StoreError> {
    let total = count_articles(pool).await?;
    let rows: Vec<ArticleRow> = sqlx::query_as(&format!(
        r"
        SELECT {ARTICLE_COLUMNS} FROM articles
        ORDER BY date IS NULL, date DESC, created_at DESC
        LIMIT ? OFFSET ?
        "
    ))
    .bind(i64::from(page.per_page))
    .bind(page.offset())
    .fetch_all(pool)
    .await?;

    let items = rows
        .into_iter()
        .map(Article::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Paged::new(page, total, items))
}

/// Case-insensitive substring search over title and content.
pub async fn search_articles(
    pool: &SqlitePool,
    query: &str,
    page: PageRequest,
) -> Result<Paged<Article>, StoreError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(StoreError::EmptyQuery);
    }
    let pattern = format!("%{}%", escape_like(query));

    let (total,): (i64,) = sqlx::query_as(
        r"SELECT COUNT(*) FROM articles WHERE title LIKE ?1 ESCAPE '\' OR content LIKE ?1 ESCAPE '\'",
    )
    .bind(&pattern)
    .fetch_one(pool)
    .await?;

    let rows: Vec<ArticleRow> = sqlx::query_as(&format!(
        r"
        SELECT {ARTICLE_COLUMNS} FROM articles
        WHERE title LIKE ?1 ESCAPE '\' OR content LIKE ?1 ESCAPE '\'
        ORDER BY date IS NULL, date DESC, created_at DESC
        LIMIT ?2 OFFSET ?3
        "
    ))
    .bind(&pattern)
    .bind(i64::from(page.per_page))
    .bind(page.offset())
    .fetch_all(pool)
    .await?;

    let items = rows
        .into_iter()
        .map(Article::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Paged::new(page, u64::try_from(total).unwrap_or_default(), items))
}

pub async fn latest_article(pool: &SqlitePool) -> Result<Option<ArticleSummary>, StoreError> {
    let row: Option<ArticleSummaryRow> = sqlx::query_as(
        "SELECT key, title, created_at FROM articles ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    row.map(ArticleSummary::try_from).transpose()
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ========== Backup gaps ==========

/// Log a key whose backup write failed after its row was committed.
pub async fn record_backup_gap(
    pool: &SqlitePool,
    key: &ArticleKey,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r"
        INSERT INTO backup_gaps (key, error, recorded_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET error = excluded.error, recorded_at = excluded.recorded_at
        ",
    )
    .bind(key.as_str())
    .bind(error)
    .bind(format_timestamp(now))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_backup_gap(pool: &SqlitePool, key: &ArticleKey) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM backup_gaps WHERE key = ?")
        .bind(key.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn backup_gap_keys(pool: &SqlitePool) -> Result<Vec<ArticleKey>, StoreError> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM backup_gaps ORDER BY recorded_at")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(key,)| ArticleKey::parse(&key))
        .collect())
}

// ========== Runs ==========

/// Reason recorded for runs whose process stopped refreshing their lease.
pub const INTERRUPTED: &str = "interrupted before completion";

/// Open a ledger row for a new run in the `running` phase, returning its id.
///
/// The row's lease starts at `started_at`; see [`touch_run`].
pub async fn insert_run(pool: &SqlitePool, started_at: DateTime<Utc>) -> Result<u64, StoreError> {
    let started = format_timestamp(started_at);
    let result = sqlx::query("INSERT INTO runs (phase, started_at, heartbeat_at) VALUES (?, ?, ?)")
        .bind(Phase::Running.as_str())
        .bind(&started)
        .bind(&started)
        .execute(pool)
        .await?;
    Ok(u64::try_from(result.last_insert_rowid()).unwrap_or_default())
}

/// Refresh the lease of a run that is still `running`.
pub async fn touch_run(pool: &SqlitePool, run_id: u64, now: DateTime<Utc>) -> Result<(), StoreError> {
    sqlx::query("UPDATE runs SET heartbeat_at = ? WHERE id = ? AND phase = ?")
        .bind(format_timestamp(now))
        .bind(to_i64(run_id))
        .bind(Phase::Running.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn finish_run(pool: &SqlitePool, summary: &RunSummary) -> Result<(), StoreError> {
    sqlx::query(
        r"
        UPDATE runs SET
            phase = ?, finished_at = ?, total = ?, processed = ?,
            succeeded = ?, duplicates = ?, failed = ?, last_error = ?
        WHERE id = ?
        ",
    )
    .bind(summary.phase.as_str())
    .bind(summary.finished_at.map(format_timestamp))
    .bind(to_i64(summary.total))
    .bind(to_i64(summary.processed))
    .bind(to_i64(summary.succeeded))
    .bind(to_i64(summary.duplicates))
    .bind(to_i64(summary.failed))
    .bind(&summary.last_error)
    .bind(to_i64(summary.run_id))
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark `running` rows whose lease expired before `stale_before` as `failed`.
///
/// Runs that still refresh their lease, in this process or another, are left alone.
pub async fn fail_stale_runs(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r"
        UPDATE runs SET phase = ?, finished_at = ?, last_error = ?
        WHERE phase = ? AND COALESCE(heartbeat_at, started_at) < ?
        ",
    )
    .bind(Phase::Failed.as_str())
    .bind(format_timestamp(now))
    .bind(INTERRUPTED)
    .bind(Phase::Running.as_str())
    .bind(format_timestamp(stale_before))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Most recent run as an observer should see it.
///
/// A `running` row whose lease expired before `stale_before` is reported as failed
/// without being rewritten.
pub async fn latest_run(
    pool: &SqlitePool,
    stale_before: DateTime<Utc>,
) -> Result<Option<RunSummary>, StoreError> {
    let row: Option<RunRow> = sqlx::query_as(
        r"
        SELECT id, phase, started_at, finished_at, total, processed,
               succeeded, duplicates, failed, last_error, heartbeat_at
        FROM runs ORDER BY id DESC LIMIT 1
        ",
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let expired = row.lease_expired(&format_timestamp(stale_before));
    let mut summary = RunSummary::try_from(row)?;
    if expired {
        summary.phase = Phase::Failed;
        summary.last_error = Some(INTERRUPTED.to_string());
    }
    Ok(Some(summary))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }
}
