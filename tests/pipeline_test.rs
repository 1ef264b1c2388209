//! End-to-end ingestion runs over an in-memory source site.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use charleston_news::backup::BackupStore;
use charleston_news::config::Config;
use charleston_news::db::{Database, INTERRUPTED, insert_run};
use charleston_news::error::{FetchError, StartRunError};
use charleston_news::fetcher::PageSource;
use charleston_news::models::{ArticleKey, BackupRecord, PageRequest, Phase};
use charleston_news::pipeline::{Pipeline, RunOptions};
use tempfile::TempDir;
use tokio::sync::Notify;

const LISTING: &str = "https://www.milb.com/charleston/news";

enum Page {
    Body(String),
    Status(u16),
}

#[derive(Default)]
struct FakeSite {
    pages: HashMap<String, Page>,
    /// When set, article fetches wait for a permit before answering.
    gate: Option<Arc<Notify>>,
    requests: AtomicU64,
}

impl FakeSite {
    fn with_articles(articles: &[(&str, String)]) -> Self {
        let listing = articles
            .iter()
            .map(|(slug, _)| format!(r#"<a href="/charleston/news/{slug}">{slug}</a>"#))
            .collect::<String>();
        let mut site = Self::default();
        site.pages.insert(
            LISTING.to_string(),
            Page::Body(format!("<html><body>{listing}</body></html>")),
        );
        for (slug, html) in articles {
            site.pages.insert(article_url(slug), Page::Body(html.clone()));
        }
        site
    }

    fn set(mut self, url: &str, page: Page) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }
}

impl PageSource for FakeSite {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if url != LISTING {
                gate.notified().await;
            }
        }
        match self.pages.get(url) {
            Some(Page::Body(body)) => Ok(body.clone()),
            Some(Page::Status(status)) => Err(FetchError::Status {
                url: url.to_string(),
                status: *status,
            }),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }

    fn requests_made(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

fn article_url(slug: &str) -> String {
    format!("{LISTING}/{slug}")
}

fn article_page(title: &str, date: &str, body: &str) -> String {
    format!(
        r#"<html><body>
        <h1 class="article-item__headline">{title}</h1>
        <div class="article-item__contributor-info">RiverDogs Staff</div>
        <div class="article-item__contributor-date">{date}</div>
        <div class="article-item__bottom">
            <p>{body}</p>
            <p>The RiverDogs return to Joseph P. Riley Jr. Park on Tuesday night.</p>
        </div>
        </body></html>"#
    )
}

/// Headline and one paragraph, nothing else.
fn bare_page(title: &str, body: &str) -> String {
    format!(
        r#"<h1 class="article-item__headline">{title}</h1>
           <div class="article-item__bottom"><p>{body}</p></div>"#
    )
}

fn three_articles() -> Vec<(&'static str, String)> {
    vec![
        (
            "opening-day",
            article_page("Opening Day Win", "April 5, 2024", "Charleston won the opener 5-3."),
        ),
        (
            "fireworks-night",
            article_page("Fireworks Night Set", "May 4, 2024", "Fireworks follow Saturday's game."),
        ),
        (
            "roster-update",
            article_page("Roster Update", "June 1, 2024", "Two pitchers joined the club."),
        ),
    ]
}

fn test_config(dir: &Path) -> Config {
    Config {
        database_path: dir.join("news.sqlite"),
        backup_dir: dir.join("articles"),
        ..Config::default()
    }
}

async fn run_once(pipeline: &Pipeline<FakeSite>, options: RunOptions) -> charleston_news::models::RunSummary {
    pipeline
        .start_run(options)
        .await
        .expect("run starts")
        .wait()
        .await
        .expect("run task completes")
}

async fn wait_for_current(pipeline: &Pipeline<FakeSite>, url: &str) {
    for _ in 0..500 {
        if pipeline.get_progress().current_url.as_deref() == Some(url) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never reached {url}");
}

async fn ledger_phase(db: &Database, run_id: u64) -> String {
    let (phase,): (String,) = sqlx::query_as("SELECT phase FROM runs WHERE id = ?")
        .bind(run_id as i64)
        .fetch_one(db.pool())
        .await
        .unwrap();
    phase
}

#[tokio::test]
async fn test_run_stores_rows_and_backups() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::with_source(test_config(dir.path()), FakeSite::with_articles(&three_articles()))
        .await
        .unwrap();

    let summary = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(summary.phase, Phase::Completed);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);

    let stats = pipeline.get_storage_stats().await.unwrap();
    assert_eq!(stats.row_count, 3);
    assert_eq!(stats.backup_file_count, 3);
    assert_eq!(stats.pending_backup_gaps, 0);
    assert_eq!(stats.last_run_summary.unwrap().phase, Phase::Completed);

    let snap = pipeline.get_progress();
    assert_eq!(snap.phase, Phase::Completed);
    assert_eq!(snap.processed, 3);
    assert_eq!(snap.requests_made, 4);
    assert_eq!(snap.recent.len(), 3);
    assert_eq!(snap.progress_percentage, 100.0);

    let key = ArticleKey::derive("Opening Day Win", chrono::NaiveDate::from_ymd_opt(2024, 4, 5));
    let article = pipeline.get_article(key.as_str()).await.unwrap().unwrap();
    assert_eq!(article.author.as_deref(), Some("RiverDogs Staff"));
    assert_eq!(article.source_url, article_url("opening-day"));

    let backup = BackupStore::new(dir.path().join("articles"));
    let record = backup.read(&key).await.unwrap().unwrap();
    assert_eq!(record, BackupRecord::from(&article));
}

#[tokio::test]
async fn test_second_run_is_all_duplicates() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::with_source(test_config(dir.path()), FakeSite::with_articles(&three_articles()))
        .await
        .unwrap();

    run_once(&pipeline, RunOptions::default()).await;
    let before = pipeline.get_storage_stats().await.unwrap();

    let second = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(second.phase, Phase::Completed);
    assert_eq!(second.duplicates, 3);
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.failed, 0);

    let after = pipeline.get_storage_stats().await.unwrap();
    assert_eq!(after.row_count, before.row_count);
    assert_eq!(after.backup_file_count, before.backup_file_count);
}

#[tokio::test]
async fn test_reingest_overwrites_instead_of_skipping() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::with_source(test_config(dir.path()), FakeSite::with_articles(&three_articles()))
        .await
        .unwrap();

    run_once(&pipeline, RunOptions::default()).await;
    let again = run_once(
        &pipeline,
        RunOptions {
            reingest: true,
            ..RunOptions::default()
        },
    )
    .await;
    assert_eq!(again.succeeded, 3);
    assert_eq!(again.duplicates, 0);
    assert_eq!(pipeline.get_storage_stats().await.unwrap().row_count, 3);
}

#[tokio::test]
async fn test_case_and_whitespace_variants_are_duplicates() {
    let dir = TempDir::new().unwrap();
    let site = FakeSite::with_articles(&[
        (
            "win",
            article_page("RiverDogs Win Opener", "April 5, 2024", "Charleston won the opener 5-3."),
        ),
        (
            "win-again",
            article_page("riverdogs   WIN opener", "April 5, 2024", "Charleston won the opener 5-3."),
        ),
    ]);
    let pipeline = Pipeline::with_source(test_config(dir.path()), site).await.unwrap();

    let summary = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(pipeline.get_storage_stats().await.unwrap().row_count, 1);
}

#[tokio::test]
async fn test_item_failures_do_not_end_the_run() {
    let dir = TempDir::new().unwrap();
    let mut articles = three_articles();
    articles.push(("too-short", bare_page("Short", "Hi")));
    articles.push((
        "not-found",
        article_page("Page Not Found", "May 1, 2024", "The page you requested does not exist here."),
    ));
    articles.push(("no-title", "<html><body><p>orphan paragraph</p></body></html>".to_string()));
    let site = FakeSite::with_articles(&articles).set(&article_url("roster-update"), Page::Status(500));
    let pipeline = Pipeline::with_source(test_config(dir.path()), site).await.unwrap();

    let summary = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(summary.phase, Phase::Completed);
    assert_eq!(summary.total, 6);
    assert_eq!(summary.processed, 6);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 4);
    assert!(summary.last_error.is_some());

    let stats = pipeline.get_storage_stats().await.unwrap();
    assert_eq!(stats.row_count, 2);
    assert_eq!(stats.backup_file_count, 2);
}

#[tokio::test]
async fn test_short_content_is_rejected_without_writes() {
    let dir = TempDir::new().unwrap();
    let site = FakeSite::with_articles(&[("tiny", bare_page("Tiny", "Hello"))]);
    let pipeline = Pipeline::with_source(test_config(dir.path()), site).await.unwrap();

    let summary = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 0);
    assert!(
        summary
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("minimum is 50"))
    );

    let stats = pipeline.get_storage_stats().await.unwrap();
    assert_eq!(stats.row_count, 0);
    assert_eq!(stats.backup_file_count, 0);
}

#[tokio::test]
async fn test_discovery_failure_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let site = FakeSite::with_articles(&three_articles()).set(LISTING, Page::Status(503));
    let pipeline = Pipeline::with_source(test_config(dir.path()), site).await.unwrap();

    let summary = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(summary.phase, Phase::Failed);
    assert_eq!(summary.processed, 0);
    assert!(
        summary
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("link discovery failed"))
    );
    assert_eq!(pipeline.health().await.last_run_phase, Phase::Failed);
}

#[tokio::test]
async fn test_empty_listing_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let site = FakeSite::default().set(
        LISTING,
        Page::Body(r#"<a href="/charleston/schedule">Schedule</a>"#.to_string()),
    );
    let pipeline = Pipeline::with_source(test_config(dir.path()), site).await.unwrap();

    let summary = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(summary.phase, Phase::Failed);
    assert!(summary.last_error.unwrap().contains("no article URLs"));
}

#[tokio::test]
async fn test_max_articles_caps_the_run() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::with_source(test_config(dir.path()), FakeSite::with_articles(&three_articles()))
        .await
        .unwrap();

    let summary = run_once(
        &pipeline,
        RunOptions {
            max_articles: Some(1),
            ..RunOptions::default()
        },
    )
    .await;
    assert_eq!(summary.total, 1);
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let site = FakeSite {
        gate: Some(Arc::clone(&gate)),
        ..FakeSite::with_articles(&three_articles()[..1])
    };
    let pipeline = Pipeline::with_source(test_config(dir.path()), site).await.unwrap();

    let handle = pipeline.start_run(RunOptions::default()).await.unwrap();
    let target = article_url("opening-day");
    wait_for_current(&pipeline, &target).await;
    let running = pipeline.get_progress();
    assert_eq!(running.phase, Phase::Running);
    assert_eq!(running.current_url.as_deref(), Some(target.as_str()));

    match pipeline.start_run(RunOptions::default()).await {
        Err(StartRunError::AlreadyActive(e)) => assert_eq!(e.run_id, Some(handle.run_id())),
        other => panic!("expected AlreadyActive, got {:?}", other.map(|h| h.run_id())),
    }
    assert_eq!(pipeline.health().await.last_run_phase, Phase::Running);

    gate.notify_one();
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.phase, Phase::Completed);
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test]
async fn test_backup_failure_keeps_item_stored_and_reconcile_repairs() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    // A plain file where the backup directory should be.
    std::fs::write(&config.backup_dir, b"blocker").unwrap();
    let pipeline = Pipeline::with_source(config.clone(), FakeSite::with_articles(&three_articles()))
        .await
        .unwrap();

    let summary = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(summary.phase, Phase::Completed);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);

    let stats = pipeline.get_storage_stats().await;
    assert!(stats.is_err(), "backup root is not a directory");
    let health = pipeline.health().await;
    assert!(health.database_reachable);
    assert!(!health.backup_dir_writable);
    assert!(!health.ready);

    std::fs::remove_file(&config.backup_dir).unwrap();
    let pending = pipeline.get_storage_stats().await.unwrap();
    assert_eq!(pending.row_count, 3);
    assert_eq!(pending.backup_file_count, 0);
    assert_eq!(pending.pending_backup_gaps, 3);

    let report = pipeline.reconcile().await.unwrap();
    assert_eq!(report.restored, 3);
    assert_eq!(report.failed, 0);

    let repaired = pipeline.get_storage_stats().await.unwrap();
    assert_eq!(repaired.backup_file_count, 3);
    assert_eq!(repaired.pending_backup_gaps, 0);
    assert!(pipeline.reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn test_reconcile_removes_orphan_backups() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let pipeline = Pipeline::with_source(config.clone(), FakeSite::with_articles(&three_articles()))
        .await
        .unwrap();
    run_once(&pipeline, RunOptions::default()).await;

    let backups = BackupStore::new(&config.backup_dir);
    let now = Utc::now();
    let orphan = BackupRecord {
        key: ArticleKey::derive("Never stored", None),
        title: "Never stored".to_string(),
        subheadline: None,
        author: None,
        section: None,
        content: "No relational row backs this file.".to_string(),
        date: None,
        image_urls: Vec::new(),
        source_url: article_url("never-stored"),
        created_at: now,
        updated_at: now,
    };
    backups.write(&orphan).await.unwrap();
    assert_eq!(backups.count().await.unwrap(), 4);

    let report = pipeline.reconcile().await.unwrap();
    assert_eq!(report.orphans_removed, 1);
    assert_eq!(report.restored, 0);
    assert!(!backups.exists(&orphan.key).await);
    assert_eq!(backups.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_lapsed_run_is_reported_failed_and_swept_on_next_start() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let started = Utc::now() - chrono::Duration::hours(1);
    let stale_id = {
        let db = Database::open(&config.database_path).await.unwrap();
        let id = insert_run(db.pool(), started).await.unwrap();
        db.pool().close().await;
        id
    };

    let pipeline = Pipeline::with_source(config.clone(), FakeSite::default()).await.unwrap();
    let last = pipeline
        .get_storage_stats()
        .await
        .unwrap()
        .last_run_summary
        .unwrap();
    assert_eq!(last.run_id, stale_id);
    assert_eq!(last.phase, Phase::Failed);
    assert_eq!(last.last_error.as_deref(), Some(INTERRUPTED));
    assert_eq!(pipeline.health().await.last_run_phase, Phase::Failed);

    // Opening and observing leave the ledger row as it was.
    let ledger = Database::open(&config.database_path).await.unwrap();
    assert_eq!(ledger_phase(&ledger, stale_id).await, "running");

    run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(ledger_phase(&ledger, stale_id).await, "failed");
}

#[tokio::test]
async fn test_second_pipeline_observes_live_run_without_touching_it() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let gate = Arc::new(Notify::new());
    let site = FakeSite {
        gate: Some(Arc::clone(&gate)),
        ..FakeSite::with_articles(&three_articles()[..1])
    };
    let writer = Pipeline::with_source(config.clone(), site).await.unwrap();
    let handle = writer.start_run(RunOptions::default()).await.unwrap();
    wait_for_current(&writer, &article_url("opening-day")).await;

    let observer = Pipeline::with_source(config.clone(), FakeSite::default()).await.unwrap();
    assert_eq!(observer.health().await.last_run_phase, Phase::Running);
    let seen = observer
        .get_storage_stats()
        .await
        .unwrap()
        .last_run_summary
        .unwrap();
    assert_eq!(seen.run_id, handle.run_id());
    assert_eq!(seen.phase, Phase::Running);
    assert!(seen.last_error.is_none());

    match observer.start_run(RunOptions::default()).await {
        Err(StartRunError::AlreadyActive(e)) => assert_eq!(e.run_id, Some(handle.run_id())),
        other => panic!("expected AlreadyActive, got {:?}", other.map(|h| h.run_id())),
    }
    assert_eq!(observer.get_progress().phase, Phase::Idle);

    gate.notify_one();
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.phase, Phase::Completed);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(observer.health().await.last_run_phase, Phase::Completed);
}

#[tokio::test]
async fn test_relational_write_failure_fails_item_and_is_retried_next_run() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let pipeline = Pipeline::with_source(config.clone(), FakeSite::with_articles(&three_articles()[..1]))
        .await
        .unwrap();

    let db = Database::open(&config.database_path).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_articles BEFORE INSERT ON articles \
         BEGIN SELECT RAISE(ABORT, 'disk is full'); END",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let summary = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(summary.phase, Phase::Completed);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 0);
    assert!(summary.last_error.is_some());

    let stats = pipeline.get_storage_stats().await.unwrap();
    assert_eq!(stats.row_count, 0);
    assert_eq!(stats.backup_file_count, 0);
    assert_eq!(stats.pending_backup_gaps, 0);

    sqlx::query("DROP TRIGGER reject_articles")
        .execute(db.pool())
        .await
        .unwrap();
    let retry = run_once(&pipeline, RunOptions::default()).await;
    assert_eq!(retry.succeeded, 1);
    assert_eq!(retry.duplicates, 0);
    assert_eq!(pipeline.get_storage_stats().await.unwrap().backup_file_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconcile_during_run_never_removes_fresh_backups() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let site = FakeSite {
        gate: Some(Arc::clone(&gate)),
        ..FakeSite::with_articles(&three_articles())
    };
    let pipeline = Pipeline::with_source(test_config(dir.path()), site).await.unwrap();
    let handle = pipeline.start_run(RunOptions::default()).await.unwrap();

    for expected in 1..=3u64 {
        gate.notify_one();
        loop {
            let report = pipeline.reconcile().await.unwrap();
            assert_eq!(report.orphans_removed, 0);
            if pipeline.get_progress().processed >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.succeeded, 3);
    let stats = pipeline.get_storage_stats().await.unwrap();
    assert_eq!(stats.row_count, 3);
    assert_eq!(stats.backup_file_count, 3);
    assert_eq!(stats.pending_backup_gaps, 0);
}

#[tokio::test]
async fn test_attempts_are_visible_before_item_finishes() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let site = FakeSite {
        gate: Some(Arc::clone(&gate)),
        ..FakeSite::with_articles(&three_articles()[..1])
    };
    let pipeline = Pipeline::with_source(test_config(dir.path()), site).await.unwrap();
    let handle = pipeline.start_run(RunOptions::default()).await.unwrap();

    // Listing plus the first article attempt, which is parked on the gate.
    for _ in 0..500 {
        if pipeline.get_progress().requests_made >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snap = pipeline.get_progress();
    assert_eq!(snap.requests_made, 2);
    assert_eq!(snap.processed, 0);

    gate.notify_one();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn test_read_api_lists_and_searches() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::with_source(test_config(dir.path()), FakeSite::with_articles(&three_articles()))
        .await
        .unwrap();
    run_once(&pipeline, RunOptions::default()).await;

    let page = pipeline.list_articles(PageRequest::new(1, 2)).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.pages, 2);
    assert_eq!(page.items[0].title, "Roster Update");

    let hits = pipeline
        .search_articles("FIREWORKS", PageRequest::default())
        .await
        .unwrap();
    assert_eq!(hits.total, 1);
    assert_eq!(hits.items[0].title, "Fireworks Night Set");

    assert!(pipeline.search_articles(" ", PageRequest::default()).await.is_err());
    assert!(pipeline.get_article("not-a-key").await.unwrap().is_none());
}
