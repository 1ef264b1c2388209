//! Run orchestration and the read API served to observers.
//!
//! A [`Pipeline`] owns the fetcher, stores and progress state for one source site. It is
//! cheap to clone; clones share the same progress state, so the live monitor, a status
//! check and the running ingestion task all see the same run.
//!
//! One run is a sequential loop over the discovered links:
//!
//! ```text
//! fetch -> extract -> validate/dedup -> persist (row, then backup) -> record outcome
//! ```
//!
//! Per-item failures only move counters. A run ends `failed` only when link discovery
//! fails, finds nothing, or the store becomes unusable.
//!
//! Each run holds a lease on its ledger row and refreshes it while it works. Opening a
//! pipeline never writes the ledger, so observers in other processes are read-only.
//! Rows whose lease lapsed are reported as failed and swept when the next run starts.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use url::Url;

use crate::backup::BackupStore;
use crate::config::Config;
use crate::db::{self, Database};
use crate::error::{
    FetchError, RunAlreadyActiveError, RunError, SetupError, StartRunError, StoreError,
};
use crate::extractor;
use crate::fetcher::{HttpFetcher, PageSource};
use crate::models::{Article, ArticleKey, ArticleSummary, PageRequest, Paged, Phase, RunSummary};
use crate::persist::{BackupStatus, PersistenceManager, ReconcileReport};
use crate::progress::{Outcome, ProgressSnapshot, ProgressState};
use crate::utils::{ensure_writable_dir, truncate_for_log};
use crate::validator::{Validator, Verdict};

/// How often request attempts are published while a fetch is still retrying.
const REQUEST_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Validate against an empty key set so every page is re-persisted (upsert).
    pub reingest: bool,
    /// Overrides the configured link cap for this run.
    pub max_articles: Option<usize>,
}

/// Handle to a spawned ingestion run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: u64,
    task: JoinHandle<RunSummary>,
}

impl RunHandle {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Wait for the run to reach a terminal phase.
    pub async fn wait(self) -> Result<RunSummary, RunError> {
        self.task
            .await
            .map_err(|e| RunError::Aborted(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub row_count: u64,
    pub backup_file_count: u64,
    pub pending_backup_gaps: u64,
    pub latest_article: Option<ArticleSummary>,
    pub last_run_summary: Option<RunSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub database_reachable: bool,
    pub backup_dir_writable: bool,
    pub last_run_phase: Phase,
    pub ready: bool,
}

pub struct Pipeline<S: PageSource = HttpFetcher> {
    inner: Arc<Inner<S>>,
}

impl<S: PageSource> Clone for Pipeline<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    config: Config,
    base: Url,
    source: S,
    validator: Validator,
    store: PersistenceManager,
    progress: ProgressState,
}

impl Pipeline<HttpFetcher> {
    /// Build the production pipeline: HTTP fetcher, SQLite store and backup tree.
    pub async fn open(config: Config) -> Result<Self, SetupError> {
        let source = HttpFetcher::from_config(&config)?;
        Self::with_source(config, source).await
    }
}

impl<S: PageSource + 'static> Pipeline<S> {
    /// Build a pipeline over any page source.
    pub async fn with_source(config: Config, source: S) -> Result<Self, SetupError> {
        config.validate()?;
        let base = Url::parse(&config.site_base_url)?;
        let validator = Validator::from_config(&config)?;

        let db = Database::open(&config.database_path).await?;
        let store = PersistenceManager::new(db, BackupStore::new(&config.backup_dir));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                base,
                source,
                validator,
                store,
                progress: ProgressState::new(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Start a run in the background.
    ///
    /// Rejected while another run is active, here or in another process holding a live
    /// lease on the same database.
    #[instrument(level = "info", skip(self))]
    pub async fn start_run(&self, options: RunOptions) -> Result<RunHandle, StartRunError> {
        let inner = &self.inner;
        let previous = inner.progress.snapshot();
        inner.progress.start(0)?;

        let started_at = inner
            .progress
            .snapshot()
            .started_at
            .unwrap_or_else(Utc::now);
        let run_id = match inner.open_ledger_run(started_at).await {
            Ok(id) => id,
            Err(e) => {
                match &e {
                    StartRunError::AlreadyActive(_) => inner.progress.abandon(previous),
                    StartRunError::Store(_) => {
                        inner.progress.finish(Phase::Failed, Some(e.to_string()));
                    }
                }
                return Err(e);
            }
        };
        inner.progress.set_run_id(run_id);
        info!(run_id, reingest = options.reingest, "Ingestion run started");

        let task_inner = Arc::clone(inner);
        let task = tokio::spawn(
            async move { task_inner.execute(run_id, started_at, options).await }
                .instrument(info_span!("run", run_id)),
        );
        Ok(RunHandle { run_id, task })
    }

    pub fn get_progress(&self) -> Arc<ProgressSnapshot> {
        self.inner.progress.snapshot()
    }

    /// Look up one article. Malformed keys simply find nothing.
    pub async fn get_article(&self, key: &str) -> Result<Option<Article>, StoreError> {
        let Some(key) = ArticleKey::parse(key.trim()) else {
            return Ok(None);
        };
        db::get_article(self.pool(), key.as_str()).await
    }

    pub async fn list_articles(&self, page: PageRequest) -> Result<Paged<Article>, StoreError> {
        db::list_articles(self.pool(), page).await
    }

    pub async fn search_articles(
        &self,
        query: &str,
        page: PageRequest,
    ) -> Result<Paged<Article>, StoreError> {
        db::search_articles(self.pool(), query, page).await
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, StoreError> {
        let pool = self.pool();
        let (row_count, gaps, latest_article, last_run_summary) = tokio::try_join!(
            db::count_articles(pool),
            db::backup_gap_keys(pool),
            db::latest_article(pool),
            db::latest_run(pool, self.inner.stale_before(Utc::now())),
        )?;
        let backup_file_count = self
            .inner
            .store
            .backups()
            .count()
            .await
            .map_err(StoreError::BackupDir)?;

        Ok(StorageStats {
            row_count,
            backup_file_count,
            pending_backup_gaps: gaps.len() as u64,
            latest_article,
            last_run_summary,
        })
    }

    /// Readiness: database reachable and backup directory writable.
    pub async fn health(&self) -> Health {
        let backups = self.inner.store.backups().root();
        let (database_reachable, writable) = futures::future::join(
            self.inner.store.database().ping(),
            ensure_writable_dir(backups),
        )
        .await;

        let backup_dir_writable = match writable {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %backups.display(), error = %e, "Backup directory is not writable");
                false
            }
        };

        let last_run_phase = if self.inner.progress.is_active() {
            Phase::Running
        } else {
            match db::latest_run(self.pool(), self.inner.stale_before(Utc::now())).await {
                Ok(run) => run.map_or(Phase::Idle, |r| r.phase),
                Err(e) => {
                    warn!(error = %e, "Could not read run ledger");
                    Phase::Idle
                }
            }
        };

        Health {
            database_reachable,
            backup_dir_writable,
            last_run_phase,
            ready: database_reachable && backup_dir_writable,
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        self.inner.store.reconcile().await
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.inner.store.database().pool()
    }
}

impl<S: PageSource> Inner<S> {
    async fn execute(&self, run_id: u64, started_at: DateTime<Utc>, options: RunOptions) -> RunSummary {
        let baseline = self.source.requests_made();

        let work = async {
            // Repairs from an earlier partial write never decide this run's outcome.
            match self.store.reconcile().await {
                Ok(report) if !report.is_clean() => {
                    info!(?report, "Repaired store divergence before ingesting");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Reconciliation failed; continuing with ingestion"),
            }
            self.ingest(options, baseline).await
        };
        let result = tokio::select! {
            result = work => result,
            never = self.keep_alive(run_id) => match never {},
        };
        self.note_requests(baseline);

        let (phase, run_error) = match result {
            Ok(()) => (Phase::Completed, None),
            Err(e) => {
                error!(error = %e, "Ingestion run failed");
                (Phase::Failed, Some(e.to_string()))
            }
        };
        self.progress.finish(phase, run_error);

        let snap = self.progress.snapshot();
        let summary = RunSummary {
            run_id,
            phase: snap.phase,
            started_at,
            finished_at: snap.finished_at,
            total: snap.total_discovered,
            processed: snap.processed,
            succeeded: snap.succeeded,
            duplicates: snap.duplicates,
            failed: snap.failed,
            last_error: snap.last_error.clone(),
        };
        if let Err(e) = db::finish_run(self.store.database().pool(), &summary).await {
            error!(error = %e, "Failed to record run outcome in ledger");
        }

        info!(
            phase = %summary.phase,
            processed = summary.processed,
            succeeded = summary.succeeded,
            duplicates = summary.duplicates,
            failed = summary.failed,
            requests = snap.requests_made,
            "Ingestion run finished"
        );
        summary
    }

    async fn ingest(&self, options: RunOptions, baseline: u64) -> Result<(), RunError> {
        let listing_url = self.config.listing_url.as_str();
        self.progress.set_current(listing_url);

        let listing = self.fetch_observed(listing_url, baseline).await;
        self.note_requests(baseline);
        let listing = listing.map_err(RunError::Discovery)?;

        let mut links =
            extractor::discover_links(&listing, &self.base, &self.config.article_path_fragment);
        if links.is_empty() {
            return Err(RunError::NoLinks(listing_url.to_string()));
        }
        if let Some(max) = options.max_articles.or(self.config.max_articles) {
            links.truncate(max);
        }
        info!(count = links.len(), "Discovered article links");
        self.progress.set_total(links.len() as u64);

        let mut known = if options.reingest {
            HashSet::new()
        } else {
            db::all_keys(self.store.database().pool()).await?
        };
        debug!(known = known.len(), "Loaded known identity keys");

        for url in &links {
            self.progress.set_current(url);
            let outcome = self.process(url, &mut known, baseline).await;
            self.note_requests(baseline);
            self.progress.record(outcome);
        }
        Ok(())
    }

    #[instrument(level = "info", skip(self, known, baseline))]
    async fn process(&self, url: &str, known: &mut HashSet<ArticleKey>, baseline: u64) -> Outcome {
        let raw = match self.fetch_observed(url, baseline).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Fetch failed");
                return Outcome::FetchFailure {
                    url: url.to_string(),
                    reason: e.to_string(),
                };
            }
        };

        let candidate = match extractor::extract(&raw, url) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, body = %truncate_for_log(&raw, 200), "Extraction failed");
                return Outcome::ValidationFailure {
                    url: url.to_string(),
                    reason: e.to_string(),
                };
            }
        };

        let article = match self.validator.check(candidate, known) {
            Verdict::Accept(article) => article,
            Verdict::DuplicateSkip(key) => {
                debug!(%key, "Already stored");
                return Outcome::DuplicateSkip {
                    url: url.to_string(),
                };
            }
            Verdict::ValidationReject(reason) => {
                warn!(%reason, "Candidate rejected");
                return Outcome::ValidationFailure {
                    url: url.to_string(),
                    reason: reason.to_string(),
                };
            }
        };

        match self.store.persist(&article).await {
            Ok(stored) => {
                if let BackupStatus::Pending(reason) = &stored.backup {
                    debug!(%reason, "Stored without backup");
                }
                known.insert(stored.article.key.clone());
                info!(key = %stored.article.key, title = %stored.article.title, "Stored article");
                Outcome::Success {
                    url: url.to_string(),
                    title: stored.article.title,
                }
            }
            Err(e) => {
                error!(error = %e, "Persist failed");
                Outcome::PersistFailure {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Sweep lapsed runs, refuse a live one, then open this run's ledger row.
    async fn open_ledger_run(&self, started_at: DateTime<Utc>) -> Result<u64, StartRunError> {
        let pool = self.store.database().pool();
        let stale_before = self.stale_before(started_at);

        let stale = db::fail_stale_runs(pool, started_at, stale_before).await?;
        if stale > 0 {
            warn!(count = stale, "Marked runs with a lapsed lease as failed");
        }
        if let Some(live) = db::latest_run(pool, stale_before)
            .await?
            .filter(|run| run.phase == Phase::Running)
        {
            warn!(run_id = live.run_id, "Another process holds a live run");
            return Err(RunAlreadyActiveError {
                run_id: Some(live.run_id),
            }
            .into());
        }
        Ok(db::insert_run(pool, started_at).await?)
    }

    /// Refresh this run's ledger lease until the future is dropped.
    async fn keep_alive(&self, run_id: u64) -> Infallible {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = db::touch_run(self.store.database().pool(), run_id, Utc::now()).await {
                warn!(error = %e, "Failed to refresh run lease");
            }
        }
    }

    /// Fetch `url`, publishing the attempt count while retries are still in flight.
    async fn fetch_observed(&self, url: &str, baseline: u64) -> Result<String, FetchError> {
        let fetch = self.source.fetch(url);
        tokio::pin!(fetch);
        let mut ticker = tokio::time::interval(REQUEST_POLL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut fetch => return result,
                _ = ticker.tick() => self.note_requests(baseline),
            }
        }
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.config.run_lease())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        now - lease
    }

    fn note_requests(&self, baseline: u64) {
        self.progress
            .observe_requests(self.source.requests_made().saturating_sub(baseline));
    }
}
