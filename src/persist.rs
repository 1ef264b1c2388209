//! Dual-store persistence: the relational row first, then the JSON backup.
//!
//! The relational store is authoritative. A failed relational write fails the item and
//! nothing is recorded for its key. A failed backup write after a committed row leaves
//! the item stored; the gap is logged in `backup_gaps` and repaired by [`reconcile`].
//!
//! [`reconcile`]: PersistenceManager::reconcile

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::backup::BackupStore;
use crate::db::{self, Database};
use crate::error::{PersistError, StoreError};
use crate::models::{Article, BackupRecord, NewArticle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStatus {
    Written,
    /// Row committed, backup missing; logged for reconciliation.
    Pending(String),
}

#[derive(Debug, Clone)]
pub struct Stored {
    pub article: Article,
    pub backup: BackupStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Backups re-derived from relational rows.
    pub restored: u64,
    /// Backup files removed because no row exists for their key.
    pub orphans_removed: u64,
    /// Repairs that failed and remain pending.
    pub failed: u64,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.restored == 0 && self.orphans_removed == 0 && self.failed == 0
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceManager {
    db: Database,
    backups: BackupStore,
}

impl PersistenceManager {
    pub fn new(db: Database, backups: BackupStore) -> Self {
        Self { db, backups }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    #[instrument(level = "info", skip_all, fields(key = %article.key))]
    pub async fn persist(&self, article: &NewArticle) -> Result<Stored, PersistError> {
        let stored = db::upsert_article(self.db.pool(), article, Utc::now())
            .await
            .map_err(|source| PersistError {
                key: article.key.clone(),
                source,
            })?;

        let backup = match self.backups.write(&BackupRecord::from(&stored)).await {
            Ok(_) => BackupStatus::Written,
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    key = %stored.key,
                    error = %reason,
                    "Backup write failed after relational commit; recorded for reconciliation"
                );
                if let Err(log_err) =
                    db::record_backup_gap(self.db.pool(), &stored.key, &reason, Utc::now()).await
                {
                    // Reconciliation still finds the gap by scanning rows against files.
                    error!(key = %stored.key, error = %log_err, "Failed to record backup gap");
                }
                BackupStatus::Pending(reason)
            }
        };

        Ok(Stored {
            article: stored,
            backup,
        })
    }

    /// Restore dual-store consistency.
    ///
    /// Every row gets a backup file; every backup file without a row is removed.
    /// Files are listed before rows: a backup is only written after its row commits, so
    /// a file written by a concurrent run always has its row in the second listing.
    #[instrument(level = "info", skip_all)]
    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let files = self.backups.keys().await.map_err(StoreError::BackupDir)?;
        let rows = db::all_keys(self.db.pool()).await?;
        let mut report = ReconcileReport::default();

        for key in rows.difference(&files) {
            let Some(article) = db::get_article(self.db.pool(), key.as_str()).await? else {
                continue;
            };
            match self.backups.write(&BackupRecord::from(&article)).await {
                Ok(_) => {
                    db::clear_backup_gap(self.db.pool(), key).await?;
                    report.restored += 1;
                }
                Err(e) => {
                    warn!(%key, error = %e, "Backup still cannot be written");
                    db::record_backup_gap(self.db.pool(), key, &e.to_string(), Utc::now()).await?;
                    report.failed += 1;
                }
            }
        }

        for key in files.difference(&rows) {
            if db::get_article(self.db.pool(), key.as_str()).await?.is_some() {
                continue;
            }
            match self.backups.remove(key).await {
                Ok(()) => {
                    warn!(%key, "Removed backup with no relational row");
                    report.orphans_removed += 1;
                }
                Err(e) => {
                    warn!(%key, error = %e, "Failed to remove orphaned backup");
                    report.failed += 1;
                }
            }
        }

        // Gaps whose file has since appeared (e.g. written by a later re-ingestion).
        for key in db::backup_gap_keys(self.db.pool()).await? {
            if self.backups.exists(&key).await {
                db::clear_backup_gap(self.db.pool(), &key).await?;
            }
        }

        if report.is_clean() {
            info!("Stores are consistent");
        } else {
            info!(
                restored = report.restored,
                orphans_removed = report.orphans_removed,
                failed = report.failed,
                "Reconciliation finished"
            );
        }
        Ok(report)
    }
}
