//! Plain-text rendering of progress, status and articles for the CLI.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use itertools::Itertools;

use crate::models::{Article, Paged, Phase};
use crate::pipeline::{Health, StorageStats};
use crate::progress::ProgressSnapshot;
use crate::utils::{format_duration, truncate_for_log};

const RULE: &str = "==================================================";

fn mark(ok: bool) -> &'static str {
    if ok { "ok" } else { "FAIL" }
}

/// One frame of the live monitor.
pub fn render_progress(snap: &ProgressSnapshot, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Charleston News Ingestion Monitor");
    let _ = writeln!(out, "{RULE}");

    let run = snap.run_id.map(|id| format!(" (run {id})")).unwrap_or_default();
    let _ = writeln!(out, "Status: {}{run}", snap.phase.as_str().to_uppercase());
    let _ = writeln!(
        out,
        "Progress: {}/{} articles ({:.1}%)",
        snap.processed, snap.total_discovered, snap.progress_percentage
    );
    let _ = writeln!(
        out,
        "Stored: {}  Duplicates: {}  Failed: {}  Requests: {}",
        snap.succeeded, snap.duplicates, snap.failed, snap.requests_made
    );

    if let Some(elapsed) = snap.elapsed(now) {
        let label = if snap.phase == Phase::Running { "Running time" } else { "Total time" };
        let _ = writeln!(out, "{label}: {}", format_duration(elapsed));
    }
    if snap.phase == Phase::Running {
        if snap.rate_per_minute > 0.0 {
            let _ = writeln!(out, "Speed: {:.1} articles/minute", snap.rate_per_minute);
        }
        if let Some(eta) = snap.eta {
            let _ = writeln!(out, "Est. time remaining: {}", format_duration(eta - now));
        }
    }
    if let Some(url) = &snap.current_url {
        let _ = writeln!(out, "Current: {url}");
    }
    if let Some(err) = &snap.last_error {
        let _ = writeln!(out, "Last error: {}", truncate_for_log(err, 160));
    }

    if !snap.recent.is_empty() {
        let _ = writeln!(out, "\nRecently stored:");
        for recent in snap.recent.iter().rev() {
            let _ = writeln!(out, "- {}", recent.title);
            let _ = writeln!(out, "  {}", recent.url);
        }
    }
    out
}

/// Storage, health and last-run report for `status`.
pub fn render_status(stats: &StorageStats, health: &Health) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== System Status ===");
    let _ = writeln!(out, "Ready: {}", if health.ready { "yes" } else { "no" });

    let _ = writeln!(out, "\nDatabase:");
    let _ = writeln!(out, "- Reachable: {}", mark(health.database_reachable));
    let _ = writeln!(out, "- Total articles: {}", stats.row_count);
    if let Some(latest) = &stats.latest_article {
        let _ = writeln!(out, "- Latest article: {}", latest.title);
        let _ = writeln!(out, "- Created at: {}", latest.created_at.to_rfc3339());
    }

    let _ = writeln!(out, "\nBackups:");
    let _ = writeln!(out, "- Directory writable: {}", mark(health.backup_dir_writable));
    let _ = writeln!(out, "- JSON files: {}", stats.backup_file_count);
    let _ = writeln!(out, "- Pending backup gaps: {}", stats.pending_backup_gaps);
    if stats.backup_file_count != stats.row_count || stats.pending_backup_gaps > 0 {
        let _ = writeln!(out, "  (run `reconcile` to repair)");
    }

    let _ = writeln!(out, "\nIngestion:");
    let _ = writeln!(out, "- Last run phase: {}", health.last_run_phase.as_str().to_uppercase());
    if let Some(run) = &stats.last_run_summary {
        let _ = writeln!(out, "- Run {} started {}", run.run_id, run.started_at.to_rfc3339());
        if let Some(finished) = run.finished_at {
            let _ = writeln!(
                out,
                "- Finished {} after {}",
                finished.to_rfc3339(),
                format_duration(finished - run.started_at)
            );
        }
        let _ = writeln!(
            out,
            "- Processed {}/{}: {} stored, {} duplicates, {} failed",
            run.processed, run.total, run.succeeded, run.duplicates, run.failed
        );
        if let Some(err) = &run.last_error {
            let _ = writeln!(out, "- Last error: {}", truncate_for_log(err, 160));
        }
    }
    out
}

/// Compact listing used by `list` and `search`.
pub fn render_page(page: &Paged<Article>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Page {}/{} ({} articles)",
        page.page,
        page.pages.max(1),
        page.total
    );
    for article in &page.items {
        let date = article
            .date
            .map_or_else(|| "unknown".to_string(), |d| d.to_string());
        let byline = [article.author.as_deref(), article.section.as_deref()]
            .into_iter()
            .flatten()
            .join(", ");
        let _ = writeln!(out, "\n{}  {}", date, article.title);
        if !byline.is_empty() {
            let _ = writeln!(out, "  {byline}");
        }
        let _ = writeln!(out, "  key: {}", article.key);
        let _ = writeln!(out, "  {}", article.source_url);
    }
    out
}
