//! Process-wide progress of the current ingestion run.
//!
//! One writer (the orchestrator) and any number of readers. The writer never mutates a
//! published snapshot: it clones the current one, applies the change, and swaps the new
//! `Arc` in. Readers therefore always see a snapshot that was complete at some instant,
//! and never block the writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::RunAlreadyActiveError;
use crate::models::Phase;

const RECENT_LIMIT: usize = 5;

/// Result of processing one discovered link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { url: String, title: String },
    DuplicateSkip { url: String },
    /// Extraction or validation rejected the page.
    ValidationFailure { url: String, reason: String },
    FetchFailure { url: String, reason: String },
    PersistFailure { url: String, reason: String },
}

impl Outcome {
    pub fn url(&self) -> &str {
        match self {
            Self::Success { url, .. }
            | Self::DuplicateSkip { url }
            | Self::ValidationFailure { url, .. }
            | Self::FetchFailure { url, .. }
            | Self::PersistFailure { url, .. } => url,
        }
    }

    fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::ValidationFailure { reason, .. }
            | Self::FetchFailure { reason, .. }
            | Self::PersistFailure { reason, .. } => Some(reason),
            Self::Success { .. } | Self::DuplicateSkip { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentArticle {
    pub title: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

/// Immutable, point-in-time view of run status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub run_id: Option<u64>,
    pub phase: Phase,
    pub total_discovered: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub requests_made: u64,
    /// Processed items per minute since the run started.
    pub rate_per_minute: f64,
    pub progress_percentage: f64,
    pub eta: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_url: Option<String>,
    pub last_error: Option<String>,
    /// Most recent successes, oldest first.
    pub recent: Vec<RecentArticle>,
}

impl ProgressSnapshot {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            phase: Phase::Idle,
            total_discovered: 0,
            processed: 0,
            succeeded: 0,
            duplicates: 0,
            failed: 0,
            requests_made: 0,
            rate_per_minute: 0.0,
            progress_percentage: 0.0,
            eta: None,
            started_at: None,
            finished_at: None,
            current_url: None,
            last_error: None,
            recent: Vec::new(),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.total_discovered.saturating_sub(self.processed)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.started_at?;
        Some(self.finished_at.unwrap_or(now) - start)
    }

    fn refresh_derived(&mut self, now: DateTime<Utc>) {
        self.progress_percentage = if self.total_discovered == 0 {
            0.0
        } else {
            self.processed as f64 / self.total_discovered as f64 * 100.0
        };

        let minutes = self
            .elapsed(now)
            .map(|d| d.num_milliseconds() as f64 / 60_000.0)
            .unwrap_or(0.0);
        self.rate_per_minute = if minutes > 0.0 {
            self.processed as f64 / minutes
        } else {
            0.0
        };

        self.eta = match (self.phase, self.remaining()) {
            (Phase::Running, remaining) if remaining > 0 && self.rate_per_minute > 0.0 => {
                let ms = remaining as f64 / self.rate_per_minute * 60_000.0;
                Some(now + Duration::milliseconds(ms as i64))
            }
            (Phase::Running, 0) if self.total_discovered > 0 => Some(now),
            _ => None,
        };
    }
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug)]
pub struct ProgressState {
    current: ArcSwap<ProgressSnapshot>,
    active: AtomicBool,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::new(Arc::new(ProgressSnapshot::idle())),
            active: AtomicBool::new(false),
        }
    }

    /// Current snapshot. Safe to call from any thread at any time.
    pub fn snapshot(&self) -> Arc<ProgressSnapshot> {
        self.current.load_full()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Begin a run, resetting all counters. Fails if a run is already active.
    pub fn start(&self, total_estimate: u64) -> Result<(), RunAlreadyActiveError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunAlreadyActiveError {
                run_id: self.snapshot().run_id,
            });
        }

        let now = Utc::now();
        let mut next = ProgressSnapshot::idle();
        next.phase = Phase::Running;
        next.total_discovered = total_estimate;
        next.started_at = Some(now);
        next.refresh_derived(now);
        self.current.store(Arc::new(next));
        Ok(())
    }

    pub fn set_run_id(&self, run_id: u64) {
        self.update(|s| s.run_id = Some(run_id));
    }

    /// Replace the estimate with the number of links actually discovered.
    pub fn set_total(&self, total: u64) {
        self.update(|s| s.total_discovered = total.max(s.processed));
    }

    pub fn set_current(&self, url: &str) {
        self.update(|s| s.current_url = Some(url.to_string()));
    }

    /// Record the running total of request attempts made to the source.
    pub fn observe_requests(&self, requests_made: u64) {
        self.update(|s| s.requests_made = s.requests_made.max(requests_made));
    }

    /// Count one processed item. Counts and rate change in a single swap.
    pub fn record(&self, outcome: Outcome) {
        self.update(|s| {
            s.processed += 1;
            s.total_discovered = s.total_discovered.max(s.processed);
            match &outcome {
                Outcome::Success { url, title } => {
                    s.succeeded += 1;
                    s.recent.push(RecentArticle {
                        title: title.clone(),
                        url: url.clone(),
                        timestamp: Utc::now(),
                    });
                    if s.recent.len() > RECENT_LIMIT {
                        let excess = s.recent.len() - RECENT_LIMIT;
                        s.recent.drain(..excess);
                    }
                }
                Outcome::DuplicateSkip { .. } => s.duplicates += 1,
                Outcome::ValidationFailure { .. }
                | Outcome::FetchFailure { .. }
                | Outcome::PersistFailure { .. } => s.failed += 1,
            }
            if let Some(reason) = outcome.failure_reason() {
                s.last_error = Some(format!("{}: {reason}", outcome.url()));
            }
        });
    }

    /// Move to a terminal phase and freeze counts. A no-op when no run is active.
    pub fn finish(&self, phase: Phase, error: Option<String>) {
        if !self.is_active() {
            return;
        }
        let terminal = if phase.is_terminal() { phase } else { Phase::Failed };
        let now = Utc::now();
        let mut next = (*self.current.load_full()).clone();
        next.phase = terminal;
        next.finished_at = Some(now);
        next.current_url = None;
        if error.is_some() {
            next.last_error = error;
        }
        next.refresh_derived(now);
        self.current.store(Arc::new(next));
        self.active.store(false, Ordering::SeqCst);
    }

    /// Undo a [`start`](Self::start) that never produced a run, restoring `previous`.
    pub fn abandon(&self, previous: Arc<ProgressSnapshot>) {
        if !self.is_active() {
            return;
        }
        self.current.store(previous);
        self.active.store(false, Ordering::SeqCst);
    }

    /// Writer-side copy-modify-swap; ignored once the run is frozen.
    fn update(&self, change: impl FnOnce(&mut ProgressSnapshot)) {
        let current = self.current.load_full();
        if current.phase != Phase::Running {
            return;
        }
        let mut next = (*current).clone();
        change(&mut next);
        next.refresh_derived(Utc::now());
        self.current.store(Arc::new(next));
    }
}
