//! Command-line interface definitions.
//!
//! Global options can come from flags or environment variables and override the
//! values loaded from the optional YAML config file.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Ingest Charleston RiverDogs news into SQLite with a JSON backup tree.
///
/// # Examples
///
/// ```sh
/// # Run an ingestion with a live monitor every 5 seconds
/// charleston_news run --monitor-interval 5
///
/// # Search stored articles
/// charleston_news search "opening day" --per-page 20
///
/// # Machine-readable status
/// charleston_news --db data/news.db status --json
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to config.yaml file
    #[arg(short, long, env = "CHARLESTON_NEWS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, env = "CHARLESTON_NEWS_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Directory for JSON backup files
    #[arg(long, env = "CHARLESTON_NEWS_BACKUP_DIR", global = true)]
    pub backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one ingestion pass over the news listing
    Run(RunArgs),
    /// Show storage, health and last-run status
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Search stored articles by title or content
    Search {
        query: String,
        #[command(flatten)]
        page: PageArgs,
    },
    /// List stored articles, newest first
    List {
        #[command(flatten)]
        page: PageArgs,
    },
    /// Print one stored article as JSON
    Show { key: String },
    /// Repair divergence between the database and the backup tree
    Reconcile,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Re-persist every article, overwriting stored rows and backups
    #[arg(long)]
    pub reingest: bool,

    /// Stop after this many article links
    #[arg(long, env = "CHARLESTON_NEWS_MAX_ARTICLES")]
    pub max_articles: Option<usize>,

    /// Seconds between live monitor frames (0 disables the monitor)
    #[arg(long, default_value_t = 30)]
    pub monitor_interval: u64,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct PageArgs {
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    #[arg(long, default_value_t = 10)]
    pub per_page: u32,
}
