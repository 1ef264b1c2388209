//! # Charleston News
//!
//! Ingests articles from the Charleston RiverDogs news listing into a SQLite database,
//! mirrors each stored article as a JSON backup file, and reports live progress.
//!
//! ## Usage
//!
//! ```sh
//! charleston_news run --monitor-interval 5
//! charleston_news status
//! charleston_news search "opening day"
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: fetch the listing page and collect article links
//! 2. **Ingestion**: fetch, extract, validate and persist each link in order
//! 3. **Observation**: the monitor reads the shared progress snapshot while the run writes

use std::error::Error;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

use charleston_news::config::Config;
use charleston_news::models::{PageRequest, Phase};
use charleston_news::pipeline::{Pipeline, RunOptions};
use charleston_news::report::{render_page, render_progress, render_status};

mod cli;

use cli::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(dir) = args.backup_dir {
        config.backup_dir = dir;
    }
    info!(
        db = %config.database_path.display(),
        backups = %config.backup_dir.display(),
        "Configuration loaded"
    );

    let pipeline = Pipeline::open(config).await?;

    match args.command {
        Command::Run(run) => run_with_monitor(&pipeline, run).await?,
        Command::Status { json } => {
            let (stats, health) = tokio::join!(pipeline.get_storage_stats(), pipeline.health());
            let stats = stats?;
            if json {
                let progress = pipeline.get_progress();
                let body = serde_json::json!({
                    "timestamp": Utc::now(),
                    "storage": stats,
                    "health": health,
                    "progress": progress.as_ref(),
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                print!("{}", render_status(&stats, &health));
            }
        }
        Command::Search { query, page } => {
            let page = PageRequest::new(page.page, page.per_page);
            let results = pipeline.search_articles(&query, page).await?;
            print!("{}", render_page(&results));
        }
        Command::List { page } => {
            let page = PageRequest::new(page.page, page.per_page);
            print!("{}", render_page(&pipeline.list_articles(page).await?));
        }
        Command::Show { key } => match pipeline.get_article(&key).await? {
            Some(article) => println!("{}", serde_json::to_string_pretty(&article)?),
            None => return Err(format!("no article with key {key}").into()),
        },
        Command::Reconcile => {
            let report = pipeline.reconcile().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    let elapsed = start_time.elapsed();
    info!(?elapsed, secs = elapsed.as_secs(), "Execution complete");
    Ok(())
}

/// Start a run and print a monitor frame every interval until it finishes.
#[instrument(level = "info", skip(pipeline))]
async fn run_with_monitor(pipeline: &Pipeline, args: RunArgs) -> Result<(), Box<dyn Error>> {
    let options = RunOptions {
        reingest: args.reingest,
        max_articles: args.max_articles,
    };
    let handle = pipeline.start_run(options).await?;
    let run_id = handle.run_id();

    let mut ticker = (args.monitor_interval > 0).then(|| {
        let mut t = tokio::time::interval(Duration::from_secs(args.monitor_interval));
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    let wait = handle.wait();
    tokio::pin!(wait);
    let summary = loop {
        tokio::select! {
            result = &mut wait => break result?,
            () = next_tick(&mut ticker) => {
                println!("{}", render_progress(&pipeline.get_progress(), Utc::now()));
            }
        }
    };

    println!("{}", render_progress(&pipeline.get_progress(), Utc::now()));
    if summary.phase == Phase::Failed {
        let reason = summary.last_error.unwrap_or_else(|| "unknown error".to_string());
        error!(run_id, %reason, "Run failed");
        return Err(format!("run {run_id} failed: {reason}").into());
    }
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => futures::future::pending().await,
    }
}
