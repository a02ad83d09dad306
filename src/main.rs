//! analytics-sync - web analytics for a data catalog
//!
//! Pulls per-day usage from the reporting API into a local stats store:
//! - Dataset page visits, entrances and download events
//! - Resource downloads
//! - Sessions per visitor country
//!
//! and relays API calls and downloads to the collector as tracking events.

mod config;
mod db;
mod error;
mod ingest;
mod relay;
mod web;

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use db::{DatasetMetric, SortOrder};
use ingest::query::HttpReportingApi;
use ingest::Ingestor;
use relay::EventRelay;

/// Datasets listed by `dump`
const DUMP_LIMIT: i64 = 20;

#[derive(Parser)]
#[command(name = "analytics-sync", version, about = "Web analytics import and event relay")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drop and recreate the stats tables
    Init,
    /// Create missing tables and columns
    Migrate,
    /// Import analytics from the reporting API
    Load {
        /// Re-import from this day instead of the latest stored day
        #[arg(long, value_name = "YYYY-MM-DD")]
        start_date: Option<NaiveDate>,
    },
    /// Print last month's most visited datasets
    Dump,
    /// Serve the stats API and relay tracking events
    Serve,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = config::Config::load(&cli.config)?;
    init_logging(&config.logging.level);
    info!("Configuration loaded");

    let db = db::Database::new(&config.database).await?;

    match cli.command {
        Command::Init => {
            db.reset().await?;
            info!("Stats tables recreated");
        }
        Command::Migrate => {
            db.run_migrations().await?;
            info!("Stats tables migrated");
        }
        Command::Load { start_date } => load(&config, db, start_date).await?,
        Command::Dump => dump(&db).await?,
        Command::Serve => serve(&config, db).await?,
    }

    Ok(())
}

async fn load(config: &config::Config, db: db::Database, start_date: Option<NaiveDate>) -> Result<()> {
    config.validate_reporting()?;
    db.run_migrations().await?;

    let api = Arc::new(HttpReportingApi::new(&config.reporting)?);
    let ingestor = Ingestor::new(api, db, &config.reporting);
    let outcomes = ingestor.run(start_date, Utc::now().date_naive()).await;

    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| o.result.is_err())
        .map(|o| o.report)
        .collect();
    if !failed.is_empty() {
        error!("{} of {} report types failed", failed.len(), outcomes.len());
        anyhow::bail!("analytics load incomplete: {}", failed.join(", "));
    }

    info!("Analytics load complete");
    Ok(())
}

/// First and last day of the calendar month before `today`
fn previous_month(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let end = today.with_day(1).unwrap_or(today) - Duration::days(1);
    let start = end.with_day(1).unwrap_or(end);
    (start, end)
}

async fn dump(db: &db::Database) -> Result<()> {
    let (start, end) = previous_month(Utc::now().date_naive());
    let totals = db
        .dataset_totals(start, end, Some(DUMP_LIMIT), SortOrder::Descending, DatasetMetric::Visits)
        .await?;

    println!("Most visited datasets {} .. {}", start, end);
    for total in totals {
        println!(
            "{:>8} {:>8} {:>8}  {}",
            total.visits,
            total.entrances,
            total.downloads,
            total.name.as_deref().unwrap_or(&total.dataset_id)
        );
    }
    Ok(())
}

async fn serve(config: &config::Config, db: db::Database) -> Result<()> {
    db.run_migrations().await?;
    info!("Database initialized");

    let relay = if config.tracking.track_events {
        let collector = relay::collector::from_config(&config.tracking)?;
        if config.tracking.test_mode {
            info!("Tracking in test mode; events are logged, not sent");
        }
        Some(EventRelay::start(collector, config.tracking.workers))
    } else {
        None
    };

    // Warm the top-list caches
    web::warm_cache(&db).await;

    web::start_server(config, db, relay).await?;

    Ok(())
}
