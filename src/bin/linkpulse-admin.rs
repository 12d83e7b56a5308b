use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use linkpulse::app::Services;
use linkpulse::config::Config;
use linkpulse::models::{parse_date, RollupPeriod};
use linkpulse::scheduler::{JobKind, RunOutcome, RunRecord};
use linkpulse::storage::SqliteStore;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "linkpulse-admin")]
#[command(about = "Run linkpulse batch jobs on demand", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute rollups for one period
    Rollup {
        /// day, week or month
        #[arg(long, default_value = "day")]
        period: String,
        /// Any date inside the period (YYYY-MM-DD). Defaults to the last completed period.
        #[arg(long)]
        date: Option<String>,
    },
    /// Recompute cached trending for recently active users
    Trending,
    /// Purge raw events past retention, bounded by the rollup watermark
    Cleanup,
    /// Show the daily rollup watermark
    Watermark,
}

fn print_run(record: &RunRecord) {
    let outcome = match &record.outcome {
        RunOutcome::Succeeded => "succeeded".to_string(),
        RunOutcome::Failed { message } => format!("failed: {message}"),
        RunOutcome::Skipped => "skipped".to_string(),
    };
    println!("{:<16} {}", "Job", record.job);
    if let Some(window) = &record.window {
        println!("{:<16} {} .. {}", "Window", window.start, window.end);
    }
    println!("{:<16} {}", "Outcome", outcome);
    println!(
        "{:<16} {} processed, {} failed, {} total",
        "Links", record.processed, record.failed, record.total
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let store = Arc::new(
        SqliteStore::new(&config.database.url, config.database.max_connections).await?,
    );
    // Ensure database is initialized
    store.init().await?;
    let services = Services::build(store, &config)?;
    let scheduler = services.scheduler.clone();

    match cli.command {
        Commands::Rollup { period, date } => {
            let period: RollupPeriod = period.parse()?;
            let record = match date {
                Some(date) => {
                    let date = parse_date(&date).context("invalid --date")?;
                    scheduler.run_rollup_for(period, date).await
                }
                None => scheduler.run_job(JobKind::for_period(period), Utc::now()).await,
            };
            print_run(&record);
        }
        Commands::Trending => {
            let record = scheduler.run_job(JobKind::TrendingRefresh, Utc::now()).await;
            print_run(&record);
        }
        Commands::Cleanup => {
            let report = scheduler.cleanup(Utc::now()).await?;
            match report.cutoff {
                Some(cutoff) => println!("✓ Purged {} events older than {}", report.purged, cutoff),
                None => println!("⚠ No daily rollup has completed yet; nothing purged"),
            }
        }
        Commands::Watermark => match scheduler.watermark().await? {
            Some(watermark) => println!("Daily rollups complete up to {}", watermark),
            None => println!("No daily rollup has completed yet."),
        },
    }

    Ok(())
}
