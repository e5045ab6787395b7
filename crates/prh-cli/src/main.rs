use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prh_harvest::{HarvestConfig, HarvestPipeline};
use prh_source::{ApiConfig, OpenReviewSource};
use prh_store::{Store, Table};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "prh")]
#[command(about = "Peer-review harvester for OpenReview-style venues")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full three-stage harvest (papers, reviews, decisions).
    Harvest,
    /// Print row counts for the harvest database.
    Stats,
}

/// Console plus an append-mode log file, both behind the env filter.
fn init_logging(log_path: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
        .init();
    Ok(())
}

async fn run_harvest(config: HarvestConfig) -> Result<()> {
    let store = Store::open(&config.database_path)
        .await
        .context("opening harvest database")?;
    let source = OpenReviewSource::connect(ApiConfig::from_env())
        .await
        .context("connecting to the review platform")?;
    let pipeline = HarvestPipeline::new(config, Arc::new(source), store)?;

    let summary = pipeline.run().await.context("running harvest")?;
    println!(
        "harvest {} for {}: papers {}/{} reviews {}/{} decisions {}/{}",
        summary.run_id,
        summary.venue_id,
        summary.papers.ingested,
        summary.papers.found,
        summary.reviews.ingested,
        summary.reviews.found,
        summary.decisions.ingested,
        summary.decisions.found,
    );
    Ok(())
}

async fn run_stats(config: HarvestConfig) -> Result<()> {
    let store = Store::open(&config.database_path)
        .await
        .context("opening harvest database")?;
    for table in [Table::Papers, Table::Reviews, Table::PaperReviewMapping] {
        let count = store.count(table).await?;
        println!("{}: {count}", table.name());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_path = std::env::var("PRH_LOG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("harvest.log"));
    init_logging(&log_path)?;

    let config = HarvestConfig::from_env();
    info!(venue = %config.venue_id, db = %config.database_path.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => run_harvest(config).await,
        Commands::Stats => run_stats(config).await,
    }
}
