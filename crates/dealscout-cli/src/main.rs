use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dealscout_pipeline::{build_scheduler, prune_expired, PipelineConfig, RunOutcome};
use dealscout_storage::AlertStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod wiring;

#[derive(Debug, Parser)]
#[command(name = "dealscout-cli")]
#[command(about = "DealScout retail-arbitrage alert pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run,
    /// Run on the configured cron until interrupted.
    Schedule,
    /// Delete alert records older than the retention window.
    Prune {
        #[arg(long)]
        dry_run: bool,
    },
    /// List alert records and whether they still suppress repeats.
    History {
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations to the Postgres alert store.
    Migrate,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = wiring::build_pipeline(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} outcome={:?} collected={} accepted={} reports={}",
                summary.run_id,
                summary.outcome,
                summary.collected,
                summary.accepted,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            if matches!(
                summary.outcome,
                RunOutcome::SourceUnavailable | RunOutcome::DeliveryFailed
            ) {
                std::process::exit(2);
            }
        }
        Commands::Schedule => {
            let cron = config.scheduler_cron.clone();
            let pipeline = Arc::new(wiring::build_pipeline(config).await?);
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler started; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Prune { dry_run } => {
            let store = wiring::open_store(&config).await?;
            let now = Utc::now();
            if dry_run {
                let stale = store
                    .list_older_than(now - config.alert_retention)
                    .await
                    .context("listing expired alert records")?;
                for record in &stale {
                    println!("{}\t{}", record.source_id, record.alerted_at.to_rfc3339());
                }
                println!("{} record(s) would be pruned", stale.len());
            } else {
                let removed = prune_expired(store.as_ref(), config.alert_retention, now).await?;
                println!("pruned {removed} record(s)");
            }
        }
        Commands::History { json } => {
            let store = wiring::open_store(&config).await?;
            let now = Utc::now();
            let records = store.load_all().await.context("loading alert records")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    let state = if record.is_expired(now, config.alert_retention) {
                        "expired"
                    } else {
                        "active"
                    };
                    println!(
                        "{}\t{}\t{}",
                        record.source_id,
                        record.alerted_at.to_rfc3339(),
                        state
                    );
                }
                println!("{} record(s)", records.len());
            }
        }
        Commands::Migrate => {
            if config.database_url.is_none() {
                anyhow::bail!("DEALSCOUT_DATABASE_URL is not set; the json store needs no migrations");
            }
            wiring::open_store(&config).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
