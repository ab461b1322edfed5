use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use planilla_storage::read_snapshot;
use planilla_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "planilla-cli")]
#[command(about = "Harvests the public payroll reports of Panama's comptroller portal")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every institution and status if the portal has new data.
    Sync {
        /// Run even when the portal stamp is not newer than the checkpoint.
        #[arg(long)]
        force: bool,
    },
    /// Compare the portal stamp with the checkpoint without harvesting.
    Check,
    /// Refresh the persisted institution catalog.
    Catalog,
    /// Print the rows of a snapshot as JSON lines.
    Inspect {
        path: PathBuf,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run the gated sync on the configured cron schedule until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,planilla=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { force: false }) {
        Commands::Sync { force } => {
            let summary = planilla_sync::run_sync_once_from_env(force).await?;
            match (&summary.report, &summary.report_path) {
                (Some(report), Some(path)) => println!(
                    "sync complete: run_id={} attempted={} first_pass={} retried={} failing={} cancelled={} checkpoint_committed={} report={}",
                    summary.run_id,
                    report.attempted,
                    report.first_pass,
                    report.retried_ok,
                    report.still_failing,
                    report.cancelled,
                    summary.checkpoint_committed,
                    path.display()
                ),
                _ => println!(
                    "up to date: portal={} checkpoint={}",
                    summary.decision.candidate,
                    summary
                        .decision
                        .previous
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "none".to_string())
                ),
            }
        }
        Commands::Check => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
            let decision = pipeline.check().await?;
            println!(
                "portal={} checkpoint={} new_data={}",
                decision.candidate,
                decision
                    .previous
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                decision.proceed
            );
        }
        Commands::Catalog => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
            let catalog = pipeline.refresh_catalog().await?;
            for institution in &catalog {
                println!("{institution}");
            }
            eprintln!(
                "{} institutions in {}",
                catalog.len(),
                pipeline.config().catalog_path.display()
            );
        }
        Commands::Inspect { path, limit } => {
            let records = read_snapshot(&path)?;
            for record in records.iter().take(limit) {
                println!(
                    "{}",
                    serde_json::to_string(record).context("serializing record")?
                );
            }
            eprintln!("{} rows in {}", records.len(), path.display());
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
