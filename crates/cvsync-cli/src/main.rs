use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cvsync_core::{FileOutcome, RunStatus};
use cvsync_sync::{
    maybe_build_scheduler, run_once, Heartbeat, PgStore, RunOptions, SourceRegistry, SyncConfig,
    SyncOrchestrator,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cvsync")]
#[command(about = "Mirror ClinVar tab-delimited releases into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync now.
    Sync {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the weekly sync and daily heartbeat until interrupted.
    Schedule,
    /// Print registry and schedule state.
    Heartbeat,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let Some(summary) = run_once(&config).await? else {
                bail!("another sync run is already in progress");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let loaded = summary
                    .files
                    .iter()
                    .filter(|f| f.outcome == FileOutcome::Succeeded)
                    .count();
                println!(
                    "sync complete: run_id={} status={} files_loaded={} errors={}",
                    summary.run_id,
                    summary.status(),
                    loaded,
                    summary.errors.len()
                );
            }
            if summary.status() != RunStatus::Success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set CVSYNC_SCHEDULER_ENABLED=true");
            }
            let orchestrator = Arc::new(SyncOrchestrator::from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, orchestrator).await? else {
                bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Heartbeat => {
            let registry = SourceRegistry::load(&config.sources_file).await?;
            let beat = Heartbeat::new(Vec::new(), &registry, &RunOptions::from_config(&config));
            println!("{beat}");
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}
