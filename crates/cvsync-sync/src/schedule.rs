use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::orchestrator::SyncOrchestrator;

/// Build the weekly sync job and the daily heartbeat job. Returns `None` when
/// scheduling is disabled. The caller starts the scheduler.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sync_cron = &config.sync_cron;
    let runner = orchestrator.clone();
    let job = Job::new_async(sync_cron.as_str(), move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            info!("scheduled sync triggered");
            if let Some(summary) = runner.trigger().await {
                if summary.has_fatal_error() {
                    warn!(run_id = %summary.run_id, "scheduled sync aborted");
                }
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {sync_cron}"))?;
    sched.add(job).await.context("adding sync job")?;

    let health_cron = &config.health_cron;
    let job = Job::new_async(health_cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            orchestrator.heartbeat();
        })
    })
    .with_context(|| format!("creating heartbeat job for cron {health_cron}"))?;
    sched.add(job).await.context("adding heartbeat job")?;

    info!(sync = %sync_cron, health = %health_cron, "scheduler configured");
    Ok(Some(sched))
}
