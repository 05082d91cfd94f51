//! Leader-gated retention sweep: prune old run events and artifacts.
//! Runs themselves are never deleted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::common::time::now_ms;
use crate::db::{Artifact, RunEvent};
use crate::error::EngineResult;
use crate::kernel::OrchestratorKernel;
use crate::leader::LeaderElection;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub async fn run_retention_loop(
    kernel: Arc<OrchestratorKernel>,
    leader: Arc<LeaderElection>,
    shutdown: CancellationToken,
) {
    info!("retention sweep loop started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(kernel.settings.retention_sweep_interval) => {}
        }
        if !leader.is_leader() {
            continue;
        }
        if let Err(e) = sweep_once(&kernel).await {
            error!(error = %e, "retention sweep failed");
        }
    }
    info!("retention sweep loop stopped");
}

pub async fn sweep_once(kernel: &Arc<OrchestratorKernel>) -> EngineResult<(u64, u64)> {
    let now = now_ms();
    let event_cutoff = now - kernel.settings.checkpoint_retention_days * DAY_MS;
    let artifact_cutoff = now - kernel.settings.artifact_retention_days * DAY_MS;

    let events_pruned = RunEvent::prune_before(&kernel.pool, event_cutoff).await?;
    let artifacts_pruned = Artifact::prune_before(&kernel.pool, artifact_cutoff).await?;
    if events_pruned > 0 || artifacts_pruned > 0 {
        info!(events_pruned, artifacts_pruned, "retention sweep pruned rows");
    }
    Ok((events_pruned, artifacts_pruned))
}
