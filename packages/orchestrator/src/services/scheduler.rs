//! Leader-gated cron scheduler for `scheduled` triggers.
//!
//! Each sync cycle reconciles enabled registrations into cron jobs: new
//! registrations are added, stale ones removed. On leadership loss every
//! job is dropped; the next leader cycle rebuilds them from the DB.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::kernel::OrchestratorKernel;
use crate::leader::LeaderElection;

use super::triggers::fire_trigger;

/// Widen a 5-field cron expression (`minute hour dom month dow`) to the
/// scheduler's 6-field form by prefixing a seconds column.
pub fn widen_cron(expr: &str) -> EngineResult<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(EngineError::Other(format!(
            "cron expression '{expr}' has {n} fields; expected 5"
        ))),
    }
}

pub async fn run_scheduler_loop(
    kernel: Arc<OrchestratorKernel>,
    leader: Arc<LeaderElection>,
    shutdown: CancellationToken,
) {
    let mut scheduler = match JobScheduler::new().await {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!(error = %e, "failed to create cron scheduler");
            return;
        }
    };
    if let Err(e) = scheduler.start().await {
        error!(error = %e, "failed to start cron scheduler");
        return;
    }
    info!("trigger scheduler started");

    // registration key "procedure_id|version" -> cron job id
    let mut jobs: HashMap<String, Uuid> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(kernel.settings.scheduler_sync_interval) => {}
        }

        if !leader.is_leader() {
            // Drop every job on leadership loss; the baseline is rebuilt
            // from the DB when leadership returns
            for (key, job_id) in jobs.drain() {
                if let Err(e) = scheduler.remove(&job_id).await {
                    warn!(key = %key, error = %e, "failed to remove cron job");
                }
            }
            continue;
        }

        if let Err(e) = sync_schedules(&kernel, &scheduler, &mut jobs).await {
            error!(error = %e, "trigger schedule sync failed");
        }
    }

    if let Err(e) = scheduler.shutdown().await {
        warn!(error = %e, "cron scheduler shutdown failed");
    }
    info!("trigger scheduler stopped");
}

/// Reconcile cron jobs with the enabled `scheduled` registrations.
pub async fn sync_schedules(
    kernel: &Arc<OrchestratorKernel>,
    scheduler: &JobScheduler,
    jobs: &mut HashMap<String, Uuid>,
) -> EngineResult<()> {
    let registrations = crate::db::TriggerRegistration::list_enabled(&kernel.pool).await?;
    let scheduled: Vec<_> = registrations
        .into_iter()
        .filter(|r| r.trigger_type == "scheduled" && r.schedule.is_some())
        .collect();
    let active_keys: std::collections::HashSet<String> = scheduled
        .iter()
        .map(|r| format!("{}|{}", r.procedure_id, r.version))
        .collect();

    // Remove stale jobs
    let stale: Vec<String> = jobs
        .keys()
        .filter(|key| !active_keys.contains(*key))
        .cloned()
        .collect();
    for key in stale {
        if let Some(job_id) = jobs.remove(&key) {
            if let Err(e) = scheduler.remove(&job_id).await {
                warn!(key = %key, error = %e, "failed to remove stale cron job");
            } else {
                info!(key = %key, "removed stale cron job");
            }
        }
    }

    // Add new jobs
    for registration in scheduled {
        let key = format!("{}|{}", registration.procedure_id, registration.version);
        if jobs.contains_key(&key) {
            continue;
        }
        let Some(schedule) = registration.schedule.as_deref() else {
            continue;
        };
        let widened = match widen_cron(schedule) {
            Ok(widened) => widened,
            Err(e) => {
                warn!(key = %key, error = %e, "skipping registration with bad cron expression");
                continue;
            }
        };

        let kernel_for_job = kernel.clone();
        let procedure_id = registration.procedure_id.clone();
        let version = registration.version.clone();
        let cron_job = Job::new_async(widened.as_str(), move |_job_id, _scheduler| {
            let kernel = kernel_for_job.clone();
            let procedure_id = procedure_id.clone();
            let version = version.clone();
            Box::pin(async move {
                info!(procedure_id = %procedure_id, version = %version, "cron trigger firing");
                match fire_trigger(
                    &kernel,
                    &procedure_id,
                    &version,
                    "scheduled",
                    "scheduler",
                    None,
                )
                .await
                {
                    Ok(run) => info!(run_id = %run.run_id, "cron trigger created run"),
                    Err(e) => error!(
                        procedure_id = %procedure_id,
                        version = %version,
                        error = %e,
                        "cron trigger failed"
                    ),
                }
            })
        })
        .map_err(|e| EngineError::Other(format!("failed to build cron job: {e}")))?;

        let job_id = scheduler
            .add(cron_job)
            .await
            .map_err(|e| EngineError::Other(format!("failed to register cron job: {e}")))?;
        info!(key = %key, schedule = %schedule, "registered cron job");
        jobs.insert(key, job_id);
    }

    Ok(())
}
