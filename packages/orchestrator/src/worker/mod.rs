//! Worker poll-and-execute loop.
//!
//! Each cycle: drop finished tasks, reclaim stalled jobs, claim up to the
//! free slots, and launch one task per claimed job. Every job task runs a
//! pre-execution cancel guard and a sibling heartbeat task that renews the
//! claim lease and bridges the DB cancel flag into the in-process signal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::id::short_id;
use crate::error::EngineError;
use crate::kernel::OrchestratorKernel;
use crate::queue::RunJob;
use crate::services::execution::execute_run;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        Self {
            worker_id: format!("{host}-{}", short_id()),
            concurrency: settings.worker_concurrency,
            poll_interval: settings.worker_poll_interval,
        }
    }
}

pub struct Worker {
    kernel: Arc<OrchestratorKernel>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(kernel: Arc<OrchestratorKernel>) -> Self {
        let config = WorkerConfig::from_settings(&kernel.settings);
        Self { kernel, config }
    }

    pub fn with_config(kernel: Arc<OrchestratorKernel>, config: WorkerConfig) -> Self {
        Self { kernel, config }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until `shutdown` fires, then wait for active jobs to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            dialect = self.kernel.settings.dialect.as_str(),
            "worker started"
        );

        let mut active: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            active.retain(|handle| !handle.is_finished());

            match RunJob::reclaim_stalled(&self.kernel.pool, &self.kernel.settings).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "reclaimed stalled jobs"),
                Err(e) => error!(error = %e, "stalled-job reclaim failed"),
            }

            let slots = self.config.concurrency.saturating_sub(active.len()) as i64;
            if slots > 0 {
                match RunJob::claim(
                    &self.kernel.pool,
                    &self.kernel.settings,
                    &self.config.worker_id,
                    slots,
                )
                .await
                {
                    Ok(jobs) => {
                        for job in jobs {
                            let kernel = self.kernel.clone();
                            let worker_id = self.config.worker_id.clone();
                            active.push(tokio::spawn(async move {
                                execute_job(kernel, job, &worker_id).await;
                            }));
                        }
                    }
                    Err(e) => error!(error = %e, "failed to claim jobs"),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        if !active.is_empty() {
            info!(
                worker_id = %self.config.worker_id,
                count = active.len(),
                "waiting for running jobs to complete"
            );
            let drain = futures::future::join_all(active);
            if tokio::time::timeout(Duration::from_secs(30), drain)
                .await
                .is_err()
            {
                warn!("timed out waiting for running jobs; abandoning them to reclaim");
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }
}

/// Execute one claimed job: cancel guard, heartbeat, run, status mapping.
pub async fn execute_job(kernel: Arc<OrchestratorKernel>, job: RunJob, worker_id: &str) {
    // Pre-execution cancel guard
    match kernel
        .cancellations
        .check_and_signal(&kernel.pool, &job.run_id)
        .await
    {
        Ok(true) => {
            info!(
                job_id = %job.job_id,
                run_id = %job.run_id,
                "job cancelled before execution started"
            );
            if let Err(e) = RunJob::mark_cancelled(&kernel.pool, &job.job_id).await {
                error!(job_id = %job.job_id, error = %e, "failed to mark job cancelled");
            }
            if let Err(e) =
                crate::db::Run::update_status(&kernel.pool, &job.run_id, "canceled", None).await
            {
                error!(run_id = %job.run_id, error = %e, "failed to mark run canceled");
            }
            return;
        }
        Ok(false) => {}
        Err(e) => {
            error!(job_id = %job.job_id, error = %e, "cancel guard failed");
        }
    }

    // Heartbeat task: renew the claim lease and bridge the cancel flag
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_handle = {
        let kernel = kernel.clone();
        let job_id = job.job_id.clone();
        let run_id = job.run_id.clone();
        let token = heartbeat_cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(kernel.settings.worker_heartbeat_interval);
            interval.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) =
                            RunJob::heartbeat(&kernel.pool, &kernel.settings, &job_id).await
                        {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                        if let Err(e) = kernel
                            .cancellations
                            .check_and_signal(&kernel.pool, &run_id)
                            .await
                        {
                            warn!(run_id = %run_id, error = %e, "cancel bridge failed");
                        }
                    }
                }
            }
        })
    };

    info!(
        worker_id,
        job_id = %job.job_id,
        run_id = %job.run_id,
        attempt = job.attempts,
        max_attempts = job.max_attempts,
        "executing job"
    );
    let result = execute_run(&kernel, &job.run_id).await;

    match result {
        Ok(()) => {
            if let Err(e) = RunJob::mark_done(&kernel.pool, &job.job_id).await {
                error!(job_id = %job.job_id, error = %e, "failed to mark job done");
            }
            info!(job_id = %job.job_id, run_id = %job.run_id, "job completed");
        }
        Err(EngineError::Cancelled(_)) => {
            if let Err(e) = RunJob::mark_cancelled(&kernel.pool, &job.job_id).await {
                error!(job_id = %job.job_id, error = %e, "failed to mark job cancelled");
            }
            info!(job_id = %job.job_id, run_id = %job.run_id, "job cancelled");
        }
        Err(error) => {
            match RunJob::mark_failure(
                &kernel.pool,
                &kernel.settings,
                &job,
                &error.to_string(),
            )
            .await
            {
                Ok(status) => warn!(
                    job_id = %job.job_id,
                    run_id = %job.run_id,
                    attempt = job.attempts,
                    status,
                    error = %error,
                    "job failed"
                ),
                Err(e) => error!(job_id = %job.job_id, error = %e, "failed to record job failure"),
            }
        }
    }

    heartbeat_cancel.cancel();
    let _ = heartbeat_handle.await;
}
