//! Durable run-job queue over the `run_jobs` table.
//!
//! One job per run (unique `run_id`): enqueue-while-prior-job-exists is an
//! UPDATE-in-place on the same row.
//!
//! Claiming is dialect-aware:
//!   PostgreSQL — `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction,
//!                correct under any number of concurrent workers.
//!   SQLite     — candidate select, then an optimistic UPDATE guarded on
//!                status; rows-affected of 1 means the claim won.
//!
//! Job lifecycle:
//!   queued / retrying
//!     v   claim()
//!   running   <- heartbeat renews locked_until
//!     v
//!   done      (success)
//!   failed    (attempts >= max_attempts)
//!   retrying  (retriable failure, available_at pushed out)
//!   cancelled (run cancellation observed before/during execution)

use sqlx::{AnyPool, FromRow};

use crate::common::id::new_id;
use crate::common::time::now_ms;
use crate::config::{DbDialect, Settings};
use crate::error::EngineResult;

#[derive(Debug, Clone, FromRow)]
pub struct RunJob {
    pub job_id: String,
    pub run_id: String,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub available_at: i64,
    pub locked_by: Option<String>,
    pub locked_until: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const JOB_COLUMNS: &str = "job_id, run_id, status, priority, attempts, max_attempts, \
     available_at, locked_by, locked_until, error_message, created_at, updated_at";

impl RunJob {
    /// Queue a new job for a run. Fails on a second job for the same run;
    /// use [`RunJob::requeue`] to reuse the existing row.
    pub async fn enqueue(
        pool: &AnyPool,
        run_id: &str,
        priority: i64,
        max_attempts: i64,
    ) -> EngineResult<RunJob> {
        let now = now_ms();
        let job = RunJob {
            job_id: new_id(),
            run_id: run_id.to_string(),
            status: "queued".to_string(),
            priority,
            attempts: 0,
            max_attempts,
            available_at: now,
            locked_by: None,
            locked_until: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO run_jobs (job_id, run_id, status, priority, attempts, max_attempts, \
             available_at, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&job.job_id)
        .bind(&job.run_id)
        .bind(&job.status)
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.available_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(pool)
        .await?;
        Ok(job)
    }

    /// Re-queue a run: update the existing row in place (status back to
    /// queued, attempts reset, lock cleared), inserting when absent.
    pub async fn requeue(
        pool: &AnyPool,
        run_id: &str,
        priority: i64,
        max_attempts: i64,
    ) -> EngineResult<RunJob> {
        let now = now_ms();
        let updated = sqlx::query(
            "UPDATE run_jobs SET status = 'queued', priority = $1, attempts = 0, \
             available_at = $2, locked_by = NULL, locked_until = NULL, error_message = NULL, \
             updated_at = $3 WHERE run_id = $4",
        )
        .bind(priority)
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Self::enqueue(pool, run_id, priority, max_attempts).await;
        }
        Self::find_by_run(pool, run_id).await?.ok_or_else(|| {
            crate::error::EngineError::Other("run job vanished after requeue".into())
        })
    }

    pub async fn find(pool: &AnyPool, job_id: &str) -> EngineResult<Option<RunJob>> {
        let job = sqlx::query_as::<_, RunJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM run_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    pub async fn find_by_run(pool: &AnyPool, run_id: &str) -> EngineResult<Option<RunJob>> {
        let job = sqlx::query_as::<_, RunJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM run_jobs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    /// Claim up to `slots` eligible jobs for `worker_id`.
    pub async fn claim(
        pool: &AnyPool,
        settings: &Settings,
        worker_id: &str,
        slots: i64,
    ) -> EngineResult<Vec<RunJob>> {
        if slots <= 0 {
            return Ok(Vec::new());
        }
        match settings.dialect {
            DbDialect::Postgres => Self::claim_postgres(pool, settings, worker_id, slots).await,
            DbDialect::Sqlite => Self::claim_sqlite(pool, settings, worker_id, slots).await,
        }
    }

    async fn claim_postgres(
        pool: &AnyPool,
        settings: &Settings,
        worker_id: &str,
        slots: i64,
    ) -> EngineResult<Vec<RunJob>> {
        let now = now_ms();
        let locked_until = now + settings.worker_lock_duration.as_millis() as i64;

        let mut tx = pool.begin().await?;
        let job_ids: Vec<String> = sqlx::query_scalar(
            "SELECT job_id FROM run_jobs \
             WHERE status IN ('queued', 'retrying') AND available_at <= $1 \
             ORDER BY priority DESC, available_at ASC \
             LIMIT $2 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .bind(slots)
        .fetch_all(&mut *tx)
        .await?;
        if job_ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }
        for job_id in &job_ids {
            sqlx::query(
                "UPDATE run_jobs SET status = 'running', locked_by = $1, locked_until = $2, \
                 attempts = attempts + 1, updated_at = $3 WHERE job_id = $4",
            )
            .bind(worker_id)
            .bind(locked_until)
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut claimed = Vec::with_capacity(job_ids.len());
        for job_id in &job_ids {
            if let Some(job) = Self::find(pool, job_id).await? {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn claim_sqlite(
        pool: &AnyPool,
        settings: &Settings,
        worker_id: &str,
        slots: i64,
    ) -> EngineResult<Vec<RunJob>> {
        let now = now_ms();
        let locked_until = now + settings.worker_lock_duration.as_millis() as i64;

        let candidates = sqlx::query_as::<_, RunJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM run_jobs \
             WHERE status IN ('queued', 'retrying') AND available_at <= $1 \
             ORDER BY priority DESC, available_at ASC \
             LIMIT $2"
        ))
        .bind(now)
        .bind(slots)
        .fetch_all(pool)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut job in candidates {
            let updated = sqlx::query(
                "UPDATE run_jobs SET status = 'running', locked_by = $1, locked_until = $2, \
                 attempts = attempts + 1, updated_at = $3 \
                 WHERE job_id = $4 AND status IN ('queued', 'retrying')",
            )
            .bind(worker_id)
            .bind(locked_until)
            .bind(now)
            .bind(&job.job_id)
            .execute(pool)
            .await?;
            if updated.rows_affected() == 1 {
                job.status = "running".to_string();
                job.locked_by = Some(worker_id.to_string());
                job.locked_until = Some(locked_until);
                job.attempts += 1;
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    /// Reset stalled jobs (lock expired while still running) back to
    /// retrying, or to failed once max_attempts is exhausted. Returns the
    /// number of jobs touched.
    pub async fn reclaim_stalled(pool: &AnyPool, settings: &Settings) -> EngineResult<u64> {
        let now = now_ms();
        let stalled = sqlx::query_as::<_, RunJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM run_jobs \
             WHERE status = 'running' AND locked_until IS NOT NULL AND locked_until < $1"
        ))
        .bind(now)
        .fetch_all(pool)
        .await?;

        let mut reclaimed = 0u64;
        for job in stalled {
            let max_attempts = if job.max_attempts > 0 {
                job.max_attempts
            } else {
                settings.worker_max_attempts
            };
            if job.attempts >= max_attempts {
                sqlx::query(
                    "UPDATE run_jobs SET status = 'failed', \
                     error_message = 'Exceeded max_attempts: last lock expired without completion', \
                     updated_at = $1 WHERE job_id = $2",
                )
                .bind(now)
                .bind(&job.job_id)
                .execute(pool)
                .await?;
                tracing::warn!(
                    job_id = %job.job_id,
                    run_id = %job.run_id,
                    "job permanently failed: max attempts exceeded"
                );
            } else {
                let retry_delay_ms =
                    settings.worker_retry_delay.as_millis() as i64 * job.attempts.max(1);
                sqlx::query(
                    "UPDATE run_jobs SET status = 'retrying', locked_by = NULL, \
                     locked_until = NULL, available_at = $1, updated_at = $2 WHERE job_id = $3",
                )
                .bind(now + retry_delay_ms)
                .bind(now)
                .bind(&job.job_id)
                .execute(pool)
                .await?;
                tracing::info!(
                    job_id = %job.job_id,
                    run_id = %job.run_id,
                    attempt = job.attempts,
                    "reclaimed stalled job"
                );
            }
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    pub async fn mark_done(pool: &AnyPool, job_id: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE run_jobs SET status = 'done', locked_by = NULL, locked_until = NULL, \
             updated_at = $1 WHERE job_id = $2",
        )
        .bind(now_ms())
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record an execution failure: retrying with backoff while attempts
    /// remain, failed otherwise. Returns the new status.
    pub async fn mark_failure(
        pool: &AnyPool,
        settings: &Settings,
        job: &RunJob,
        error_message: &str,
    ) -> EngineResult<&'static str> {
        let now = now_ms();
        let max_attempts = if job.max_attempts > 0 {
            job.max_attempts
        } else {
            settings.worker_max_attempts
        };
        let truncated: String = error_message.chars().take(2000).collect();
        if job.attempts < max_attempts {
            let retry_delay_ms =
                settings.worker_retry_delay.as_millis() as i64 * job.attempts.max(1);
            sqlx::query(
                "UPDATE run_jobs SET status = 'retrying', locked_by = NULL, \
                 locked_until = NULL, available_at = $1, error_message = $2, updated_at = $3 \
                 WHERE job_id = $4",
            )
            .bind(now + retry_delay_ms)
            .bind(&truncated)
            .bind(now)
            .bind(&job.job_id)
            .execute(pool)
            .await?;
            Ok("retrying")
        } else {
            sqlx::query(
                "UPDATE run_jobs SET status = 'failed', locked_by = NULL, \
                 locked_until = NULL, error_message = $1, updated_at = $2 WHERE job_id = $3",
            )
            .bind(&truncated)
            .bind(now)
            .bind(&job.job_id)
            .execute(pool)
            .await?;
            Ok("failed")
        }
    }

    /// Cancellation does not consume an attempt.
    pub async fn mark_cancelled(pool: &AnyPool, job_id: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE run_jobs SET status = 'cancelled', locked_by = NULL, locked_until = NULL, \
             updated_at = $1 WHERE job_id = $2",
        )
        .bind(now_ms())
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Extend the claim lease (heartbeat).
    pub async fn heartbeat(
        pool: &AnyPool,
        settings: &Settings,
        job_id: &str,
    ) -> EngineResult<()> {
        let now = now_ms();
        let locked_until = now + settings.worker_lock_duration.as_millis() as i64;
        sqlx::query(
            "UPDATE run_jobs SET locked_until = $1, updated_at = $2 \
             WHERE job_id = $3 AND status = 'running'",
        )
        .bind(locked_until)
        .bind(now)
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
