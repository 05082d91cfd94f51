//! Step idempotency records.
//!
//! A `completed` row short-circuits re-execution on resume and replays its
//! stored result without dispatching again.

use serde_json::Value;
use sqlx::{AnyPool, FromRow};

use crate::common::time::now_ms;
use crate::error::EngineResult;

#[derive(Debug, Clone, FromRow)]
pub struct StepIdempotency {
    pub run_id: String,
    pub node_id: String,
    pub step_id: String,
    pub idempotency_key: Option<String>,
    pub status: String,
    pub result_json: Option<String>,
    pub updated_at: i64,
}

impl StepIdempotency {
    pub async fn find(
        pool: &AnyPool,
        run_id: &str,
        node_id: &str,
        step_id: &str,
    ) -> EngineResult<Option<StepIdempotency>> {
        let record = sqlx::query_as::<_, StepIdempotency>(
            "SELECT run_id, node_id, step_id, idempotency_key, status, result_json, updated_at \
             FROM step_idempotency WHERE run_id = $1 AND node_id = $2 AND step_id = $3",
        )
        .bind(run_id)
        .bind(node_id)
        .bind(step_id)
        .fetch_optional(pool)
        .await?;
        Ok(record)
    }

    /// Stored result when the step already completed, else `None`.
    pub async fn completed_result(
        pool: &AnyPool,
        run_id: &str,
        node_id: &str,
        step_id: &str,
    ) -> EngineResult<Option<Value>> {
        let record = Self::find(pool, run_id, node_id, step_id).await?;
        let Some(record) = record else {
            return Ok(None);
        };
        if record.status != "completed" {
            return Ok(None);
        }
        let Some(raw) = record.result_json else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        ))
    }

    pub async fn mark_started(
        pool: &AnyPool,
        run_id: &str,
        node_id: &str,
        step_id: &str,
        idempotency_key: Option<&str>,
    ) -> EngineResult<()> {
        Self::upsert(pool, run_id, node_id, step_id, idempotency_key, "started", None).await
    }

    pub async fn mark_completed(
        pool: &AnyPool,
        run_id: &str,
        node_id: &str,
        step_id: &str,
        result: Option<&Value>,
    ) -> EngineResult<()> {
        let result_json = result.map(serde_json::to_string).transpose()?;
        Self::upsert(
            pool,
            run_id,
            node_id,
            step_id,
            None,
            "completed",
            result_json.as_deref(),
        )
        .await
    }

    pub async fn mark_failed(
        pool: &AnyPool,
        run_id: &str,
        node_id: &str,
        step_id: &str,
    ) -> EngineResult<()> {
        Self::upsert(pool, run_id, node_id, step_id, None, "failed", None).await
    }

    /// Rowcount-guarded UPDATE-then-INSERT, portable across dialects.
    async fn upsert(
        pool: &AnyPool,
        run_id: &str,
        node_id: &str,
        step_id: &str,
        idempotency_key: Option<&str>,
        status: &str,
        result_json: Option<&str>,
    ) -> EngineResult<()> {
        let now = now_ms();
        let updated = sqlx::query(
            "UPDATE step_idempotency SET status = $1, \
             idempotency_key = COALESCE($2, idempotency_key), \
             result_json = COALESCE($3, result_json), \
             updated_at = $4 \
             WHERE run_id = $5 AND node_id = $6 AND step_id = $7",
        )
        .bind(status)
        .bind(idempotency_key)
        .bind(result_json)
        .bind(now)
        .bind(run_id)
        .bind(node_id)
        .bind(step_id)
        .execute(pool)
        .await?;
        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO step_idempotency (run_id, node_id, step_id, idempotency_key, \
                 status, result_json, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(run_id)
            .bind(node_id)
            .bind(step_id)
            .bind(idempotency_key)
            .bind(status)
            .bind(result_json)
            .bind(now)
            .execute(pool)
            .await?;
        }
        Ok(())
    }
}
