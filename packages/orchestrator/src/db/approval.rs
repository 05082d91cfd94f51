//! Approval model. One pending approval per `(run_id, node_id)`, decided once.

use serde_json::Value;
use sqlx::{AnyPool, FromRow};

use crate::common::id::new_id;
use crate::common::time::now_ms;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, FromRow)]
pub struct Approval {
    pub approval_id: String,
    pub run_id: String,
    pub node_id: String,
    pub prompt: String,
    pub decision_type: String,
    pub options_json: Option<String>,
    pub context_data_json: Option<String>,
    pub status: String,
    pub decided_by: Option<String>,
    pub decision_json: Option<String>,
    pub created_at: i64,
    pub decided_at: Option<i64>,
    pub expires_at: Option<i64>,
}

const APPROVAL_COLUMNS: &str = "approval_id, run_id, node_id, prompt, decision_type, \
     options_json, context_data_json, status, decided_by, decision_json, created_at, \
     decided_at, expires_at";

impl Approval {
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        pool: &AnyPool,
        run_id: &str,
        node_id: &str,
        prompt: &str,
        decision_type: &str,
        options: Option<&Value>,
        context_data: Option<&Value>,
        expires_at: Option<i64>,
    ) -> EngineResult<Approval> {
        let approval_id = new_id();
        sqlx::query(
            "INSERT INTO approvals (approval_id, run_id, node_id, prompt, decision_type, \
             options_json, context_data_json, status, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&approval_id)
        .bind(run_id)
        .bind(node_id)
        .bind(prompt)
        .bind(decision_type)
        .bind(options.map(serde_json::to_string).transpose()?)
        .bind(context_data.map(serde_json::to_string).transpose()?)
        .bind("pending")
        .bind(now_ms())
        .bind(expires_at)
        .execute(pool)
        .await?;
        Self::find(pool, &approval_id)
            .await?
            .ok_or_else(|| EngineError::Other("approval vanished after insert".into()))
    }

    pub async fn find(pool: &AnyPool, approval_id: &str) -> EngineResult<Option<Approval>> {
        let approval = sqlx::query_as::<_, Approval>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE approval_id = $1"
        ))
        .bind(approval_id)
        .fetch_optional(pool)
        .await?;
        Ok(approval)
    }

    pub async fn find_pending(
        pool: &AnyPool,
        run_id: &str,
        node_id: &str,
    ) -> EngineResult<Option<Approval>> {
        let approval = sqlx::query_as::<_, Approval>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals \
             WHERE run_id = $1 AND node_id = $2 AND status = 'pending' LIMIT 1"
        ))
        .bind(run_id)
        .bind(node_id)
        .fetch_optional(pool)
        .await?;
        Ok(approval)
    }

    pub async fn list_pending_for_run(
        pool: &AnyPool,
        run_id: &str,
    ) -> EngineResult<Vec<Approval>> {
        let approvals = sqlx::query_as::<_, Approval>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals \
             WHERE run_id = $1 AND status = 'pending'"
        ))
        .bind(run_id)
        .fetch_all(pool)
        .await?;
        Ok(approvals)
    }

    /// Record a decision. Only pending approvals transition; returns the
    /// number of rows updated (0 when already decided).
    pub async fn decide(
        pool: &AnyPool,
        approval_id: &str,
        status: &str,
        decided_by: Option<&str>,
        decision: Option<&Value>,
    ) -> EngineResult<u64> {
        let result = sqlx::query(
            "UPDATE approvals SET status = $1, decided_by = $2, decision_json = $3, \
             decided_at = $4 WHERE approval_id = $5 AND status = 'pending'",
        )
        .bind(status)
        .bind(decided_by)
        .bind(decision.map(serde_json::to_string).transpose()?)
        .bind(now_ms())
        .bind(approval_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Pending approvals whose expiry has passed.
    pub async fn list_expired_pending(pool: &AnyPool, now: i64) -> EngineResult<Vec<Approval>> {
        let approvals = sqlx::query_as::<_, Approval>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals \
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= $1"
        ))
        .bind(now)
        .fetch_all(pool)
        .await?;
        Ok(approvals)
    }
}
