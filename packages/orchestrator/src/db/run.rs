//! Run, run-event and artifact models.

use serde_json::Value;
use sqlx::{AnyPool, FromRow};

use crate::common::id::new_id;
use crate::common::time::now_ms;
use crate::error::EngineResult;

/// One execution attempt of a procedure version.
#[derive(Debug, Clone, FromRow)]
pub struct Run {
    pub run_id: String,
    pub procedure_id: String,
    pub procedure_version: String,
    pub thread_id: String,
    pub status: String,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub input_vars_json: Option<String>,
    pub output_vars_json: Option<String>,
    pub last_node_id: Option<String>,
    pub last_step_id: Option<String>,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub estimated_cost_usd: f64,
    pub error_message: Option<String>,
    pub parent_run_id: Option<String>,
    pub trigger_type: Option<String>,
    pub triggered_by: Option<String>,
    pub cancellation_requested: i64,
    pub project_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const RUN_COLUMNS: &str = "run_id, procedure_id, procedure_version, thread_id, status, \
     started_at, ended_at, input_vars_json, output_vars_json, last_node_id, last_step_id, \
     total_prompt_tokens, total_completion_tokens, estimated_cost_usd, error_message, \
     parent_run_id, trigger_type, triggered_by, cancellation_requested, project_id, \
     created_at, updated_at";

/// Terminal run statuses never transition again.
pub fn is_terminal_status(status: &str) -> bool {
    matches!(status, "completed" | "failed" | "canceled")
}

pub struct NewRun<'a> {
    pub procedure_id: &'a str,
    pub procedure_version: &'a str,
    pub input_vars: Option<&'a Value>,
    pub trigger_type: Option<&'a str>,
    pub triggered_by: Option<&'a str>,
    pub parent_run_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
}

impl Run {
    pub async fn create(pool: &AnyPool, new_run: NewRun<'_>) -> EngineResult<Run> {
        let run_id = new_id();
        let now = now_ms();
        let input_vars_json = new_run
            .input_vars
            .map(|v| serde_json::to_string(v))
            .transpose()?;
        sqlx::query(
            "INSERT INTO runs (run_id, procedure_id, procedure_version, thread_id, status, \
             input_vars_json, trigger_type, triggered_by, parent_run_id, project_id, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&run_id)
        .bind(new_run.procedure_id)
        .bind(new_run.procedure_version)
        .bind(&run_id)
        .bind("created")
        .bind(&input_vars_json)
        .bind(new_run.trigger_type)
        .bind(new_run.triggered_by)
        .bind(new_run.parent_run_id)
        .bind(new_run.project_id)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        let run = Self::find(pool, &run_id)
            .await?
            .ok_or_else(|| crate::error::EngineError::Other("run vanished after insert".into()))?;
        Ok(run)
    }

    pub async fn find(pool: &AnyPool, run_id: &str) -> EngineResult<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
        Ok(run)
    }

    /// Update run status; terminal statuses also stamp `ended_at`.
    /// Writes are refused once the run is already terminal.
    pub async fn update_status(
        pool: &AnyPool,
        run_id: &str,
        status: &str,
        last_node_id: Option<&str>,
    ) -> EngineResult<()> {
        let now = now_ms();
        let ended_at = if is_terminal_status(status) {
            Some(now)
        } else {
            None
        };
        let started_at = if status == "running" { Some(now) } else { None };
        sqlx::query(
            "UPDATE runs SET status = $1, \
             started_at = CASE WHEN started_at IS NULL THEN $2 ELSE started_at END, \
             ended_at = COALESCE($3, ended_at), \
             last_node_id = COALESCE($4, last_node_id), \
             updated_at = $5 \
             WHERE run_id = $6 AND status NOT IN ('completed', 'failed', 'canceled')",
        )
        .bind(status)
        .bind(started_at)
        .bind(ended_at)
        .bind(last_node_id)
        .bind(now)
        .bind(run_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_error_message(
        pool: &AnyPool,
        run_id: &str,
        message: &str,
    ) -> EngineResult<()> {
        let truncated: String = message.chars().take(2000).collect();
        sqlx::query("UPDATE runs SET error_message = $1, updated_at = $2 WHERE run_id = $3")
            .bind(&truncated)
            .bind(now_ms())
            .bind(run_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_input_vars(pool: &AnyPool, run_id: &str, vars: &Value) -> EngineResult<()> {
        sqlx::query("UPDATE runs SET input_vars_json = $1, updated_at = $2 WHERE run_id = $3")
            .bind(serde_json::to_string(vars)?)
            .bind(now_ms())
            .bind(run_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_output_vars(pool: &AnyPool, run_id: &str, vars: &Value) -> EngineResult<()> {
        sqlx::query("UPDATE runs SET output_vars_json = $1, updated_at = $2 WHERE run_id = $3")
            .bind(serde_json::to_string(vars)?)
            .bind(now_ms())
            .bind(run_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_position(
        pool: &AnyPool,
        run_id: &str,
        node_id: Option<&str>,
        step_id: Option<&str>,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE runs SET last_node_id = $1, last_step_id = $2, updated_at = $3 \
             WHERE run_id = $4",
        )
        .bind(node_id)
        .bind(step_id)
        .bind(now_ms())
        .bind(run_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Accumulate LLM token usage and estimated cost onto the run.
    pub async fn add_token_usage(
        pool: &AnyPool,
        run_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost_usd: f64,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE runs SET \
             total_prompt_tokens = total_prompt_tokens + $1, \
             total_completion_tokens = total_completion_tokens + $2, \
             estimated_cost_usd = estimated_cost_usd + $3, \
             updated_at = $4 \
             WHERE run_id = $5",
        )
        .bind(prompt_tokens)
        .bind(completion_tokens)
        .bind(cost_usd)
        .bind(now_ms())
        .bind(run_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Set the cancellation flag (the only run field the API side writes).
    pub async fn request_cancellation(pool: &AnyPool, run_id: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE runs SET cancellation_requested = 1, updated_at = $1 \
             WHERE run_id = $2 AND status NOT IN ('completed', 'failed', 'canceled')",
        )
        .bind(now_ms())
        .bind(run_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_cancellation_requested(pool: &AnyPool, run_id: &str) -> EngineResult<bool> {
        let flag: Option<i64> =
            sqlx::query_scalar("SELECT cancellation_requested FROM runs WHERE run_id = $1")
                .bind(run_id)
                .fetch_optional(pool)
                .await?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Active (created/running) run count for one procedure version, used by
    /// trigger max_concurrent_runs enforcement.
    pub async fn count_active(
        pool: &AnyPool,
        procedure_id: &str,
        version: &str,
    ) -> EngineResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM runs \
             WHERE procedure_id = $1 AND procedure_version = $2 \
             AND status IN ('created', 'running')",
        )
        .bind(procedure_id)
        .bind(version)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    pub fn input_vars(&self) -> Value {
        self.input_vars_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

/// Append-only run timeline entry.
#[derive(Debug, Clone, FromRow)]
pub struct RunEvent {
    pub event_id: String,
    pub run_id: String,
    pub seq: i64,
    pub ts: i64,
    pub event_type: String,
    pub node_id: Option<String>,
    pub step_id: Option<String>,
    pub attempt: Option<i64>,
    pub payload_json: Option<String>,
}

impl RunEvent {
    /// Append an event. `seq` is per-run monotonic; only the worker that owns
    /// the claim writes events for a run, so MAX+1 is race-free.
    pub async fn emit(
        pool: &AnyPool,
        run_id: &str,
        event_type: &str,
        node_id: Option<&str>,
        step_id: Option<&str>,
        attempt: Option<i64>,
        payload: Option<&Value>,
    ) -> EngineResult<()> {
        let seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = $1")
                .bind(run_id)
                .fetch_one(pool)
                .await?;
        let payload_json = payload.map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO run_events (event_id, run_id, seq, ts, event_type, node_id, step_id, \
             attempt, payload_json) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(new_id())
        .bind(run_id)
        .bind(seq)
        .bind(now_ms())
        .bind(event_type)
        .bind(node_id)
        .bind(step_id)
        .bind(attempt)
        .bind(&payload_json)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_run(pool: &AnyPool, run_id: &str) -> EngineResult<Vec<RunEvent>> {
        let events = sqlx::query_as::<_, RunEvent>(
            "SELECT event_id, run_id, seq, ts, event_type, node_id, step_id, attempt, \
             payload_json FROM run_events WHERE run_id = $1 ORDER BY seq ASC",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?;
        Ok(events)
    }

    pub async fn exists(pool: &AnyPool, run_id: &str, event_type: &str) -> EngineResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM run_events WHERE run_id = $1 AND event_type = $2",
        )
        .bind(run_id)
        .bind(event_type)
        .fetch_one(pool)
        .await?;
        Ok(count > 0)
    }

    /// Prune events older than the retention cutoff. Returns rows deleted.
    pub async fn prune_before(pool: &AnyPool, cutoff_ms: i64) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM run_events WHERE ts < $1")
            .bind(cutoff_ms)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub fn payload(&self) -> Value {
        self.payload_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null)
    }
}

/// External output produced by a step.
#[derive(Debug, Clone, FromRow)]
pub struct Artifact {
    pub artifact_id: String,
    pub run_id: String,
    pub node_id: Option<String>,
    pub step_id: Option<String>,
    pub kind: String,
    pub uri: String,
    pub created_at: i64,
}

impl Artifact {
    pub async fn create(
        pool: &AnyPool,
        run_id: &str,
        node_id: Option<&str>,
        step_id: Option<&str>,
        kind: &str,
        uri: &str,
    ) -> EngineResult<Artifact> {
        let artifact_id = new_id();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO artifacts (artifact_id, run_id, node_id, step_id, kind, uri, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&artifact_id)
        .bind(run_id)
        .bind(node_id)
        .bind(step_id)
        .bind(kind)
        .bind(uri)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(Artifact {
            artifact_id,
            run_id: run_id.to_string(),
            node_id: node_id.map(String::from),
            step_id: step_id.map(String::from),
            kind: kind.to_string(),
            uri: uri.to_string(),
            created_at: now,
        })
    }

    pub async fn list_for_run(pool: &AnyPool, run_id: &str) -> EngineResult<Vec<Artifact>> {
        let artifacts = sqlx::query_as::<_, Artifact>(
            "SELECT artifact_id, run_id, node_id, step_id, kind, uri, created_at \
             FROM artifacts WHERE run_id = $1 ORDER BY created_at ASC",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?;
        Ok(artifacts)
    }

    pub async fn prune_before(pool: &AnyPool, cutoff_ms: i64) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM artifacts WHERE created_at < $1")
            .bind(cutoff_ms)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(is_terminal_status("completed"));
        assert!(is_terminal_status("failed"));
        assert!(is_terminal_status("canceled"));
        assert!(!is_terminal_status("running"));
        assert!(!is_terminal_status("waiting_approval"));
    }
}
