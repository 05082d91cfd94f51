//! Trigger registrations and webhook dedupe records.

use sqlx::{AnyPool, FromRow};

use crate::common::id::new_id;
use crate::common::time::now_ms;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, FromRow)]
pub struct TriggerRegistration {
    pub registration_id: String,
    pub procedure_id: String,
    pub version: String,
    pub trigger_type: String,
    pub schedule: Option<String>,
    pub webhook_secret: Option<String>,
    pub event_source: Option<String>,
    pub dedupe_window_seconds: i64,
    pub max_concurrent_runs: Option<i64>,
    pub enabled: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

const REGISTRATION_COLUMNS: &str = "registration_id, procedure_id, version, trigger_type, \
     schedule, webhook_secret, event_source, dedupe_window_seconds, max_concurrent_runs, \
     enabled, created_at, updated_at";

pub struct TriggerSpec<'a> {
    pub trigger_type: &'a str,
    pub schedule: Option<&'a str>,
    pub webhook_secret: Option<&'a str>,
    pub event_source: Option<&'a str>,
    pub dedupe_window_seconds: i64,
    pub max_concurrent_runs: Option<i64>,
    pub enabled: bool,
}

impl TriggerRegistration {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    /// Create or update the registration for a procedure version.
    pub async fn upsert(
        pool: &AnyPool,
        procedure_id: &str,
        version: &str,
        spec: TriggerSpec<'_>,
    ) -> EngineResult<TriggerRegistration> {
        let now = now_ms();
        let enabled = if spec.enabled { 1i64 } else { 0i64 };
        let updated = sqlx::query(
            "UPDATE trigger_registrations SET trigger_type = $1, schedule = $2, \
             webhook_secret = $3, event_source = $4, dedupe_window_seconds = $5, \
             max_concurrent_runs = $6, enabled = $7, updated_at = $8 \
             WHERE procedure_id = $9 AND version = $10",
        )
        .bind(spec.trigger_type)
        .bind(spec.schedule)
        .bind(spec.webhook_secret)
        .bind(spec.event_source)
        .bind(spec.dedupe_window_seconds)
        .bind(spec.max_concurrent_runs)
        .bind(enabled)
        .bind(now)
        .bind(procedure_id)
        .bind(version)
        .execute(pool)
        .await?;
        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO trigger_registrations (registration_id, procedure_id, version, \
                 trigger_type, schedule, webhook_secret, event_source, dedupe_window_seconds, \
                 max_concurrent_runs, enabled, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(new_id())
            .bind(procedure_id)
            .bind(version)
            .bind(spec.trigger_type)
            .bind(spec.schedule)
            .bind(spec.webhook_secret)
            .bind(spec.event_source)
            .bind(spec.dedupe_window_seconds)
            .bind(spec.max_concurrent_runs)
            .bind(enabled)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
        }
        Self::find(pool, procedure_id, version)
            .await?
            .ok_or_else(|| EngineError::Other("trigger registration vanished after upsert".into()))
    }

    pub async fn find(
        pool: &AnyPool,
        procedure_id: &str,
        version: &str,
    ) -> EngineResult<Option<TriggerRegistration>> {
        let reg = sqlx::query_as::<_, TriggerRegistration>(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM trigger_registrations \
             WHERE procedure_id = $1 AND version = $2"
        ))
        .bind(procedure_id)
        .bind(version)
        .fetch_optional(pool)
        .await?;
        Ok(reg)
    }

    pub async fn list_enabled(pool: &AnyPool) -> EngineResult<Vec<TriggerRegistration>> {
        let regs = sqlx::query_as::<_, TriggerRegistration>(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM trigger_registrations \
             WHERE enabled = 1 ORDER BY procedure_id ASC"
        ))
        .fetch_all(pool)
        .await?;
        Ok(regs)
    }

    /// Disable (soft-delete). Returns true when a registration existed.
    pub async fn disable(
        pool: &AnyPool,
        procedure_id: &str,
        version: &str,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE trigger_registrations SET enabled = 0, updated_at = $1 \
             WHERE procedure_id = $2 AND version = $3",
        )
        .bind(now_ms())
        .bind(procedure_id)
        .bind(version)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TriggerDedupeRecord {
    pub record_id: String,
    pub procedure_id: String,
    pub payload_hash: String,
    pub run_id: String,
    pub created_at: i64,
}

impl TriggerDedupeRecord {
    /// Existing run_id for a duplicate payload inside the window, else None.
    pub async fn find_within_window(
        pool: &AnyPool,
        procedure_id: &str,
        payload_hash: &str,
        window_seconds: i64,
    ) -> EngineResult<Option<String>> {
        if window_seconds <= 0 {
            return Ok(None);
        }
        let cutoff = now_ms() - window_seconds * 1000;
        let run_id: Option<String> = sqlx::query_scalar(
            "SELECT run_id FROM trigger_dedupe_records \
             WHERE procedure_id = $1 AND payload_hash = $2 AND created_at >= $3 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(procedure_id)
        .bind(payload_hash)
        .bind(cutoff)
        .fetch_optional(pool)
        .await?;
        Ok(run_id)
    }

    pub async fn record(
        pool: &AnyPool,
        procedure_id: &str,
        payload_hash: &str,
        run_id: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO trigger_dedupe_records (record_id, procedure_id, payload_hash, run_id, \
             created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(new_id())
        .bind(procedure_id)
        .bind(payload_hash)
        .bind(run_id)
        .bind(now_ms())
        .execute(pool)
        .await?;
        Ok(())
    }
}
