//! Pool construction and embedded schema bootstrap.

use anyhow::Result;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use crate::config::{DbDialect, Settings};

/// Connect an [`AnyPool`] for the configured database.
///
/// SQLite runs with a single connection: the embedded deployment is
/// single-process, and `sqlite::memory:` would otherwise hand every pool
/// connection its own empty database.
pub async fn connect(settings: &Settings) -> Result<AnyPool> {
    sqlx::any::install_default_drivers();
    let max_connections = match settings.dialect {
        DbDialect::Postgres => 10,
        DbDialect::Sqlite => 1,
    };
    let pool = AnyPoolOptions::new()
        .max_connections(max_connections)
        .connect(&settings.database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded schema (idempotent). Migration tooling is out of
/// scope; this covers fresh databases and tests.
pub async fn init_schema(pool: &AnyPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        project_id   TEXT PRIMARY KEY,
        name         TEXT NOT NULL,
        description  TEXT,
        created_at   BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS procedures (
        procedure_id            TEXT NOT NULL,
        version                 TEXT NOT NULL,
        status                  TEXT NOT NULL DEFAULT 'draft',
        effective_date          TEXT,
        name                    TEXT NOT NULL DEFAULT '',
        description             TEXT,
        ckp_json                TEXT NOT NULL,
        trigger_config_json     TEXT,
        provenance_json         TEXT,
        retrieval_metadata_json TEXT,
        project_id              TEXT,
        created_at              BIGINT NOT NULL,
        PRIMARY KEY (procedure_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        run_id                  TEXT PRIMARY KEY,
        procedure_id            TEXT NOT NULL,
        procedure_version       TEXT NOT NULL,
        thread_id               TEXT NOT NULL,
        status                  TEXT NOT NULL DEFAULT 'created',
        started_at              BIGINT,
        ended_at                BIGINT,
        input_vars_json         TEXT,
        output_vars_json        TEXT,
        last_node_id            TEXT,
        last_step_id            TEXT,
        total_prompt_tokens     BIGINT NOT NULL DEFAULT 0,
        total_completion_tokens BIGINT NOT NULL DEFAULT 0,
        estimated_cost_usd      DOUBLE PRECISION NOT NULL DEFAULT 0,
        error_message           TEXT,
        parent_run_id           TEXT,
        trigger_type            TEXT,
        triggered_by            TEXT,
        cancellation_requested  BIGINT NOT NULL DEFAULT 0,
        project_id              TEXT,
        created_at              BIGINT NOT NULL,
        updated_at              BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_events (
        event_id     TEXT PRIMARY KEY,
        run_id       TEXT NOT NULL,
        seq          BIGINT NOT NULL,
        ts           BIGINT NOT NULL,
        event_type   TEXT NOT NULL,
        node_id      TEXT,
        step_id      TEXT,
        attempt      BIGINT,
        payload_json TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_run_events_run_id ON run_events (run_id)",
    r#"
    CREATE TABLE IF NOT EXISTS approvals (
        approval_id       TEXT PRIMARY KEY,
        run_id            TEXT NOT NULL,
        node_id           TEXT NOT NULL,
        prompt            TEXT NOT NULL,
        decision_type     TEXT NOT NULL,
        options_json      TEXT,
        context_data_json TEXT,
        status            TEXT NOT NULL DEFAULT 'pending',
        decided_by        TEXT,
        decision_json     TEXT,
        created_at        BIGINT NOT NULL,
        decided_at        BIGINT,
        expires_at        BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS step_idempotency (
        run_id          TEXT NOT NULL,
        node_id         TEXT NOT NULL,
        step_id         TEXT NOT NULL,
        idempotency_key TEXT,
        status          TEXT NOT NULL DEFAULT 'started',
        result_json     TEXT,
        updated_at      BIGINT NOT NULL,
        PRIMARY KEY (run_id, node_id, step_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifacts (
        artifact_id TEXT PRIMARY KEY,
        run_id      TEXT NOT NULL,
        node_id     TEXT,
        step_id     TEXT,
        kind        TEXT NOT NULL,
        uri         TEXT NOT NULL,
        created_at  BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_instances (
        agent_id             TEXT PRIMARY KEY,
        name                 TEXT NOT NULL,
        channel              TEXT NOT NULL,
        base_url             TEXT NOT NULL,
        capabilities         TEXT,
        status               TEXT NOT NULL DEFAULT 'online',
        concurrency_limit    BIGINT NOT NULL DEFAULT 1,
        resource_key         TEXT,
        pool_id              TEXT,
        consecutive_failures BIGINT NOT NULL DEFAULT 0,
        circuit_open_at      BIGINT,
        last_heartbeat_at    BIGINT,
        updated_at           BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_agent_instances_channel ON agent_instances (channel)",
    "CREATE INDEX IF NOT EXISTS idx_agent_instances_resource_key ON agent_instances (resource_key)",
    r#"
    CREATE TABLE IF NOT EXISTS resource_leases (
        lease_id     TEXT PRIMARY KEY,
        resource_key TEXT NOT NULL,
        run_id       TEXT NOT NULL,
        node_id      TEXT,
        step_id      TEXT,
        acquired_at  BIGINT NOT NULL,
        expires_at   BIGINT NOT NULL,
        released_at  BIGINT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_resource_leases_resource_key ON resource_leases (resource_key)",
    r#"
    CREATE TABLE IF NOT EXISTS trigger_registrations (
        registration_id       TEXT PRIMARY KEY,
        procedure_id          TEXT NOT NULL,
        version               TEXT NOT NULL,
        trigger_type          TEXT NOT NULL,
        schedule              TEXT,
        webhook_secret        TEXT,
        event_source          TEXT,
        dedupe_window_seconds BIGINT NOT NULL DEFAULT 0,
        max_concurrent_runs   BIGINT,
        enabled               BIGINT NOT NULL DEFAULT 1,
        created_at            BIGINT NOT NULL,
        updated_at            BIGINT NOT NULL,
        UNIQUE (procedure_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trigger_dedupe_records (
        record_id    TEXT PRIMARY KEY,
        procedure_id TEXT NOT NULL,
        payload_hash TEXT NOT NULL,
        run_id       TEXT NOT NULL,
        created_at   BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_trigger_dedupe_payload_hash ON trigger_dedupe_records (payload_hash)",
    r#"
    CREATE TABLE IF NOT EXISTS run_jobs (
        job_id        TEXT PRIMARY KEY,
        run_id        TEXT NOT NULL UNIQUE,
        status        TEXT NOT NULL DEFAULT 'queued',
        priority      BIGINT NOT NULL DEFAULT 0,
        attempts      BIGINT NOT NULL DEFAULT 0,
        max_attempts  BIGINT NOT NULL DEFAULT 3,
        available_at  BIGINT NOT NULL,
        locked_by     TEXT,
        locked_until  BIGINT,
        error_message TEXT,
        created_at    BIGINT NOT NULL,
        updated_at    BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_run_jobs_poll ON run_jobs (status, available_at, priority)",
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_leader_leases (
        name        TEXT PRIMARY KEY,
        leader_id   TEXT NOT NULL,
        acquired_at BIGINT NOT NULL,
        expires_at  BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_workers (
        worker_id         TEXT PRIMARY KEY,
        status            TEXT NOT NULL DEFAULT 'online',
        is_leader         BIGINT NOT NULL DEFAULT 0,
        last_heartbeat_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_settings (
        setting_key TEXT PRIMARY KEY,
        value_json  TEXT NOT NULL,
        updated_at  BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_events (
        audit_id     TEXT PRIMARY KEY,
        actor        TEXT,
        action       TEXT NOT NULL,
        entity       TEXT,
        payload_json TEXT,
        created_at   BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_dispatch_counters (
        agent_id         TEXT PRIMARY KEY,
        dispatch_count   BIGINT NOT NULL DEFAULT 0,
        last_dispatch_at BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS secret_entries (
        secret_key TEXT PRIMARY KEY,
        provider   TEXT NOT NULL,
        secret_ref TEXT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id    TEXT PRIMARY KEY,
        username   TEXT NOT NULL,
        role       TEXT NOT NULL DEFAULT 'viewer',
        created_at BIGINT NOT NULL
    )
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let settings = Settings::for_tests();
        let pool = connect(&settings).await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM run_jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
