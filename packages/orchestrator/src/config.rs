//! Environment-driven settings.
//!
//! Every knob has the documented default; `DATABASE_URL` is normalized into
//! a dialect tag here so everything above the job-queue claim function stays
//! dialect-agnostic.

use std::collections::HashMap;
use std::time::Duration;

/// Database dialect, derived from the `DATABASE_URL` scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbDialect {
    Postgres,
    Sqlite,
}

impl DbDialect {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres") {
            DbDialect::Postgres
        } else {
            DbDialect::Sqlite
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DbDialect::Postgres => "postgres",
            DbDialect::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub dialect: DbDialect,

    // Worker loop
    pub worker_concurrency: usize,
    pub worker_poll_interval: Duration,
    pub worker_lock_duration: Duration,
    pub worker_heartbeat_interval: Duration,
    pub worker_max_attempts: i64,
    pub worker_retry_delay: Duration,

    // Resource + leader leases
    pub lease_ttl: Duration,
    pub leader_lease_ttl: Duration,
    pub leader_renew_interval: Duration,

    // Circuit breakers (agents, LLM, MCP)
    pub circuit_open_threshold: i64,
    pub circuit_reset: Duration,

    // Singleton loops
    pub approval_expiry_poll_interval: Duration,
    pub scheduler_sync_interval: Duration,
    pub retention_sweep_interval: Duration,
    pub checkpoint_retention_days: i64,
    pub artifact_retention_days: i64,

    // Outbound endpoints
    pub alert_webhook_url: Option<String>,
    pub pushgateway_url: Option<String>,
    pub metrics_push_interval: Duration,
    pub callback_base_url: String,

    /// Per-model `{model: {prompt, completion}}` cost overrides
    /// (USD per 1k tokens), merged over the built-in table.
    pub llm_model_cost_overrides: HashMap<String, (f64, f64)>,
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: f64) -> Duration {
    let secs: f64 = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_secs_f64(secs.max(0.0))
}

fn parse_cost_overrides(raw: Option<String>) -> HashMap<String, (f64, f64)> {
    let mut out = HashMap::new();
    let Some(raw) = raw else {
        return out;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
        tracing::warn!("LLM_MODEL_COST_JSON is not valid JSON; ignoring");
        return out;
    };
    if let Some(map) = value.as_object() {
        for (model, rates) in map {
            let prompt = rates.get("prompt").and_then(|v| v.as_f64());
            let completion = rates.get("completion").and_then(|v| v.as_f64());
            if let (Some(p), Some(c)) = (prompt, completion) {
                out.insert(model.to_lowercase(), (p, c));
            }
        }
    }
    out
}

impl Settings {
    pub fn from_env() -> Self {
        let database_url = env_string("DATABASE_URL", "sqlite::memory:");
        let dialect = DbDialect::from_url(&database_url);
        Self {
            database_url,
            dialect,
            worker_concurrency: env_i64("WORKER_CONCURRENCY", 4).max(1) as usize,
            worker_poll_interval: env_secs("WORKER_POLL_INTERVAL", 1.0),
            worker_lock_duration: env_secs("WORKER_LOCK_DURATION_SECONDS", 60.0),
            worker_heartbeat_interval: env_secs("WORKER_HEARTBEAT_INTERVAL", 15.0),
            worker_max_attempts: env_i64("WORKER_MAX_ATTEMPTS", 3),
            worker_retry_delay: env_secs("WORKER_RETRY_DELAY_SECONDS", 5.0),
            lease_ttl: env_secs("LEASE_TTL_SECONDS", 60.0),
            leader_lease_ttl: env_secs("LEADER_LEASE_TTL", 60.0),
            leader_renew_interval: env_secs("LEADER_RENEW_INTERVAL", 15.0),
            circuit_open_threshold: env_i64("CIRCUIT_OPEN_THRESHOLD", 5),
            circuit_reset: env_secs("CIRCUIT_RESET_SECONDS", 300.0),
            approval_expiry_poll_interval: env_secs("APPROVAL_EXPIRY_POLL_INTERVAL", 30.0),
            scheduler_sync_interval: env_secs("SCHEDULER_SYNC_INTERVAL", 30.0),
            retention_sweep_interval: env_secs("RETENTION_SWEEP_INTERVAL", 3600.0),
            checkpoint_retention_days: env_i64("CHECKPOINT_RETENTION_DAYS", 30),
            artifact_retention_days: env_i64("ARTIFACT_RETENTION_DAYS", 30),
            alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
            pushgateway_url: env_opt("PUSHGATEWAY_URL"),
            metrics_push_interval: env_secs("METRICS_PUSH_INTERVAL", 15.0),
            callback_base_url: env_string("CALLBACK_BASE_URL", "http://localhost:8080"),
            llm_model_cost_overrides: parse_cost_overrides(env_opt("LLM_MODEL_COST_JSON")),
        }
    }

    /// Settings tuned for fast in-memory test runs.
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            dialect: DbDialect::Sqlite,
            worker_concurrency: 2,
            worker_poll_interval: Duration::from_millis(20),
            worker_lock_duration: Duration::from_secs(60),
            worker_heartbeat_interval: Duration::from_millis(50),
            worker_max_attempts: 3,
            worker_retry_delay: Duration::from_millis(10),
            lease_ttl: Duration::from_secs(60),
            leader_lease_ttl: Duration::from_secs(60),
            leader_renew_interval: Duration::from_millis(50),
            circuit_open_threshold: 5,
            circuit_reset: Duration::from_secs(300),
            approval_expiry_poll_interval: Duration::from_millis(50),
            scheduler_sync_interval: Duration::from_millis(100),
            retention_sweep_interval: Duration::from_secs(3600),
            checkpoint_retention_days: 30,
            artifact_retention_days: 30,
            alert_webhook_url: None,
            pushgateway_url: None,
            metrics_push_interval: Duration::from_secs(15),
            callback_base_url: "http://localhost:8080".to_string(),
            llm_model_cost_overrides: HashMap::new(),
        }
    }
}
