//! Agent registry and resource leases.
//!
//! Agents carry a DB-backed circuit breaker (`consecutive_failures` /
//! `circuit_open_at`); resource leases cap concurrent use of a shared
//! `resource_key` at the owning agent's `concurrency_limit`.

use serde_json::Value;
use sqlx::{AnyPool, FromRow};

use crate::common::id::new_id;
use crate::common::time::now_ms;
use crate::config::DbDialect;
use crate::error::EngineResult;

/// A registered remote executor endpoint.
#[derive(Debug, Clone, FromRow)]
pub struct AgentInstance {
    pub agent_id: String,
    pub name: String,
    pub channel: String,
    pub base_url: String,
    pub capabilities: Option<String>,
    pub status: String,
    pub concurrency_limit: i64,
    pub resource_key: Option<String>,
    pub pool_id: Option<String>,
    pub consecutive_failures: i64,
    pub circuit_open_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub updated_at: i64,
}

const AGENT_COLUMNS: &str = "agent_id, name, channel, base_url, capabilities, status, \
     concurrency_limit, resource_key, pool_id, consecutive_failures, circuit_open_at, \
     last_heartbeat_at, updated_at";

/// One declared agent capability, parsed from the registry row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub cap_type: String,
}

/// Parse a capabilities column: JSON array of `{name, type}` objects or bare
/// strings, or a legacy comma-separated list.
pub fn parse_capabilities(raw: Option<&str>) -> Vec<Capability> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        return items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(Capability {
                    name,
                    cap_type: "tool".to_string(),
                }),
                Value::Object(map) => {
                    let name = map.get("name")?.as_str()?.to_string();
                    let cap_type = map
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("tool")
                        .to_string();
                    Some(Capability { name, cap_type })
                }
                _ => None,
            })
            .collect();
    }
    // Legacy CSV form
    trimmed
        .split(',')
        .map(|part| Capability {
            name: part.trim().to_string(),
            cap_type: "tool".to_string(),
        })
        .filter(|c| !c.name.is_empty())
        .collect()
}

impl AgentInstance {
    /// Declared capability matching `action` (or the `*` wildcard).
    pub fn capability_for(&self, action: &str) -> Option<Capability> {
        let caps = parse_capabilities(self.capabilities.as_deref());
        caps.iter()
            .find(|c| c.name == action)
            .or_else(|| caps.iter().find(|c| c.name == "*"))
            .cloned()
    }

    /// True when the circuit is open and the reset window has not elapsed.
    pub fn circuit_is_open(&self, now: i64, reset_ms: i64) -> bool {
        match self.circuit_open_at {
            Some(opened_at) => now - opened_at < reset_ms,
            None => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        pool: &AnyPool,
        name: &str,
        channel: &str,
        base_url: &str,
        capabilities: &str,
        concurrency_limit: i64,
        resource_key: Option<&str>,
        pool_id: Option<&str>,
    ) -> EngineResult<AgentInstance> {
        let agent_id = new_id();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO agent_instances (agent_id, name, channel, base_url, capabilities, \
             status, concurrency_limit, resource_key, pool_id, consecutive_failures, \
             last_heartbeat_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&agent_id)
        .bind(name)
        .bind(channel)
        .bind(base_url)
        .bind(capabilities)
        .bind("online")
        .bind(concurrency_limit)
        .bind(resource_key)
        .bind(pool_id)
        .bind(0i64)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
        Self::find(pool, &agent_id)
            .await?
            .ok_or_else(|| crate::error::EngineError::Other("agent vanished after insert".into()))
    }

    pub async fn find(pool: &AnyPool, agent_id: &str) -> EngineResult<Option<AgentInstance>> {
        let agent = sqlx::query_as::<_, AgentInstance>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agent_instances WHERE agent_id = $1"
        ))
        .bind(agent_id)
        .fetch_optional(pool)
        .await?;
        Ok(agent)
    }

    /// Registry row for an explicitly-bound URL, when one exists.
    pub async fn find_by_base_url(
        pool: &AnyPool,
        base_url: &str,
    ) -> EngineResult<Option<AgentInstance>> {
        let agent = sqlx::query_as::<_, AgentInstance>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agent_instances \
             WHERE base_url = $1 AND status = 'online' LIMIT 1"
        ))
        .bind(base_url)
        .fetch_optional(pool)
        .await?;
        Ok(agent)
    }

    /// Online agents for a channel, stable order.
    pub async fn list_online(pool: &AnyPool, channel: &str) -> EngineResult<Vec<AgentInstance>> {
        let agents = sqlx::query_as::<_, AgentInstance>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agent_instances \
             WHERE channel = $1 AND status = 'online' ORDER BY agent_id ASC"
        ))
        .bind(channel)
        .fetch_all(pool)
        .await?;
        Ok(agents)
    }

    /// Reset the failure counter and close the circuit after a successful
    /// dispatch. Last-writer-wins is fine here.
    pub async fn record_dispatch_success(pool: &AnyPool, agent_id: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE agent_instances SET consecutive_failures = 0, circuit_open_at = NULL, \
             updated_at = $1 WHERE agent_id = $2",
        )
        .bind(now_ms())
        .bind(agent_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Increment the failure counter, opening the circuit at the threshold.
    pub async fn record_dispatch_failure(
        pool: &AnyPool,
        agent_id: &str,
        threshold: i64,
    ) -> EngineResult<()> {
        let now = now_ms();
        sqlx::query(
            "UPDATE agent_instances SET consecutive_failures = consecutive_failures + 1, \
             updated_at = $1 WHERE agent_id = $2",
        )
        .bind(now)
        .bind(agent_id)
        .execute(pool)
        .await?;
        sqlx::query(
            "UPDATE agent_instances SET circuit_open_at = $1 \
             WHERE agent_id = $2 AND consecutive_failures >= $3 AND circuit_open_at IS NULL",
        )
        .bind(now)
        .bind(agent_id)
        .bind(threshold)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Bump the dispatch counter row (UPDATE-then-INSERT upsert).
    pub async fn record_dispatch_count(pool: &AnyPool, agent_id: &str) -> EngineResult<()> {
        let now = now_ms();
        let updated = sqlx::query(
            "UPDATE agent_dispatch_counters SET dispatch_count = dispatch_count + 1, \
             last_dispatch_at = $1 WHERE agent_id = $2",
        )
        .bind(now)
        .bind(agent_id)
        .execute(pool)
        .await?;
        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO agent_dispatch_counters (agent_id, dispatch_count, last_dispatch_at) \
                 VALUES ($1, $2, $3)",
            )
            .bind(agent_id)
            .bind(1i64)
            .bind(now)
            .execute(pool)
            .await?;
        }
        Ok(())
    }
}

/// An active lease over a shared resource key.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceLease {
    pub lease_id: String,
    pub resource_key: String,
    pub run_id: String,
    pub node_id: Option<String>,
    pub step_id: Option<String>,
    pub acquired_at: i64,
    pub expires_at: i64,
    pub released_at: Option<i64>,
}

impl ResourceLease {
    /// Try to acquire a lease. Expired leases are reclaimed lazily first;
    /// the insert only happens while active leases stay strictly under
    /// `concurrency_limit`.
    ///
    /// Count and insert run in one transaction. On PostgreSQL the agent
    /// rows for the key are row-locked first so concurrent acquirers
    /// serialize and the count cannot be over-admitted; SQLite's single
    /// writer already serializes the transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn try_acquire(
        pool: &AnyPool,
        dialect: DbDialect,
        resource_key: &str,
        concurrency_limit: i64,
        run_id: &str,
        node_id: &str,
        step_id: &str,
        ttl_ms: i64,
    ) -> EngineResult<Option<ResourceLease>> {
        let now = now_ms();
        let mut tx = pool.begin().await?;

        if dialect == DbDialect::Postgres {
            sqlx::query(
                "SELECT agent_id FROM agent_instances WHERE resource_key = $1 FOR UPDATE",
            )
            .bind(resource_key)
            .fetch_all(&mut *tx)
            .await?;
        }

        // Lazy reclaim of expired leases
        sqlx::query(
            "UPDATE resource_leases SET released_at = $1 \
             WHERE resource_key = $2 AND released_at IS NULL AND expires_at < $3",
        )
        .bind(now)
        .bind(resource_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM resource_leases \
             WHERE resource_key = $1 AND released_at IS NULL AND expires_at >= $2",
        )
        .bind(resource_key)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        if active >= concurrency_limit {
            tx.commit().await?;
            return Ok(None);
        }

        let lease = ResourceLease {
            lease_id: new_id(),
            resource_key: resource_key.to_string(),
            run_id: run_id.to_string(),
            node_id: Some(node_id.to_string()),
            step_id: Some(step_id.to_string()),
            acquired_at: now,
            expires_at: now + ttl_ms,
            released_at: None,
        };
        sqlx::query(
            "INSERT INTO resource_leases (lease_id, resource_key, run_id, node_id, step_id, \
             acquired_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&lease.lease_id)
        .bind(&lease.resource_key)
        .bind(&lease.run_id)
        .bind(&lease.node_id)
        .bind(&lease.step_id)
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(lease))
    }

    pub async fn release(pool: &AnyPool, lease_id: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE resource_leases SET released_at = $1 \
             WHERE lease_id = $2 AND released_at IS NULL",
        )
        .bind(now_ms())
        .bind(lease_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn count_active(pool: &AnyPool, resource_key: &str) -> EngineResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM resource_leases \
             WHERE resource_key = $1 AND released_at IS NULL AND expires_at >= $2",
        )
        .bind(resource_key)
        .bind(now_ms())
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_object_capabilities() {
        let caps = parse_capabilities(Some(
            r#"[{"name": "open_page", "type": "tool"}, {"name": "run_flow", "type": "workflow"}]"#,
        ));
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].name, "open_page");
        assert_eq!(caps[1].cap_type, "workflow");
    }

    #[test]
    fn parses_json_string_capabilities() {
        let caps = parse_capabilities(Some(r#"["click", "type_text"]"#));
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].cap_type, "tool");
    }

    #[test]
    fn parses_legacy_csv_capabilities() {
        let caps = parse_capabilities(Some("click, type_text , *"));
        assert_eq!(caps.len(), 3);
        assert_eq!(caps[2].name, "*");
    }

    #[test]
    fn empty_capabilities_parse_empty() {
        assert!(parse_capabilities(None).is_empty());
        assert!(parse_capabilities(Some("  ")).is_empty());
    }

    fn agent_with(caps: &str) -> AgentInstance {
        AgentInstance {
            agent_id: "a1".into(),
            name: "web-1".into(),
            channel: "web".into(),
            base_url: "http://agent".into(),
            capabilities: Some(caps.to_string()),
            status: "online".into(),
            concurrency_limit: 1,
            resource_key: None,
            pool_id: None,
            consecutive_failures: 0,
            circuit_open_at: None,
            last_heartbeat_at: None,
            updated_at: 0,
        }
    }

    #[test]
    fn wildcard_capability_matches_any_action() {
        let agent = agent_with(r#"["*"]"#);
        assert!(agent.capability_for("anything").is_some());
    }

    #[test]
    fn circuit_open_respects_reset_window() {
        let mut agent = agent_with("[]");
        agent.circuit_open_at = Some(1_000);
        assert!(agent.circuit_is_open(2_000, 300_000));
        assert!(!agent.circuit_is_open(1_000 + 300_000, 300_000));
        agent.circuit_open_at = None;
        assert!(!agent.circuit_is_open(2_000, 300_000));
    }
}
