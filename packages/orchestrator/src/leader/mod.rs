//! DB-backed leader election for HA-safe singleton loops.
//!
//! Replicas compete for one row per role in `scheduler_leader_leases`.
//! Each renewal cycle tries three atomic paths:
//!
//! 1. Renew  — UPDATE our own row (we already hold the lease).
//! 2. Steal  — UPDATE an expired row (previous leader died).
//! 3. Insert — create the row; a uniqueness violation means another
//!             replica won the race.
//!
//! `is_leader` reflects the last attempt. Singleton loops (trigger
//! scheduler, approval expiry, retention) check it each cycle and must
//! tolerate brief False windows, resuming when leadership returns. The
//! loop also heartbeats this instance's presence into
//! `orchestrator_workers` whether or not it leads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::AnyPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::id::short_id;
use crate::common::time::now_ms;
use crate::config::Settings;
use crate::error::EngineResult;

pub const LEASE_NAME: &str = "scheduler";

fn make_leader_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "orchestrator".to_string());
    let pid = std::process::id();
    format!("{host}-{pid}-{}", short_id())
}

pub struct LeaderElection {
    name: String,
    leader_id: String,
    is_leader: AtomicBool,
}

impl LeaderElection {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            leader_id: make_leader_id(),
            is_leader: AtomicBool::new(false),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn leader_id(&self) -> &str {
        &self.leader_id
    }

    /// Background renewal loop; runs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, pool: AnyPool, settings: Settings, shutdown: CancellationToken) {
        info!(
            lease = %self.name,
            leader_id = %self.leader_id,
            ttl_secs = settings.leader_lease_ttl.as_secs(),
            "leader election started"
        );
        loop {
            let acquired = match self.try_acquire_or_renew(&pool, &settings).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    warn!(lease = %self.name, error = %e, "leader acquire/renew failed");
                    false
                }
            };
            let was_leader = self.is_leader.swap(acquired, Ordering::SeqCst);
            if acquired && !was_leader {
                info!(lease = %self.name, leader_id = %self.leader_id, "became leader");
            } else if !acquired && was_leader {
                warn!(lease = %self.name, leader_id = %self.leader_id, "lost leader lease");
            }

            // Presence heartbeat runs whether standby or active so the
            // instance stays visible in the worker registry.
            if let Err(e) = self.heartbeat_worker_registry(&pool, acquired).await {
                warn!(lease = %self.name, error = %e, "worker registry heartbeat failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(settings.leader_renew_interval) => {}
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
        info!(lease = %self.name, leader_id = %self.leader_id, "leader election stopped");
    }

    /// One renewal attempt over the three paths. Exposed for tests.
    pub async fn try_acquire_or_renew(
        &self,
        pool: &AnyPool,
        settings: &Settings,
    ) -> EngineResult<bool> {
        let now = now_ms();
        let expires_at = now + settings.leader_lease_ttl.as_millis() as i64;

        // Path 1: renew our own row
        let renewed = sqlx::query(
            "UPDATE scheduler_leader_leases SET acquired_at = $1, expires_at = $2 \
             WHERE name = $3 AND leader_id = $4",
        )
        .bind(now)
        .bind(expires_at)
        .bind(&self.name)
        .bind(&self.leader_id)
        .execute(pool)
        .await?;
        if renewed.rows_affected() == 1 {
            debug!(lease = %self.name, "renewed leader lease");
            return Ok(true);
        }

        // Path 2: steal an expired lease
        let stolen = sqlx::query(
            "UPDATE scheduler_leader_leases SET leader_id = $1, acquired_at = $2, \
             expires_at = $3 WHERE name = $4 AND expires_at < $5",
        )
        .bind(&self.leader_id)
        .bind(now)
        .bind(expires_at)
        .bind(&self.name)
        .bind(now)
        .execute(pool)
        .await?;
        if stolen.rows_affected() == 1 {
            info!(lease = %self.name, leader_id = %self.leader_id, "stole expired leader lease");
            return Ok(true);
        }

        // Path 3: insert a fresh row; a conflict means another replica won
        let inserted = sqlx::query(
            "INSERT INTO scheduler_leader_leases (name, leader_id, acquired_at, expires_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&self.name)
        .bind(&self.leader_id)
        .bind(now)
        .bind(expires_at)
        .execute(pool)
        .await;
        match inserted {
            Ok(_) => {
                info!(lease = %self.name, leader_id = %self.leader_id, "acquired fresh leader lease");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Upsert this instance's presence row; the active leader also demotes
    /// ghost leader rows so exactly one leader stays visible.
    async fn heartbeat_worker_registry(&self, pool: &AnyPool, is_leader: bool) -> EngineResult<()> {
        let now = now_ms();
        if is_leader {
            sqlx::query("UPDATE orchestrator_workers SET is_leader = 0 WHERE worker_id != $1")
                .bind(&self.leader_id)
                .execute(pool)
                .await?;
        }
        let leader_flag = if is_leader { 1i64 } else { 0i64 };
        let updated = sqlx::query(
            "UPDATE orchestrator_workers SET is_leader = $1, last_heartbeat_at = $2, \
             status = 'online' WHERE worker_id = $3",
        )
        .bind(leader_flag)
        .bind(now)
        .bind(&self.leader_id)
        .execute(pool)
        .await?;
        if updated.rows_affected() == 0 {
            let inserted = sqlx::query(
                "INSERT INTO orchestrator_workers (worker_id, status, is_leader, \
                 last_heartbeat_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(&self.leader_id)
            .bind("online")
            .bind(leader_flag)
            .bind(now)
            .execute(pool)
            .await;
            if inserted.is_err() {
                // Another writer inserted concurrently; next cycle updates
                debug!(worker_id = %self.leader_id, "presence insert lost a race");
            }
        }
        Ok(())
    }
}
