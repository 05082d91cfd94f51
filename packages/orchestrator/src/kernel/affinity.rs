//! Run-scoped agent affinity cache.
//!
//! The first successful dispatch for a `(run_id, channel)` pair pins the
//! chosen agent; later dispatches in the same run prefer it while it stays
//! capable. This keeps browser/desktop sessions on one agent across
//! sequential steps.

use std::collections::HashMap;

use tokio::sync::RwLock;

#[derive(Default)]
pub struct AgentAffinity {
    inner: RwLock<HashMap<(String, String), String>>,
}

impl AgentAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn preferred(&self, run_id: &str, channel: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(&(run_id.to_string(), channel.to_string()))
            .cloned()
    }

    pub async fn pin(&self, run_id: &str, channel: &str, agent_id: &str) {
        self.inner.write().await.insert(
            (run_id.to_string(), channel.to_string()),
            agent_id.to_string(),
        );
    }

    /// Drop all pins for a finished run.
    pub async fn clear_run(&self, run_id: &str) {
        self.inner.write().await.retain(|(r, _), _| r != run_id);
    }
}
