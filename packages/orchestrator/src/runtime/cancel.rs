//! Run cancellation registry.
//!
//! Two layers: an in-process token per active run, and the
//! `runs.cancellation_requested` DB flag written by the API side. The worker
//! bridges the flag into the token on job claim and on each heartbeat; node
//! executors probe the token at step boundaries.

use std::collections::HashMap;

use sqlx::AnyPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::db::Run;
use crate::error::{EngineError, EngineResult};

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: RwLock<HashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run at execution start. Re-registering replaces any stale
    /// token from a previous attempt.
    pub async fn register(&self, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(run_id.to_string(), token.clone());
        token
    }

    pub async fn unregister(&self, run_id: &str) {
        self.tokens.write().await.remove(run_id);
    }

    pub async fn cancel(&self, run_id: &str) {
        if let Some(token) = self.tokens.read().await.get(run_id) {
            token.cancel();
        }
    }

    pub async fn is_cancelled(&self, run_id: &str) -> bool {
        self.tokens
            .read()
            .await
            .get(run_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Raise when the run has been cancelled.
    pub async fn check(&self, run_id: &str) -> EngineResult<()> {
        if self.is_cancelled(run_id).await {
            return Err(EngineError::Cancelled(run_id.to_string()));
        }
        Ok(())
    }

    /// Bridge the DB cancellation flag into the in-process token.
    /// Returns true when the run is cancelled.
    pub async fn check_and_signal(&self, pool: &AnyPool, run_id: &str) -> EngineResult<bool> {
        if self.is_cancelled(run_id).await {
            return Ok(true);
        }
        if Run::is_cancellation_requested(pool, run_id).await? {
            self.cancel(run_id).await;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_cancel_probe() {
        let registry = CancellationRegistry::new();
        registry.register("r1").await;
        assert!(!registry.is_cancelled("r1").await);
        registry.cancel("r1").await;
        assert!(registry.is_cancelled("r1").await);
        assert!(registry.check("r1").await.is_err());
    }

    #[tokio::test]
    async fn unknown_run_is_not_cancelled() {
        let registry = CancellationRegistry::new();
        assert!(!registry.is_cancelled("ghost").await);
        assert!(registry.check("ghost").await.is_ok());
    }

    #[tokio::test]
    async fn unregister_clears_token() {
        let registry = CancellationRegistry::new();
        registry.register("r1").await;
        registry.cancel("r1").await;
        registry.unregister("r1").await;
        assert!(!registry.is_cancelled("r1").await);
    }
}
