//! Approval decisions and the leader-gated expiry loop.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::time::now_ms;
use crate::db::{Approval, Run};
use crate::error::{EngineError, EngineResult};
use crate::kernel::OrchestratorKernel;
use crate::leader::LeaderElection;
use crate::queue::RunJob;

/// Resume jobs jump ahead of normal traffic.
pub const RESUME_PRIORITY: i64 = 10;

/// Record a decision on a pending approval, inject it into the run's
/// variables, and requeue the run for resume.
///
/// `decision` is `approved` / `rejected` / `timeout`.
pub async fn submit_decision(
    kernel: &Arc<OrchestratorKernel>,
    approval_id: &str,
    decision: &str,
    decided_by: Option<&str>,
    decision_payload: Option<&Value>,
) -> EngineResult<Approval> {
    let Some(approval) = Approval::find(&kernel.pool, approval_id).await? else {
        return Err(EngineError::Other(format!(
            "approval '{approval_id}' not found"
        )));
    };
    if approval.status != "pending" {
        return Err(EngineError::Other(format!(
            "approval '{approval_id}' already decided ({})",
            approval.status
        )));
    }

    let status = match decision {
        "approved" => "approved",
        "rejected" => "rejected",
        "timeout" => "timeout",
        other => {
            return Err(EngineError::Other(format!(
                "invalid approval decision '{other}'"
            )))
        }
    };
    let updated =
        Approval::decide(&kernel.pool, approval_id, status, decided_by, decision_payload).await?;
    if updated == 0 {
        return Err(EngineError::Other(format!(
            "approval '{approval_id}' was decided concurrently"
        )));
    }

    // Inject the decision into the run's working vars so the approval node
    // routes on resume
    if let Some(run) = Run::find(&kernel.pool, &approval.run_id).await? {
        let mut vars: Map<String, Value> =
            run.input_vars().as_object().cloned().unwrap_or_default();
        let decisions = vars
            .entry("__approval_decisions".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(decisions) = decisions.as_object_mut() {
            decisions.insert(approval.node_id.clone(), json!(decision));
        }
        Run::set_input_vars(&kernel.pool, &approval.run_id, &Value::Object(vars)).await?;
    }

    RunJob::requeue(
        &kernel.pool,
        &approval.run_id,
        RESUME_PRIORITY,
        kernel.settings.worker_max_attempts,
    )
    .await?;
    info!(
        approval_id = %approval_id,
        run_id = %approval.run_id,
        decision,
        "approval decided; run requeued"
    );

    Approval::find(&kernel.pool, approval_id)
        .await?
        .ok_or_else(|| EngineError::Other("approval vanished after decision".into()))
}

/// Leader-gated loop: expire pending approvals past their deadline by
/// submitting a `timeout` decision.
pub async fn expiry_loop(
    kernel: Arc<OrchestratorKernel>,
    leader: Arc<LeaderElection>,
    shutdown: CancellationToken,
) {
    info!("approval expiry loop started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(kernel.settings.approval_expiry_poll_interval) => {}
        }
        if !leader.is_leader() {
            continue;
        }
        match Approval::list_expired_pending(&kernel.pool, now_ms()).await {
            Ok(expired) => {
                for approval in expired {
                    warn!(
                        approval_id = %approval.approval_id,
                        run_id = %approval.run_id,
                        "approval expired; submitting timeout decision"
                    );
                    if let Err(e) = submit_decision(
                        &kernel,
                        &approval.approval_id,
                        "timeout",
                        Some("system"),
                        None,
                    )
                    .await
                    {
                        error!(
                            approval_id = %approval.approval_id,
                            error = %e,
                            "failed to expire approval"
                        );
                    }
                }
            }
            Err(e) => error!(error = %e, "approval expiry scan failed"),
        }
    }
    info!("approval expiry loop stopped");
}
