//! Agent HTTP dispatch.
//!
//! Wraps the transport call with resource-lease acquisition, the step
//! timeout deadline, callback-mode handling, and circuit bookkeeping on the
//! registry row.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::registry::AgentTarget;
use crate::db::{AgentInstance, ResourceLease, RunEvent};
use crate::error::{EngineError, EngineResult};
use crate::kernel::{AgentExecuteRequest, OrchestratorKernel};

/// Coordinates of the step being dispatched.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub run_id: &'a str,
    pub node_id: &'a str,
    pub step_id: &'a str,
    /// Channel used for affinity pinning (the node's `agent` field).
    pub channel: Option<&'a str>,
}

/// POST the action to the agent's `/execute`, honoring leases, timeout, and
/// callback mode. Returns the result payload.
pub async fn dispatch_to_agent(
    kernel: &OrchestratorKernel,
    target: &AgentTarget,
    ctx: &StepContext<'_>,
    action: &str,
    params: Value,
    timeout_ms: Option<i64>,
) -> EngineResult<Value> {
    // Acquire a shared-resource lease when the agent declares a bucket.
    let mut lease_id: Option<String> = None;
    if let Some(agent) = &target.agent {
        if let Some(resource_key) = agent.resource_key.as_deref() {
            let lease = ResourceLease::try_acquire(
                &kernel.pool,
                kernel.settings.dialect,
                resource_key,
                agent.concurrency_limit,
                ctx.run_id,
                ctx.node_id,
                ctx.step_id,
                kernel.settings.lease_ttl.as_millis() as i64,
            )
            .await?;
            match lease {
                Some(lease) => lease_id = Some(lease.lease_id),
                None => {
                    warn!(
                        resource_key,
                        agent_id = %agent.agent_id,
                        "resource pool saturated"
                    );
                    RunEvent::emit(
                        &kernel.pool,
                        ctx.run_id,
                        "pool_saturated",
                        Some(ctx.node_id),
                        Some(ctx.step_id),
                        None,
                        Some(&json!({
                            "resource_key": resource_key,
                            "agent_id": agent.agent_id,
                        })),
                    )
                    .await?;
                    return Err(EngineError::ResourceBusy(format!(
                        "resource busy for agent '{}' ({resource_key})",
                        agent.agent_id
                    )));
                }
            }
        }
    }

    let result = call_agent(kernel, target, ctx, action, params, timeout_ms).await;

    if let Some(lease_id) = lease_id {
        if let Err(e) = ResourceLease::release(&kernel.pool, &lease_id).await {
            warn!(lease_id = %lease_id, error = %e, "failed to release resource lease");
        }
    }
    result
}

async fn call_agent(
    kernel: &OrchestratorKernel,
    target: &AgentTarget,
    ctx: &StepContext<'_>,
    action: &str,
    params: Value,
    timeout_ms: Option<i64>,
) -> EngineResult<Value> {
    let callback_url = target.workflow_mode.then(|| {
        format!(
            "{}/api/runs/{}/callback",
            kernel.settings.callback_base_url.trim_end_matches('/'),
            ctx.run_id
        )
    });
    let request = AgentExecuteRequest {
        action: action.to_string(),
        params,
        run_id: ctx.run_id.to_string(),
        node_id: ctx.node_id.to_string(),
        step_id: ctx.step_id.to_string(),
        callback_url,
    };

    let call = kernel.transport.execute(&target.url, &request);
    let response = match timeout_ms {
        Some(ms) if ms > 0 => {
            match tokio::time::timeout(Duration::from_millis(ms as u64), call).await {
                Ok(response) => response,
                Err(_) => {
                    self::record_failure(kernel, target).await;
                    return Err(EngineError::Timeout { timeout_ms: ms });
                }
            }
        }
        _ => call.await,
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            self::record_failure(kernel, target).await;
            return Err(e);
        }
    };

    if response.status == "accepted" {
        // 202 callback mode: the run suspends; the callback endpoint writes
        // the idempotency row and requeues.
        info!(
            run_id = %ctx.run_id,
            node_id = %ctx.node_id,
            step_id = %ctx.step_id,
            "agent accepted async workflow; awaiting callback"
        );
        self::record_success(kernel, target, ctx).await;
        return Err(EngineError::CallbackPending {
            node_id: ctx.node_id.to_string(),
            step_id: ctx.step_id.to_string(),
        });
    }
    if response.status == "error" || response.error.is_some() {
        self::record_failure(kernel, target).await;
        return Err(EngineError::Dispatch(
            response
                .error
                .unwrap_or_else(|| "agent reported an unspecified error".to_string()),
        ));
    }

    self::record_success(kernel, target, ctx).await;
    Ok(response.result.unwrap_or(Value::Null))
}

async fn record_success(kernel: &OrchestratorKernel, target: &AgentTarget, ctx: &StepContext<'_>) {
    let Some(agent) = &target.agent else {
        return;
    };
    if let Err(e) = AgentInstance::record_dispatch_success(&kernel.pool, &agent.agent_id).await {
        warn!(agent_id = %agent.agent_id, error = %e, "failed to reset agent circuit state");
    }
    if let Err(e) = AgentInstance::record_dispatch_count(&kernel.pool, &agent.agent_id).await {
        warn!(agent_id = %agent.agent_id, error = %e, "failed to bump dispatch counter");
    }
    if let Some(channel) = ctx.channel {
        kernel
            .affinity
            .pin(ctx.run_id, channel, &agent.agent_id)
            .await;
    }
}

async fn record_failure(kernel: &OrchestratorKernel, target: &AgentTarget) {
    let Some(agent) = &target.agent else {
        return;
    };
    let threshold = kernel.settings.circuit_open_threshold;
    if let Err(e) =
        AgentInstance::record_dispatch_failure(&kernel.pool, &agent.agent_id, threshold).await
    {
        warn!(agent_id = %agent.agent_id, error = %e, "failed to record agent dispatch failure");
    }
}
