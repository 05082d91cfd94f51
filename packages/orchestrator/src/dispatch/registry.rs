//! Executor resolution.
//!
//! Order: explicit step binding, then the built-in internal action set, then
//! the agent registry (channel match + capability match, skipping agents
//! whose circuit is open, preferring the run's pinned agent).

use crate::common::time::now_ms;
use crate::compiler::ir::{Binding, IrNode, Step};
use crate::compiler::validator::is_internal_action;
use crate::db::AgentInstance;
use crate::error::{EngineError, EngineResult};
use crate::kernel::OrchestratorKernel;

/// A fully-resolved agent target. `agent` is absent only for explicit URL
/// bindings with no matching registry row.
#[derive(Debug, Clone)]
pub struct AgentTarget {
    pub url: String,
    pub agent: Option<AgentInstance>,
    /// The matched capability declared `type=workflow`, so the dispatcher
    /// uses async-callback mode.
    pub workflow_mode: bool,
}

#[derive(Debug, Clone)]
pub enum ResolvedExecutor {
    Internal,
    Agent(AgentTarget),
    Mcp { url: String },
}

pub async fn resolve_executor(
    kernel: &OrchestratorKernel,
    node: &IrNode,
    step: &Step,
    run_id: &str,
) -> EngineResult<ResolvedExecutor> {
    // 1. Explicit binding from the CKP (or the binder's static internal tag)
    if let Some(binding) = &step.executor {
        return match binding {
            Binding::Internal => Ok(ResolvedExecutor::Internal),
            Binding::AgentHttp { url } => {
                let agent = AgentInstance::find_by_base_url(&kernel.pool, url).await?;
                let workflow_mode = agent
                    .as_ref()
                    .and_then(|a| a.capability_for(&step.action))
                    .map(|c| c.cap_type == "workflow")
                    .unwrap_or(false);
                Ok(ResolvedExecutor::Agent(AgentTarget {
                    url: url.clone(),
                    agent,
                    workflow_mode,
                }))
            }
            Binding::McpTool { url } => Ok(ResolvedExecutor::Mcp { url: url.clone() }),
        };
    }

    // 2. Built-in internal actions
    if is_internal_action(&step.action) {
        return Ok(ResolvedExecutor::Internal);
    }

    // 3. Agent registry by channel and capability
    let channel = node.agent.as_deref().ok_or_else(|| {
        EngineError::Dispatch(format!(
            "step '{}' action '{}' has no agent channel to resolve against",
            step.step_id, step.action
        ))
    })?;
    let target = find_capable_agent(kernel, channel, &step.action, run_id).await?;
    match target {
        Some(target) => Ok(ResolvedExecutor::Agent(target)),
        None => Err(EngineError::Dispatch(format!(
            "no capable online agent for action '{}' on channel '{}'",
            step.action, channel
        ))),
    }
}

/// Pick an online agent on `channel` that declares `action` (or `*`),
/// skipping open circuits and preferring the run's pinned agent.
pub async fn find_capable_agent(
    kernel: &OrchestratorKernel,
    channel: &str,
    action: &str,
    run_id: &str,
) -> EngineResult<Option<AgentTarget>> {
    let agents = AgentInstance::list_online(&kernel.pool, channel).await?;
    let now = now_ms();
    let reset_ms = kernel.settings.circuit_reset.as_millis() as i64;

    let mut capable: Vec<AgentTarget> = Vec::new();
    for agent in agents {
        if agent.circuit_is_open(now, reset_ms) {
            tracing::debug!(agent_id = %agent.agent_id, "skipping agent with open circuit");
            continue;
        }
        let Some(capability) = agent.capability_for(action) else {
            continue;
        };
        capable.push(AgentTarget {
            url: agent.base_url.clone(),
            workflow_mode: capability.cap_type == "workflow",
            agent: Some(agent),
        });
    }
    if capable.is_empty() {
        return Ok(None);
    }

    if let Some(pinned) = kernel.affinity.preferred(run_id, channel).await {
        if let Some(target) = capable
            .iter()
            .find(|t| t.agent.as_ref().map(|a| a.agent_id.as_str()) == Some(pinned.as_str()))
        {
            return Ok(Some(target.clone()));
        }
    }
    Ok(Some(capable.remove(0)))
}
