//! Graph traversal driver.
//!
//! Walks nodes by `next_node_id` until a terminal condition: an error, a
//! `failed`/`awaiting_approval` sentinel, or edge exhaustion. Nodes with
//! conditional routing (logic, approval replay, orchestration-mode LLM)
//! set their own `next_node_id`. Parallel branches reuse the same walker
//! with a join node that stops the sub-walk.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::compiler::ir::{NodeKind, ProcedureIr};
use crate::db::RunEvent;
use crate::error::EngineResult;
use crate::kernel::OrchestratorKernel;

use super::state::RunState;

/// Traversal guard against runaway cycles.
const MAX_HOPS: usize = 10_000;

/// Nesting guard against indirect subflow recursion (the validator only
/// catches direct self-reference).
pub const MAX_SUBFLOW_DEPTH: usize = 8;

#[derive(Clone)]
pub struct GraphWalker {
    pub(crate) kernel: Arc<OrchestratorKernel>,
    pub(crate) proc: Arc<ProcedureIr>,
    /// Bounds concurrent external dispatches when
    /// `global_config.rate_limiting.max_concurrent > 0`.
    pub(crate) rate_limiter: Option<Arc<Semaphore>>,
    pub(crate) subflow_depth: usize,
}

impl GraphWalker {
    pub fn new(kernel: Arc<OrchestratorKernel>, proc: Arc<ProcedureIr>) -> Self {
        let rate_limiter = proc
            .global_config
            .rate_limiting
            .as_ref()
            .filter(|rl| rl.max_concurrent > 0)
            .map(|rl| Arc::new(Semaphore::new(rl.max_concurrent as usize)));
        Self {
            kernel,
            proc,
            rate_limiter,
            subflow_depth: 0,
        }
    }

    pub(crate) fn child_for_subflow(
        &self,
        child_proc: Arc<ProcedureIr>,
    ) -> Self {
        let mut child = GraphWalker::new(self.kernel.clone(), child_proc);
        child.subflow_depth = self.subflow_depth + 1;
        child
    }

    /// Walk from `entry_node` until terminal; returns the final state.
    pub async fn run(&self, state: RunState, entry_node: &str) -> EngineResult<RunState> {
        self.walk(entry_node.to_string(), state, None).await
    }

    /// Walk from `start`, stopping before `join_node` when given (parallel
    /// branch sub-walks).
    pub(crate) fn walk(
        &self,
        start: String,
        mut state: RunState,
        join_node: Option<String>,
    ) -> BoxFuture<'_, EngineResult<RunState>> {
        Box::pin(async move {
            let mut current = start;
            let mut hops = 0usize;
            loop {
                if join_node.as_deref() == Some(current.as_str()) {
                    break;
                }
                hops += 1;
                if hops > MAX_HOPS {
                    state.fail(
                        &current,
                        json!({"message": "graph traversal exceeded max hops", "node_id": current}),
                    );
                    return Ok(state);
                }
                let Some(node) = self.proc.nodes.get(&current) else {
                    state.fail(
                        &current,
                        json!({"message": format!("node '{current}' not found"), "node_id": current}),
                    );
                    return Ok(state);
                };

                state.current_node_id = current.clone();
                state.next_node_id = None;
                state = self.execute_node(node, state).await?;
                if state.is_halted() {
                    return Ok(state);
                }

                if node.checkpoint {
                    RunEvent::emit(
                        &self.kernel.pool,
                        &state.run_id,
                        "checkpoint_saved",
                        Some(&node.node_id),
                        None,
                        None,
                        Some(&json!({"node_id": node.node_id})),
                    )
                    .await?;
                }

                let next = state
                    .next_node_id
                    .take()
                    .or_else(|| node.next_node_id.clone());
                match next {
                    Some(next) => current = next,
                    None => break,
                }
            }
            Ok(state)
        })
    }

    pub(crate) async fn execute_node(
        &self,
        node: &crate::compiler::ir::IrNode,
        state: RunState,
    ) -> EngineResult<RunState> {
        match &node.kind {
            NodeKind::Sequence(seq) => self.execute_sequence(node, seq, state).await,
            NodeKind::Logic(logic) => Ok(self.execute_logic(node, logic, state)),
            NodeKind::Loop(lp) => Ok(self.execute_loop(node, lp, state)),
            NodeKind::Parallel(par) => self.execute_parallel(node, par, state).await,
            NodeKind::HumanApproval(approval) => {
                Ok(self.execute_human_approval(node, approval, state))
            }
            NodeKind::LlmAction(llm) => self.execute_llm_action(node, llm, state).await,
            NodeKind::Subflow(subflow) => self.execute_subflow(node, subflow, state).await,
            NodeKind::Transform(transform) => Ok(self.execute_transform(node, transform, state)),
            NodeKind::Verification(verification) => {
                Ok(self.execute_verification(node, verification, state))
            }
            NodeKind::Processing(processing) => {
                self.execute_processing(node, processing, state).await
            }
            NodeKind::Terminate(terminate) => Ok(self.execute_terminate(node, terminate, state)),
        }
    }
}
