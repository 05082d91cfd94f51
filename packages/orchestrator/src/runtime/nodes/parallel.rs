//! Parallel node: branches run on sibling tasks and merge variable deltas.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::compiler::ir::{IrNode, ParallelPayload};
use crate::error::EngineResult;
use crate::runtime::state::{RunState, TERMINAL_AWAITING_APPROVAL};
use crate::runtime::walker::GraphWalker;

impl GraphWalker {
    pub(crate) async fn execute_parallel(
        &self,
        node: &IrNode,
        parallel: &ParallelPayload,
        mut state: RunState,
    ) -> EngineResult<RunState> {
        if parallel.branches.is_empty() {
            state.next_node_id = parallel.next_node_id.clone();
            state.current_node_id = node.node_id.clone();
            return Ok(state);
        }

        let base_vars = state.vars.clone();
        let wait_any = parallel.wait_strategy.eq_ignore_ascii_case("any");
        let fail_fast = parallel.branch_failure.eq_ignore_ascii_case("fail");

        // Fork one task per branch; each drives a sub-walk until the join
        // node, a terminal, or an error.
        let mut handles = Vec::with_capacity(parallel.branches.len());
        for branch in &parallel.branches {
            let walker = self.clone();
            let join_node = parallel.next_node_id.clone();
            let start_node = branch.start_node_id.clone();
            let branch_id = branch.branch_id.clone();
            let mut branch_state = state.clone();
            branch_state.vars = base_vars.clone();
            branch_state.error = None;
            branch_state.terminal_status = None;
            branch_state.awaiting_approval = None;
            branch_state.next_node_id = None;
            handles.push(tokio::spawn(async move {
                let final_state = walker.walk(start_node, branch_state, join_node).await;
                (branch_id, final_state)
            }));
        }

        let mut branch_deltas: Map<String, Value> = Map::new();
        let mut branch_errors: Map<String, Value> = Map::new();
        let mut pending = handles;
        let mut first_failure: Option<Value> = None;
        let mut awaiting: Option<RunState> = None;
        let mut any_succeeded = false;

        while !pending.is_empty() {
            let (joined, _index, rest) = futures::future::select_all(pending).await;
            pending = rest;
            let (branch_id, outcome) = match joined {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(error = %join_error, "parallel branch task panicked");
                    first_failure.get_or_insert(json!({
                        "message": "parallel branch task failed",
                    }));
                    continue;
                }
            };
            let branch_final = match outcome {
                Ok(branch_final) => branch_final,
                Err(error) => {
                    // Cancellation and callback suspension propagate
                    if error.bypasses_handlers() {
                        for handle in &pending {
                            handle.abort();
                        }
                        return Err(error);
                    }
                    branch_errors.insert(branch_id.clone(), json!(error.to_string()));
                    first_failure.get_or_insert(json!({
                        "message": format!("Parallel branch '{branch_id}' failed"),
                        "node_id": node.node_id,
                        "branch_error": error.to_string(),
                    }));
                    continue;
                }
            };

            branch_deltas.insert(
                branch_id.clone(),
                Value::Object(RunState::var_delta(&base_vars, &branch_final.vars)),
            );

            if matches!(
                branch_final.terminal_status.as_deref(),
                Some(TERMINAL_AWAITING_APPROVAL)
                    | Some(crate::runtime::state::TERMINAL_AWAITING_CALLBACK)
            ) {
                awaiting = Some(branch_final);
                break;
            }

            if let Some(error) = &branch_final.error {
                branch_errors.insert(branch_id.clone(), error.clone());
                if fail_fast {
                    first_failure.get_or_insert(json!({
                        "message": format!("Parallel branch '{branch_id}' failed"),
                        "node_id": node.node_id,
                        "branch_error": error,
                    }));
                    break;
                }
                continue;
            }

            any_succeeded = true;
            if wait_any {
                // First clean completion wins; stop waiting on the rest
                break;
            }
        }
        for handle in &pending {
            handle.abort();
        }

        if let Some(mut awaiting_state) = awaiting {
            awaiting_state.current_node_id = node.node_id.clone();
            awaiting_state.next_node_id = None;
            return Ok(awaiting_state);
        }

        let failed = if fail_fast {
            first_failure.is_some() || !branch_errors.is_empty()
        } else if wait_any {
            !any_succeeded
        } else {
            false
        };
        if failed {
            let error = first_failure.unwrap_or_else(|| {
                json!({
                    "message": "parallel node failed",
                    "node_id": node.node_id,
                    "errors": branch_errors,
                })
            });
            state.vars = base_vars;
            state.fail(&node.node_id, error);
            return Ok(state);
        }

        // Merge branch deltas, last-writer-wins, then record the per-branch
        // delta and error maps.
        let mut merged = base_vars.clone();
        for delta in branch_deltas.values() {
            if let Some(delta_map) = delta.as_object() {
                for (key, value) in delta_map {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged.insert(
            "parallel_results".to_string(),
            json!({
                "branches": branch_deltas,
                "errors": branch_errors,
            }),
        );

        state.vars = merged;
        state.next_node_id = parallel.next_node_id.clone();
        state.current_node_id = node.node_id.clone();
        Ok(state)
    }
}
