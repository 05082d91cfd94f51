//! Logic, loop, verification, processing, and terminate executors.

use serde_json::{json, Value};
use tracing::warn;

use crate::compiler::ir::{
    IrNode, LogicPayload, LoopPayload, ProcessingPayload, TerminatePayload, VerificationPayload,
};
use crate::error::EngineResult;
use crate::runtime::actions::execute_internal_action;
use crate::runtime::state::RunState;
use crate::runtime::walker::GraphWalker;
use crate::template::{evaluate_condition, render_str, render_value};

impl GraphWalker {
    /// First rule whose rendered condition evaluates true wins; otherwise
    /// the default target.
    pub(crate) fn execute_logic(
        &self,
        node: &IrNode,
        logic: &LogicPayload,
        mut state: RunState,
    ) -> RunState {
        for rule in &logic.rules {
            let rendered = render_str(&rule.condition_expr, &state.vars);
            if evaluate_condition(&rendered, &state.vars) {
                state.next_node_id = Some(rule.next_node_id.clone());
                state.current_node_id = node.node_id.clone();
                return state;
            }
        }
        state.next_node_id = logic.default_next_node_id.clone();
        state.current_node_id = node.node_id.clone();
        state
    }

    /// Advance the loop cursor: expose the current item and route to the
    /// body, or reset and route to the exit on exhaustion.
    pub(crate) fn execute_loop(
        &self,
        node: &IrNode,
        lp: &LoopPayload,
        mut state: RunState,
    ) -> RunState {
        let items: Vec<Value> = state
            .vars
            .get(&lp.iterator_var)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let index = *state.loop_indices.get(&node.node_id).unwrap_or(&0);

        if index < items.len() {
            let item = items[index].clone();
            state
                .vars
                .insert(lp.iterator_variable.clone(), item.clone());
            if let Some(index_variable) = &lp.index_variable {
                state.vars.insert(index_variable.clone(), json!(index));
            }
            state.vars.insert("loop_index".to_string(), json!(index));
            state.vars.insert("loop_item".to_string(), item);
            state.loop_indices.insert(node.node_id.clone(), index + 1);
            state.next_node_id = Some(lp.body_node_id.clone());
        } else {
            state.loop_indices.insert(node.node_id.clone(), 0);
            state.next_node_id = lp.next_node_id.clone();
        }
        state.current_node_id = node.node_id.clone();
        state
    }

    /// Evaluate checks in order; a failing `fail_workflow` check halts the
    /// run, anything else logs and continues.
    pub(crate) fn execute_verification(
        &self,
        node: &IrNode,
        verification: &VerificationPayload,
        mut state: RunState,
    ) -> RunState {
        for check in &verification.checks {
            let rendered = render_str(&check.condition, &state.vars);
            if !evaluate_condition(&rendered, &state.vars) {
                if check.on_fail == "fail_workflow" {
                    state.fail(
                        &node.node_id,
                        json!({
                            "message": check.message,
                            "node_id": node.node_id,
                            "check_id": check.id,
                        }),
                    );
                    return state;
                }
                warn!(node_id = %node.node_id, "verification warning: {}", check.message);
            }
        }
        state.next_node_id = verification.next_node_id.clone();
        state.current_node_id = node.node_id.clone();
        state
    }

    /// Run internal operations in order (same vocabulary as sequence
    /// internals).
    pub(crate) async fn execute_processing(
        &self,
        node: &IrNode,
        processing: &ProcessingPayload,
        mut state: RunState,
    ) -> EngineResult<RunState> {
        for op in &processing.operations {
            let rendered = render_value(&op.params, &state.vars);
            let result = execute_internal_action(&op.action, &rendered, &mut state.vars).await?;
            let output_var = rendered
                .get("output_variable")
                .and_then(|v| v.as_str())
                .map(String::from);
            if let Some(output_var) = output_var {
                if !result.is_null() {
                    state.vars.insert(output_var, result);
                }
            }
        }
        state.next_node_id = processing.next_node_id.clone();
        state.current_node_id = node.node_id.clone();
        Ok(state)
    }

    pub(crate) fn execute_terminate(
        &self,
        node: &IrNode,
        terminate: &TerminatePayload,
        mut state: RunState,
    ) -> RunState {
        state.terminal_status = Some(terminate.status.clone());
        state.next_node_id = None;
        state.current_node_id = node.node_id.clone();
        state
    }
}
