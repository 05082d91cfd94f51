//! Human-approval node: replay an injected decision, or pause the run.

use crate::compiler::ir::{HumanApprovalPayload, IrNode};
use crate::runtime::state::{ApprovalRequest, RunState, TERMINAL_AWAITING_APPROVAL};
use crate::runtime::walker::GraphWalker;

/// Route an approval decision to the configured branch.
pub(crate) fn resolve_decision_branch(
    payload: &HumanApprovalPayload,
    decision: &str,
) -> Option<String> {
    match decision {
        "approved" => payload.on_approve.clone(),
        "rejected" => payload.on_reject.clone(),
        "timeout" => payload.on_timeout.clone().or_else(|| payload.on_reject.clone()),
        _ => payload.on_reject.clone(),
    }
}

impl GraphWalker {
    pub(crate) fn execute_human_approval(
        &self,
        node: &IrNode,
        payload: &HumanApprovalPayload,
        mut state: RunState,
    ) -> RunState {
        // Resume case: a decision was injected into the run's input vars
        if let Some(decision) = state.approval_decision_for(&node.node_id) {
            state.next_node_id = resolve_decision_branch(payload, &decision);
            state.approval_decision = Some(decision);
            state.current_node_id = node.node_id.clone();
            return state;
        }

        state.awaiting_approval = Some(ApprovalRequest {
            run_id: state.run_id.clone(),
            node_id: node.node_id.clone(),
            prompt: payload.prompt.clone(),
            decision_type: payload.decision_type.clone(),
            options: payload.options.clone(),
            context_data: payload.context_data.clone(),
            timeout_seconds: payload.timeout_seconds,
        });
        state.terminal_status = Some(TERMINAL_AWAITING_APPROVAL.to_string());
        state.current_node_id = node.node_id.clone();
        state.next_node_id = None;
        state
    }
}
