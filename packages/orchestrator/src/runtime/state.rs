//! Working state carried through a graph traversal.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Sentinel terminal markers used inside a traversal before the run
/// orchestrator maps them onto run statuses.
pub const TERMINAL_FAILED: &str = "failed";
pub const TERMINAL_AWAITING_APPROVAL: &str = "awaiting_approval";
pub const TERMINAL_AWAITING_CALLBACK: &str = "awaiting_callback";

/// A pending approval request surfaced by a human_approval node.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub run_id: String,
    pub node_id: String,
    pub prompt: String,
    pub decision_type: String,
    pub options: Value,
    pub context_data: Value,
    pub timeout_seconds: Option<i64>,
}

/// Mutable traversal state. Parallel branches fork a deep copy and merge
/// their variable deltas back into the parent.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: String,
    pub procedure_id: String,
    pub procedure_version: String,
    pub vars: Map<String, Value>,
    pub current_node_id: String,
    pub next_node_id: Option<String>,
    /// Structured error captured from a failing node.
    pub error: Option<Value>,
    pub terminal_status: Option<String>,
    pub awaiting_approval: Option<ApprovalRequest>,
    pub approval_decision: Option<String>,
    /// `(node_id, step_id)` of a 202-accepted agent call awaiting its
    /// callback; the run suspends at this anchor.
    pub callback_pending: Option<(String, String)>,
    /// Per-loop-node iteration cursors, keyed by node id.
    pub loop_indices: HashMap<String, usize>,
    pub execution_mode: String,
    /// Durability namespace for nested traversals. `None` for the root
    /// graph; a subflow walk carries its sub-scoped thread id so its step
    /// idempotency rows never collide with another invocation of the same
    /// child procedure in the same run.
    pub durability_scope: Option<String>,
}

impl RunState {
    pub fn new(run_id: &str, procedure_id: &str, procedure_version: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            procedure_id: procedure_id.to_string(),
            procedure_version: procedure_version.to_string(),
            vars: Map::new(),
            current_node_id: String::new(),
            next_node_id: None,
            error: None,
            terminal_status: None,
            awaiting_approval: None,
            approval_decision: None,
            callback_pending: None,
            loop_indices: HashMap::new(),
            execution_mode: "production".to_string(),
            durability_scope: None,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.error.is_some()
            || matches!(
                self.terminal_status.as_deref(),
                Some(TERMINAL_FAILED)
                    | Some(TERMINAL_AWAITING_APPROVAL)
                    | Some(TERMINAL_AWAITING_CALLBACK)
            )
    }

    /// Record a node-level failure and stop traversal.
    pub fn fail(&mut self, node_id: &str, error: Value) {
        self.error = Some(error);
        self.terminal_status = Some(TERMINAL_FAILED.to_string());
        self.next_node_id = None;
        self.current_node_id = node_id.to_string();
    }

    /// Approval decision previously injected for a node, if any.
    pub fn approval_decision_for(&self, node_id: &str) -> Option<String> {
        self.vars
            .get("__approval_decisions")?
            .as_object()?
            .get(node_id)?
            .as_str()
            .map(String::from)
    }

    /// Variables that changed relative to `base` (new keys or new values).
    pub fn var_delta(base: &Map<String, Value>, branch: &Map<String, Value>) -> Map<String, Value> {
        let mut delta = Map::new();
        for (key, value) in branch {
            if base.get(key) != Some(value) {
                delta.insert(key.clone(), value.clone());
            }
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fail_halts_traversal() {
        let mut state = RunState::new("r", "p", "1");
        assert!(!state.is_halted());
        state.fail("n1", json!({"message": "boom"}));
        assert!(state.is_halted());
        assert_eq!(state.next_node_id, None);
        assert_eq!(state.terminal_status.as_deref(), Some("failed"));
    }

    #[test]
    fn approval_decision_lookup() {
        let mut state = RunState::new("r", "p", "1");
        state.vars.insert(
            "__approval_decisions".into(),
            json!({"gate": "approved"}),
        );
        assert_eq!(state.approval_decision_for("gate").as_deref(), Some("approved"));
        assert_eq!(state.approval_decision_for("other"), None);
    }

    #[test]
    fn var_delta_detects_changes() {
        let base = json!({"a": 1, "b": 2}).as_object().unwrap().clone();
        let branch = json!({"a": 1, "b": 3, "c": 4}).as_object().unwrap().clone();
        let delta = RunState::var_delta(&base, &branch);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["b"], 3);
        assert_eq!(delta["c"], 4);
    }
}
