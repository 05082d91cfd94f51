//! Executor binding pass.
//!
//! Steps and processing operations whose action is a built-in internal action
//! get a static `Binding::Internal`; everything else stays unbound and is
//! resolved against the agent registry at runtime.

use super::ir::{Binding, NodeKind, ProcedureIr};
use super::validator::is_internal_action;

pub fn bind_executors(ir: &mut ProcedureIr) {
    for node in ir.nodes.values_mut() {
        if let NodeKind::Sequence(seq) = &mut node.kind {
            for step in &mut seq.steps {
                if step.executor.is_none() && is_internal_action(&step.action) {
                    step.executor = Some(Binding::Internal);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parse_ckp;
    use serde_json::json;

    #[test]
    fn internal_actions_are_bound_statically() {
        let ckp = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "agent": "web", "steps": [
                    {"step_id": "s1", "action": "log"},
                    {"step_id": "s2", "action": "open_page"}
                ]}
            }}
        });
        let mut ir = parse_ckp(&ckp).unwrap();
        bind_executors(&mut ir);
        let NodeKind::Sequence(seq) = &ir.nodes["a"].kind else {
            panic!("expected sequence");
        };
        assert_eq!(seq.steps[0].executor, Some(Binding::Internal));
        assert_eq!(seq.steps[1].executor, None);
    }

    #[test]
    fn explicit_bindings_are_preserved() {
        let ckp = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "steps": [
                    {"step_id": "s1", "action": "log",
                     "executor": {"kind": "mcp_tool", "ref": "http://mcp.local"}}
                ]}
            }}
        });
        let mut ir = parse_ckp(&ckp).unwrap();
        bind_executors(&mut ir);
        let NodeKind::Sequence(seq) = &ir.nodes["a"].kind else {
            panic!("expected sequence");
        };
        assert_eq!(
            seq.steps[0].executor,
            Some(Binding::McpTool {
                url: "http://mcp.local".into()
            })
        );
    }
}
