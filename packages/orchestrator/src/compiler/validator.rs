//! Static validator — checks IR integrity before execution.

use std::collections::{HashSet, VecDeque};

use lazy_static::lazy_static;
use regex::Regex;

use super::ir::{NodeKind, ProcedureIr};

const VALID_TRIGGER_TYPES: &[&str] = &["manual", "scheduled", "webhook", "event", "file_watch"];

/// Actions handled in-process by the orchestrator (no agent required).
pub const INTERNAL_ACTIONS: &[&str] = &[
    "log",
    "wait",
    "set_variable",
    "calculate",
    "format_data",
    "parse_json",
    "parse_csv",
    "generate_id",
    "get_timestamp",
    "set_checkpoint",
    "restore_checkpoint",
    "screenshot",
];

/// Variables always available at runtime without schema declaration.
const IMPLICIT_RUNTIME_VARS: &[&str] = &[
    "run_id",
    "procedure_id",
    "trigger_type",
    "triggered_by",
    "node_id",
    "step_id",
    "loop_index",
    "loop_item",
    "parallel_results",
    "llm_output",
];

lazy_static! {
    static ref TEMPLATE_VAR_RE: Regex =
        Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}").expect("static regex");
}

pub fn is_internal_action(action: &str) -> bool {
    INTERNAL_ACTIONS.contains(&action)
}

/// Variable names referenced as whole `{{ident}}` placeholders in `text`.
fn template_vars(text: &str) -> Vec<String> {
    TEMPLATE_VAR_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

fn push_missing(errors: &mut Vec<String>, ir: &ProcedureIr, nid: &str, label: &str, target: &str) {
    if !target.is_empty() && !ir.nodes.contains_key(target) {
        errors.push(format!("Node '{nid}': {label} '{target}' not found."));
    }
}

/// Return a list of human-readable error strings. Empty means valid.
pub fn validate_ir(ir: &ProcedureIr) -> Vec<String> {
    let mut errors: Vec<String> = Vec::new();

    if ir.procedure_id.is_empty() {
        errors.push("Missing procedure_id.".to_string());
    }
    if ir.version.is_empty() {
        errors.push("Missing version.".to_string());
    }
    if ir.start_node_id.is_empty() {
        errors.push("Missing workflow_graph.start_node.".to_string());
    } else if !ir.nodes.contains_key(&ir.start_node_id) {
        errors.push(format!(
            "start_node '{}' does not exist in nodes.",
            ir.start_node_id
        ));
    }

    let mut node_ids: Vec<&String> = ir.nodes.keys().collect();
    node_ids.sort();

    // ── Edge target existence ───────────────────────────────────
    for nid in &node_ids {
        let node = &ir.nodes[*nid];

        if let Some(next) = &node.next_node_id {
            push_missing(&mut errors, ir, nid, "next_node", next);
        }
        match &node.kind {
            NodeKind::Logic(logic) => {
                for rule in &logic.rules {
                    push_missing(&mut errors, ir, nid, "logic rule target", &rule.next_node_id);
                }
                if let Some(default) = &logic.default_next_node_id {
                    push_missing(&mut errors, ir, nid, "default_next_node", default);
                }
            }
            NodeKind::Loop(lp) => {
                push_missing(&mut errors, ir, nid, "loop body_node", &lp.body_node_id);
                if let Some(next) = &lp.next_node_id {
                    push_missing(&mut errors, ir, nid, "loop next_node", next);
                }
            }
            NodeKind::Parallel(par) => {
                for branch in &par.branches {
                    if !ir.nodes.contains_key(&branch.start_node_id) {
                        errors.push(format!(
                            "Node '{nid}': parallel branch '{}' start_node not found.",
                            branch.branch_id
                        ));
                    }
                }
                if let Some(next) = &par.next_node_id {
                    push_missing(&mut errors, ir, nid, "parallel next_node", next);
                }
            }
            NodeKind::HumanApproval(approval) => {
                for (label, target) in [
                    ("on_approve", &approval.on_approve),
                    ("on_reject", &approval.on_reject),
                    ("on_timeout", &approval.on_timeout),
                ] {
                    if let Some(target) = target {
                        push_missing(&mut errors, ir, nid, label, target);
                    }
                }
            }
            NodeKind::Subflow(subflow) => {
                if let Some(next) = &subflow.next_node_id {
                    push_missing(&mut errors, ir, nid, "subflow next_node", next);
                }
                if !subflow.procedure_id.is_empty() && subflow.procedure_id == ir.procedure_id {
                    errors.push(format!(
                        "Node '{nid}': subflow references its own procedure '{}' \
                         (direct self-recursion creates an infinite loop).",
                        ir.procedure_id
                    ));
                }
            }
            _ => {}
        }
    }

    // ── Trigger validation ──────────────────────────────────────
    if let Some(trigger) = &ir.trigger {
        if !VALID_TRIGGER_TYPES.contains(&trigger.trigger_type.as_str()) {
            errors.push(format!(
                "trigger.type '{}' is invalid. Must be one of: {:?}.",
                trigger.trigger_type, VALID_TRIGGER_TYPES
            ));
        }
        if trigger.trigger_type == "scheduled"
            && trigger.schedule.as_deref().unwrap_or("").is_empty()
        {
            errors.push("trigger.type 'scheduled' requires a 'schedule' (cron expression).".into());
        }
        if trigger.trigger_type == "webhook"
            && trigger.webhook_secret.as_deref().unwrap_or("").is_empty()
        {
            errors
                .push("trigger.type 'webhook' requires 'webhook_secret' for verification.".into());
        }
    }

    // ── Unreachable node detection (BFS over all outgoing edges) ─
    if !ir.start_node_id.is_empty() && ir.nodes.contains_key(&ir.start_node_id) {
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(&ir.start_node_id);
        while let Some(current) = queue.pop_front() {
            if !reachable.insert(current) {
                continue;
            }
            let Some(node) = ir.nodes.get(current) else {
                continue;
            };
            let mut edges: Vec<&str> = Vec::new();
            if let Some(next) = &node.next_node_id {
                edges.push(next);
            }
            match &node.kind {
                NodeKind::Logic(logic) => {
                    edges.extend(logic.rules.iter().map(|r| r.next_node_id.as_str()));
                    if let Some(default) = &logic.default_next_node_id {
                        edges.push(default);
                    }
                }
                NodeKind::Loop(lp) => {
                    edges.push(&lp.body_node_id);
                    if let Some(next) = &lp.next_node_id {
                        edges.push(next);
                    }
                }
                NodeKind::Parallel(par) => {
                    edges.extend(par.branches.iter().map(|b| b.start_node_id.as_str()));
                    if let Some(next) = &par.next_node_id {
                        edges.push(next);
                    }
                }
                NodeKind::HumanApproval(approval) => {
                    for target in [
                        &approval.on_approve,
                        &approval.on_reject,
                        &approval.on_timeout,
                    ]
                    .into_iter()
                    .flatten()
                    {
                        edges.push(target);
                    }
                }
                NodeKind::Subflow(subflow) => {
                    if let Some(next) = &subflow.next_node_id {
                        edges.push(next);
                    }
                }
                NodeKind::LlmAction(llm) => {
                    if let Some(next) = &llm.next_node_id {
                        edges.push(next);
                    }
                    edges.extend(llm.branches.iter().map(String::as_str));
                }
                NodeKind::Transform(t) => {
                    if let Some(next) = &t.next_node_id {
                        edges.push(next);
                    }
                }
                NodeKind::Verification(v) => {
                    if let Some(next) = &v.next_node_id {
                        edges.push(next);
                    }
                }
                NodeKind::Processing(p) => {
                    if let Some(next) = &p.next_node_id {
                        edges.push(next);
                    }
                }
                NodeKind::Sequence(_) | NodeKind::Terminate(_) => {}
            }
            for next in edges {
                if !next.is_empty() && !reachable.contains(next) && ir.nodes.contains_key(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut unreachable: Vec<&&String> = node_ids
            .iter()
            .filter(|nid| !reachable.contains(nid.as_str()))
            .collect();
        unreachable.sort();
        for nid in unreachable {
            errors.push(format!(
                "Node '{nid}' is unreachable from start_node '{}'.",
                ir.start_node_id
            ));
        }
    }

    // ── Template variable coverage ──────────────────────────────
    // Known variables: schema keys, implicit runtime vars, step output vars,
    // llm outputs keys, loop-produced vars. Only enforced when the schema is
    // non-empty.
    let mut known_vars: HashSet<String> = ir.variables_schema.keys().cloned().collect();
    known_vars.extend(IMPLICIT_RUNTIME_VARS.iter().map(|v| v.to_string()));
    for node in ir.nodes.values() {
        match &node.kind {
            NodeKind::Sequence(seq) => {
                for step in &seq.steps {
                    if let Some(out) = &step.output_variable {
                        known_vars.insert(out.clone());
                    }
                }
            }
            NodeKind::LlmAction(llm) => {
                known_vars.extend(llm.outputs.keys().cloned());
            }
            NodeKind::Loop(lp) => {
                known_vars.insert(lp.iterator_variable.clone());
                if let Some(idx) = &lp.index_variable {
                    known_vars.insert(idx.clone());
                }
                if let Some(collect) = &lp.collect_variable {
                    known_vars.insert(collect.clone());
                }
            }
            _ => {}
        }
    }
    if !ir.variables_schema.is_empty() {
        for nid in &node_ids {
            let node = &ir.nodes[*nid];
            match &node.kind {
                NodeKind::Sequence(seq) => {
                    for step in &seq.steps {
                        let params_text =
                            serde_json::to_string(&step.params).unwrap_or_default();
                        let idem_text = step.idempotency_key.as_deref().unwrap_or("");
                        for var in template_vars(&format!("{params_text} {idem_text}")) {
                            if !known_vars.contains(&var) {
                                errors.push(format!(
                                    "Node '{nid}', step '{}': template references undeclared \
                                     variable '{{{{{var}}}}}'.",
                                    step.step_id
                                ));
                            }
                        }
                    }
                }
                NodeKind::LlmAction(llm) => {
                    let text = format!(
                        "{} {}",
                        llm.prompt,
                        llm.system_prompt.as_deref().unwrap_or("")
                    );
                    for var in template_vars(&text) {
                        if !known_vars.contains(&var) {
                            errors.push(format!(
                                "Node '{nid}' (llm_action): prompt references undeclared \
                                 variable '{{{{{var}}}}}'.",
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // ── Action / channel compatibility ──────────────────────────
    // External-action steps need a node-level agent channel, otherwise the
    // step is unresolvable at runtime.
    for nid in &node_ids {
        let node = &ir.nodes[*nid];
        if let NodeKind::Sequence(seq) = &node.kind {
            if node.agent.is_some() {
                continue;
            }
            for step in &seq.steps {
                if step.executor.is_some() {
                    continue;
                }
                if !is_internal_action(&step.action) {
                    errors.push(format!(
                        "Node '{nid}', step '{}': action '{}' is not a built-in internal \
                         action, but node '{nid}' has no 'agent' field set. The step may be \
                         unresolvable at runtime.",
                        step.step_id, step.action
                    ));
                }
            }
        }
    }

    errors
}
