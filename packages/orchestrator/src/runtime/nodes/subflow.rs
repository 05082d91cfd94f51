//! Subflow node: run a child procedure inside the parent run.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::compiler::ir::{IrNode, SubflowPayload};
use crate::compiler::{bind_executors, parse_ckp, validate_ir};
use crate::db::{Procedure, RunEvent};
use crate::error::EngineResult;
use crate::runtime::state::RunState;
use crate::runtime::walker::{GraphWalker, MAX_SUBFLOW_DEPTH};
use crate::template::render_str;

impl GraphWalker {
    pub(crate) async fn execute_subflow(
        &self,
        node: &IrNode,
        payload: &SubflowPayload,
        mut state: RunState,
    ) -> EngineResult<RunState> {
        if self.subflow_depth >= MAX_SUBFLOW_DEPTH {
            state.fail(
                &node.node_id,
                json!({
                    "message": format!("subflow nesting exceeded depth {MAX_SUBFLOW_DEPTH}"),
                    "node_id": node.node_id,
                }),
            );
            return Ok(state);
        }

        // Child vars: optionally inherited, then input_mapping (a vars-key
        // lookup when the value names an existing var, else a template).
        let mut child_vars: Map<String, Value> = if payload.inherit_context {
            state.vars.clone()
        } else {
            Map::new()
        };
        for (child_key, mapping) in &payload.input_mapping {
            let value = match mapping {
                Value::String(source) => match state.vars.get(source) {
                    Some(existing) => existing.clone(),
                    None => Value::String(render_str(source, &state.vars)),
                },
                other => other.clone(),
            };
            child_vars.insert(child_key.clone(), value);
        }

        // Load and compile the child procedure
        let child_proc = match &payload.version {
            Some(version) => {
                Procedure::find(&self.kernel.pool, &payload.procedure_id, version).await?
            }
            None => Procedure::find_latest(&self.kernel.pool, &payload.procedure_id).await?,
        };
        let Some(child_proc) = child_proc else {
            state.fail(
                &node.node_id,
                json!({
                    "message": format!(
                        "Subflow procedure not found: {}:{}",
                        payload.procedure_id,
                        payload.version.as_deref().unwrap_or("latest")
                    ),
                    "node_id": node.node_id,
                }),
            );
            return Ok(state);
        };

        RunEvent::emit(
            &self.kernel.pool,
            &state.run_id,
            "subflow_started",
            Some(&node.node_id),
            None,
            None,
            Some(&json!({
                "procedure_id": child_proc.procedure_id,
                "version": child_proc.version,
            })),
        )
        .await?;

        let ckp: Value = match serde_json::from_str(&child_proc.ckp_json) {
            Ok(ckp) => ckp,
            Err(e) => {
                state.fail(
                    &node.node_id,
                    json!({
                        "message": format!("Subflow CKP is not valid JSON: {e}"),
                        "node_id": node.node_id,
                    }),
                );
                return Ok(state);
            }
        };
        let mut child_ir = match parse_ckp(&ckp) {
            Ok(ir) => ir,
            Err(e) => {
                state.fail(
                    &node.node_id,
                    json!({
                        "message": format!("Subflow compile failed: {e}"),
                        "node_id": node.node_id,
                    }),
                );
                return Ok(state);
            }
        };
        let validation_errors = validate_ir(&child_ir);
        if !validation_errors.is_empty() {
            state.fail(
                &node.node_id,
                json!({
                    "message": "Subflow validation failed",
                    "node_id": node.node_id,
                    "errors": validation_errors,
                }),
            );
            return Ok(state);
        }
        bind_executors(&mut child_ir);

        // Sub-scoped durability namespace for the nested traversal. Chains
        // through nested subflows and carries the enclosing loop cursor, so
        // each invocation of the same child procedure gets its own
        // step-idempotency coordinates instead of replaying a sibling's.
        let scope_base = state
            .durability_scope
            .clone()
            .unwrap_or_else(|| state.run_id.clone());
        let mut subflow_thread_id = format!(
            "{}:subflow:{}:{}:{}",
            scope_base, node.node_id, child_ir.procedure_id, child_ir.version
        );
        if let Some(index) = state.vars.get("loop_index").and_then(|v| v.as_i64()) {
            subflow_thread_id.push_str(&format!("@{index}"));
        }
        info!(thread_id = %subflow_thread_id, "executing subflow");

        let mut child_state = RunState::new(
            &state.run_id,
            &child_ir.procedure_id,
            &child_ir.version,
        );
        child_state.vars = child_vars;
        child_state.execution_mode = state.execution_mode.clone();
        child_state.durability_scope = Some(subflow_thread_id.clone());

        let entry = child_ir.start_node_id.clone();
        let child_walker = self.child_for_subflow(Arc::new(child_ir));
        let child_final = child_walker.run(child_state, &entry).await?;

        if let Some(child_error) = &child_final.error {
            if payload.on_failure.eq_ignore_ascii_case("continue") {
                state.next_node_id = payload.next_node_id.clone();
                state.current_node_id = node.node_id.clone();
                return Ok(state);
            }
            state.fail(
                &node.node_id,
                json!({
                    "message": "Subflow execution failed",
                    "node_id": node.node_id,
                    "subflow_error": child_error,
                }),
            );
            return Ok(state);
        }

        // Copy mapped outputs back (or dump everything under subflow_output)
        if payload.output_mapping.is_empty() {
            state.vars.insert(
                "subflow_output".to_string(),
                Value::Object(child_final.vars.clone()),
            );
        } else {
            for (parent_key, child_key) in &payload.output_mapping {
                let value = match child_key {
                    Value::String(child_key) => child_final
                        .vars
                        .get(child_key)
                        .cloned()
                        .unwrap_or(Value::Null),
                    other => other.clone(),
                };
                state.vars.insert(parent_key.clone(), value);
            }
        }

        RunEvent::emit(
            &self.kernel.pool,
            &state.run_id,
            "subflow_completed",
            Some(&node.node_id),
            None,
            None,
            Some(&json!({
                "procedure_id": child_final.procedure_id,
                "version": child_final.procedure_version,
            })),
        )
        .await?;

        state.next_node_id = payload.next_node_id.clone();
        state.current_node_id = node.node_id.clone();
        Ok(state)
    }
}
