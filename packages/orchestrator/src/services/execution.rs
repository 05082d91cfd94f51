//! Run orchestrator: load -> resume detection -> gate -> compile -> walk ->
//! outcome mapping.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::common::time::today_utc;
use crate::compiler::{bind_executors, parse_ckp, validate_ir};
use crate::db::{Approval, Procedure, Run, RunEvent};
use crate::error::{EngineError, EngineResult};
use crate::kernel::OrchestratorKernel;
use crate::runtime::state::{
    RunState, TERMINAL_AWAITING_APPROVAL, TERMINAL_AWAITING_CALLBACK, TERMINAL_FAILED,
};
use crate::runtime::GraphWalker;

/// Execute (or resume) a run to its next stable point: terminal status,
/// approval pause, or callback suspension.
///
/// Returns `Err` only for cancellation and infrastructure failures — the
/// worker maps those onto the job. Workflow-level failures settle the run
/// as `failed` and return `Ok`.
pub async fn execute_run(kernel: &Arc<OrchestratorKernel>, run_id: &str) -> EngineResult<()> {
    let Some(run) = Run::find(&kernel.pool, run_id).await? else {
        error!(run_id = %run_id, "run not found");
        return Ok(());
    };
    if crate::db::run::is_terminal_status(&run.status) {
        info!(run_id = %run_id, status = %run.status, "run already terminal; nothing to do");
        return Ok(());
    }

    kernel.cancellations.register(run_id).await;
    let started = Instant::now();
    let result = execute_run_inner(kernel, &run).await;
    kernel.cancellations.unregister(run_id).await;
    kernel.affinity.clear_run(run_id).await;

    match result {
        Err(EngineError::Cancelled(reason)) => {
            // Cancellation: terminal `canceled`, no further events
            Run::update_status(&kernel.pool, run_id, "canceled", None).await?;
            kernel
                .metrics
                .record_run_completed(started.elapsed().as_secs_f64(), "canceled");
            Err(EngineError::Cancelled(reason))
        }
        other => other,
    }
}

async fn execute_run_inner(kernel: &Arc<OrchestratorKernel>, run: &Run) -> EngineResult<()> {
    let run_id = &run.run_id;
    let started = Instant::now();
    kernel.metrics.record_run_started();

    // Parse input vars up front so resume intent is known before execution
    let input_vars = run.input_vars();
    let input_map: Map<String, Value> = input_vars.as_object().cloned().unwrap_or_default();
    let approval_decisions: Map<String, Value> = input_map
        .get("__approval_decisions")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    let mut resume_entry_node: Option<String> = None;
    let mut resume_reason: Option<&str> = None;
    if let Some(last_node_id) = &run.last_node_id {
        if approval_decisions.contains_key(last_node_id) {
            resume_entry_node = Some(last_node_id.clone());
            resume_reason = Some("approval_resume");
        } else if RunEvent::exists(&kernel.pool, run_id, "run_retry_requested").await? {
            resume_entry_node = Some(last_node_id.clone());
            resume_reason = Some("retry_fallback");
        }
    }

    Run::update_status(&kernel.pool, run_id, "running", None).await?;

    // Load and gate the procedure
    let proc = Procedure::find(&kernel.pool, &run.procedure_id, &run.procedure_version).await?;
    let Some(proc) = proc else {
        return settle_failed(
            kernel,
            run_id,
            started,
            json!({"message": "Procedure not found"}),
        )
        .await;
    };
    if proc.status == "deprecated" || proc.status == "archived" {
        return settle_failed(
            kernel,
            run_id,
            started,
            json!({"message": format!("Procedure is {}", proc.status)}),
        )
        .await;
    }
    if let Some(effective_date) = &proc.effective_date {
        if !effective_date.is_empty() && today_utc().as_str() < effective_date.as_str() {
            return settle_failed(
                kernel,
                run_id,
                started,
                json!({"message": format!("Procedure not effective until {effective_date}")}),
            )
            .await;
        }
    }

    // Compile: parse -> validate -> bind
    let ckp: Value = match serde_json::from_str(&proc.ckp_json) {
        Ok(ckp) => ckp,
        Err(e) => {
            return settle_failed(
                kernel,
                run_id,
                started,
                json!({"message": format!("CKP is not valid JSON: {e}")}),
            )
            .await;
        }
    };
    let mut ir = match parse_ckp(&ckp) {
        Ok(ir) => ir,
        Err(e) => {
            return settle_failed(
                kernel,
                run_id,
                started,
                json!({"message": e.to_string()}),
            )
            .await;
        }
    };
    let validation_errors = validate_ir(&ir);
    if !validation_errors.is_empty() {
        return settle_failed(
            kernel,
            run_id,
            started,
            json!({"message": "CKP validation failed", "errors": validation_errors}),
        )
        .await;
    }
    bind_executors(&mut ir);

    // Initial state: schema defaults overlaid with input vars, plus the
    // implicit runtime variables
    let mut vars = ir.variables_schema.clone();
    for (key, value) in &input_map {
        vars.insert(key.clone(), value.clone());
    }
    vars.insert("run_id".to_string(), json!(run_id));
    vars.insert("procedure_id".to_string(), json!(ir.procedure_id));
    vars.insert("trigger_type".to_string(), json!(run.trigger_type));
    vars.insert("triggered_by".to_string(), json!(run.triggered_by));

    let mut state = RunState::new(run_id, &ir.procedure_id, &ir.version);
    state.vars = vars;
    if let Some(execution_mode) = &ir.global_config.execution_mode {
        state.execution_mode = execution_mode.clone();
    }

    let entry_node = resume_entry_node
        .clone()
        .unwrap_or_else(|| ir.start_node_id.clone());
    RunEvent::emit(
        &kernel.pool,
        run_id,
        "execution_started",
        None,
        None,
        None,
        Some(&json!({
            "entry_node_id": entry_node,
            "resume_reason": resume_reason,
        })),
    )
    .await?;

    let walker = GraphWalker::new(kernel.clone(), Arc::new(ir));
    let final_state = walker.run(state, &entry_node).await?;

    // Outcome mapping
    if let Some(error) = &final_state.error {
        Run::set_error_message(
            &kernel.pool,
            run_id,
            &error
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| error.to_string()),
        )
        .await?;
        Run::update_status(&kernel.pool, run_id, "failed", None).await?;
        RunEvent::emit(
            &kernel.pool,
            run_id,
            "run_failed",
            None,
            None,
            None,
            Some(&json!({"error": error})),
        )
        .await?;
        kernel
            .metrics
            .record_run_completed(started.elapsed().as_secs_f64(), "failed");
        info!(run_id = %run_id, "run failed");
        return Ok(());
    }

    match final_state.terminal_status.as_deref() {
        Some(TERMINAL_AWAITING_APPROVAL) => {
            let Some(request) = &final_state.awaiting_approval else {
                return settle_failed(
                    kernel,
                    run_id,
                    started,
                    json!({"message": "approval pause without a pending request"}),
                )
                .await;
            };
            // Persist current vars so resume continues without replaying
            // side effects
            Run::set_input_vars(
                &kernel.pool,
                run_id,
                &Value::Object(final_state.vars.clone()),
            )
            .await?;
            let expires_at = request
                .timeout_seconds
                .map(|secs| crate::common::time::now_ms() + secs * 1000);
            let approval = Approval::create(
                &kernel.pool,
                run_id,
                &request.node_id,
                &request.prompt,
                &request.decision_type,
                Some(&request.options),
                Some(&request.context_data),
                expires_at,
            )
            .await?;
            Run::update_status(
                &kernel.pool,
                run_id,
                "waiting_approval",
                Some(&request.node_id),
            )
            .await?;
            RunEvent::emit(
                &kernel.pool,
                run_id,
                "approval_requested",
                Some(&request.node_id),
                None,
                None,
                Some(&json!({"approval_id": approval.approval_id})),
            )
            .await?;
            info!(run_id = %run_id, node_id = %request.node_id, "run paused for approval");
            Ok(())
        }
        Some(TERMINAL_AWAITING_CALLBACK) => {
            // Anchor position and vars; the callback endpoint completes the
            // idempotency row and requeues, replaying through the cache
            let (node_id, step_id) = final_state
                .callback_pending
                .clone()
                .unwrap_or((final_state.current_node_id.clone(), String::new()));
            Run::set_input_vars(
                &kernel.pool,
                run_id,
                &Value::Object(final_state.vars.clone()),
            )
            .await?;
            Run::set_last_position(&kernel.pool, run_id, Some(&node_id), Some(&step_id)).await?;
            info!(run_id = %run_id, node_id = %node_id, step_id = %step_id, "run suspended awaiting agent callback");
            Ok(())
        }
        Some(TERMINAL_FAILED) => {
            Run::update_status(&kernel.pool, run_id, "failed", None).await?;
            RunEvent::emit(&kernel.pool, run_id, "run_failed", None, None, None, None).await?;
            kernel
                .metrics
                .record_run_completed(started.elapsed().as_secs_f64(), "failed");
            info!(run_id = %run_id, "run failed");
            Ok(())
        }
        _ => {
            // Natural completion (terminate node or edge exhaustion)
            Run::set_output_vars(
                &kernel.pool,
                run_id,
                &Value::Object(final_state.vars.clone()),
            )
            .await?;
            Run::update_status(&kernel.pool, run_id, "completed", None).await?;
            RunEvent::emit(
                &kernel.pool,
                run_id,
                "run_completed",
                None,
                None,
                None,
                Some(&json!({"outputs": final_state.vars})),
            )
            .await?;
            kernel
                .metrics
                .record_run_completed(started.elapsed().as_secs_f64(), "completed");
            info!(run_id = %run_id, "run completed");
            Ok(())
        }
    }
}

async fn settle_failed(
    kernel: &Arc<OrchestratorKernel>,
    run_id: &str,
    started: Instant,
    error: Value,
) -> EngineResult<()> {
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("run failed")
        .to_string();
    Run::set_error_message(&kernel.pool, run_id, &message).await?;
    Run::update_status(&kernel.pool, run_id, "failed", None).await?;
    RunEvent::emit(
        &kernel.pool,
        run_id,
        "error",
        None,
        None,
        None,
        Some(&error),
    )
    .await?;
    kernel
        .metrics
        .record_run_completed(started.elapsed().as_secs_f64(), "failed");
    error!(run_id = %run_id, message = %message, "run failed before execution");
    Ok(())
}
