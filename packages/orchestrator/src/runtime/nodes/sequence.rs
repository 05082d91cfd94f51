//! Sequence node executor: the step state machine.
//!
//! Per step: cancellation probe, template render, idempotency cache, retry
//! loop around dispatch (with dry-run / test-override / mock short-circuits
//! and the step timeout deadline), error-handler recovery, artifact
//! extraction, idempotency completion, and telemetry-aware events.

use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::common::redact::redact_sensitive;
use crate::compiler::ir::{IrNode, SequencePayload, Step};
use crate::db::{Artifact, RunEvent, StepIdempotency};
use crate::dispatch::{dispatch_to_agent, dispatch_to_mcp, resolve_executor, ResolvedExecutor, StepContext};
use crate::error::{EngineError, EngineResult};
use crate::runtime::actions::execute_internal_action;
use crate::runtime::state::RunState;
use crate::runtime::walker::GraphWalker;
use crate::template::{render_str, render_value};

enum HandlerOutcome {
    RetryStep { delay_ms: i64 },
    Suppress,
    Fallback(String),
    Raise,
}

impl GraphWalker {
    pub(crate) async fn execute_sequence(
        &self,
        node: &IrNode,
        seq: &SequencePayload,
        mut state: RunState,
    ) -> EngineResult<RunState> {
        let run_id = state.run_id.clone();
        let node_start = Instant::now();

        for step in &seq.steps {
            self.kernel
                .cancellations
                .check_and_signal(&self.kernel.pool, &run_id)
                .await?;
            self.kernel.cancellations.check(&run_id).await?;

            let rendered_params = render_value(&step.params, &state.vars);
            info!(
                step_id = %step.step_id,
                action = %step.action,
                params = %redact_sensitive(&rendered_params),
                "executing step"
            );

            if let Some(wait_ms) = step.wait_ms.filter(|w| *w > 0) {
                tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
            }

            // Idempotency coordinate. Inside a loop body the same step runs
            // once per iteration, so the cursor scopes the key; otherwise a
            // second pass would replay iteration zero forever. A subflow
            // walk additionally prefixes its durability scope so distinct
            // invocations of the same child procedure keep distinct rows.
            let mut step_key = match state.vars.get("loop_index").and_then(|v| v.as_i64()) {
                Some(index) => format!("{}@{index}", step.step_id),
                None => step.step_id.clone(),
            };
            if let Some(scope) = &state.durability_scope {
                step_key = format!("{scope}:{step_key}");
            }

            let retry = self
                .proc
                .global_config
                .step_retry(step.retry_config.as_ref());
            let mut attempt: i64 = 0;
            let step_start = Instant::now();
            let mut result: Option<Value> = None;
            let mut used_cached = false;
            let mut fallback_to: Option<String> = None;

            'retry: loop {
                // Idempotency: a completed row replays its result with no
                // dispatch and no step_started event.
                if let Some(cached) = StepIdempotency::completed_result(
                    &self.kernel.pool,
                    &run_id,
                    &node.node_id,
                    &step_key,
                )
                .await?
                {
                    info!(
                        node_id = %node.node_id,
                        step_id = %step.step_id,
                        "reusing cached idempotent result"
                    );
                    result = Some(cached);
                    used_cached = true;
                    self.kernel
                        .metrics
                        .record_step_execution(&node.node_id, "cached");
                    break 'retry;
                }

                RunEvent::emit(
                    &self.kernel.pool,
                    &run_id,
                    "step_started",
                    Some(&node.node_id),
                    Some(&step.step_id),
                    Some(attempt),
                    Some(&json!({"action": step.action})),
                )
                .await?;
                let rendered_idem_key = step
                    .idempotency_key
                    .as_deref()
                    .map(|key| render_str(key, &state.vars));
                StepIdempotency::mark_started(
                    &self.kernel.pool,
                    &run_id,
                    &node.node_id,
                    &step_key,
                    rendered_idem_key.as_deref(),
                )
                .await?;

                match self
                    .execute_step_once(node, step, &rendered_params, &mut state)
                    .await
                {
                    Ok(value) => {
                        result = Some(value);
                        self.kernel
                            .metrics
                            .record_step_execution(&node.node_id, "completed");
                        break 'retry;
                    }
                    Err(EngineError::CallbackPending { node_id, step_id }) => {
                        // The idempotency row stays `started`; the callback
                        // endpoint completes it and requeues the run.
                        state.callback_pending = Some((node_id, step_id));
                        state.terminal_status =
                            Some(crate::runtime::state::TERMINAL_AWAITING_CALLBACK.to_string());
                        state.current_node_id = node.node_id.clone();
                        state.next_node_id = None;
                        return Ok(state);
                    }
                    Err(error) if error.bypasses_handlers() => return Err(error),
                    Err(error) => {
                        if let EngineError::Timeout { timeout_ms } = &error {
                            self.kernel.metrics.record_step_timeout(
                                &node.node_id,
                                &step.step_id,
                                *timeout_ms,
                            );
                            RunEvent::emit(
                                &self.kernel.pool,
                                &run_id,
                                "step_timeout",
                                Some(&node.node_id),
                                Some(&step.step_id),
                                Some(attempt),
                                Some(&json!({
                                    "timeout_ms": timeout_ms,
                                    "action": step.action,
                                })),
                            )
                            .await?;
                        }

                        if step.retry_on_failure && attempt < retry.max_retries {
                            self.kernel
                                .metrics
                                .record_retry_attempt(&node.node_id, &step.step_id);
                            let delay = retry.backoff_ms(attempt);
                            warn!(
                                node_id = %node.node_id,
                                step_id = %step.step_id,
                                attempt = attempt + 1,
                                max_retries = retry.max_retries,
                                delay_ms = delay,
                                error = %error,
                                "step failed; retrying"
                            );
                            tokio::time::sleep(Duration::from_millis(delay.max(0) as u64)).await;
                            attempt += 1;
                            continue 'retry;
                        }

                        // Retries exhausted (or retry not enabled)
                        self.kernel
                            .metrics
                            .record_step_execution(&node.node_id, "failed");
                        StepIdempotency::mark_failed(
                            &self.kernel.pool,
                            &run_id,
                            &node.node_id,
                            &step_key,
                        )
                        .await?;
                        if self.proc.global_config.screenshot_on_fail {
                            let emitted = RunEvent::emit(
                                &self.kernel.pool,
                                &run_id,
                                "screenshot_requested",
                                Some(&node.node_id),
                                Some(&step.step_id),
                                None,
                                Some(&json!({
                                    "reason": "screenshot_on_fail",
                                    "error": error.to_string(),
                                })),
                            )
                            .await;
                            if let Err(e) = emitted {
                                warn!(error = %e, "failed to emit screenshot_requested event");
                            }
                        }

                        match self
                            .apply_error_handlers(node, seq, step, &error, &mut state, attempt)
                            .await?
                        {
                            HandlerOutcome::RetryStep { delay_ms } => {
                                self.kernel
                                    .metrics
                                    .record_retry_attempt(&node.node_id, &step.step_id);
                                tokio::time::sleep(Duration::from_millis(delay_ms.max(0) as u64))
                                    .await;
                                attempt += 1;
                                continue 'retry;
                            }
                            HandlerOutcome::Suppress => {
                                if let Some(output_variable) = &step.output_variable {
                                    state.vars.insert(output_variable.clone(), Value::Null);
                                }
                                result = None;
                                break 'retry;
                            }
                            HandlerOutcome::Fallback(fallback_node) => {
                                fallback_to = Some(fallback_node);
                                break 'retry;
                            }
                            HandlerOutcome::Raise => {
                                state.fail(
                                    &node.node_id,
                                    json!({
                                        "message": error.to_string(),
                                        "error_type": error.kind_name(),
                                        "node_id": node.node_id,
                                        "step_id": step.step_id,
                                    }),
                                );
                                return Ok(state);
                            }
                        }
                    }
                }
            }

            if let Some(fallback_node) = fallback_to {
                state.next_node_id = Some(fallback_node);
                state.current_node_id = node.node_id.clone();
                return Ok(state);
            }

            if let Some(value) = &result {
                if let Some(output_variable) = &step.output_variable {
                    if !value.is_null() {
                        state.vars.insert(output_variable.clone(), value.clone());
                    }
                }
            }

            if used_cached {
                RunEvent::emit(
                    &self.kernel.pool,
                    &run_id,
                    "step_completed",
                    Some(&node.node_id),
                    Some(&step.step_id),
                    None,
                    Some(&json!({
                        "action": step.action,
                        "output_variable": step.output_variable,
                        "cached": true,
                    })),
                )
                .await?;
            } else {
                if let Some(value) = &result {
                    self.record_artifacts(&run_id, node, step, value).await?;
                }
                StepIdempotency::mark_completed(
                    &self.kernel.pool,
                    &run_id,
                    &node.node_id,
                    &step_key,
                    result.as_ref(),
                )
                .await?;

                let mut payload = Map::new();
                payload.insert("action".to_string(), json!(step.action));
                payload.insert("output_variable".to_string(), json!(step.output_variable));
                payload.insert("cached".to_string(), json!(false));
                if node.telemetry.track_duration {
                    payload.insert(
                        "duration_ms".to_string(),
                        json!(step_start.elapsed().as_millis() as i64),
                    );
                }
                if node.telemetry.track_retries && attempt > 0 {
                    payload.insert("retry_count".to_string(), json!(attempt));
                }
                RunEvent::emit(
                    &self.kernel.pool,
                    &run_id,
                    "step_completed",
                    Some(&node.node_id),
                    Some(&step.step_id),
                    None,
                    Some(&Value::Object(payload)),
                )
                .await?;
            }

            if let Some(wait_after_ms) = step.wait_after_ms.filter(|w| *w > 0) {
                tokio::time::sleep(Duration::from_millis(wait_after_ms as u64)).await;
            }
        }

        // SLA breach check over the whole node
        if let Some(sla) = &node.sla {
            if let Some(max_duration_ms) = sla.max_duration_ms.filter(|m| *m > 0) {
                let actual_ms = node_start.elapsed().as_millis() as i64;
                if actual_ms > max_duration_ms {
                    warn!(
                        node_id = %node.node_id,
                        actual_ms,
                        max_duration_ms,
                        "SLA breached"
                    );
                    RunEvent::emit(
                        &self.kernel.pool,
                        &run_id,
                        "sla_breached",
                        Some(&node.node_id),
                        None,
                        None,
                        Some(&json!({
                            "max_duration_ms": max_duration_ms,
                            "actual_duration_ms": actual_ms,
                            "on_breach": sla.on_breach.as_deref().unwrap_or("log"),
                        })),
                    )
                    .await?;
                }
            }
        }

        state.next_node_id = node.next_node_id.clone();
        state.current_node_id = node.node_id.clone();
        Ok(state)
    }

    /// One execution attempt: resolve the executor, apply mode
    /// short-circuits, dispatch with the step deadline.
    async fn execute_step_once(
        &self,
        node: &IrNode,
        step: &Step,
        rendered_params: &Value,
        state: &mut RunState,
    ) -> EngineResult<Value> {
        let resolved = resolve_executor(&self.kernel, node, step, &state.run_id).await?;
        let (binding_kind, binding_ref) = match &resolved {
            ResolvedExecutor::Internal => ("internal", String::new()),
            ResolvedExecutor::Agent(target) => ("agent_http", target.url.clone()),
            ResolvedExecutor::Mcp { url } => ("mcp_tool", url.clone()),
        };
        let external = !matches!(resolved, ResolvedExecutor::Internal);
        let global_config = &self.proc.global_config;

        if state.execution_mode == "dry_run" && external {
            info!(
                node_id = %node.node_id,
                step_id = %step.step_id,
                binding = binding_kind,
                "dry_run: skipping external dispatch"
            );
            RunEvent::emit(
                &self.kernel.pool,
                &state.run_id,
                "dry_run_step_skipped",
                Some(&node.node_id),
                Some(&step.step_id),
                None,
                Some(&json!({
                    "action": step.action,
                    "binding": binding_kind,
                    "ref": binding_ref,
                })),
            )
            .await?;
            return Ok(json!({
                "dry_run": true,
                "skipped_action": step.action,
                "binding": binding_kind,
            }));
        }

        if let Some(override_value) = global_config.test_data_overrides.get(&step.step_id) {
            info!(
                node_id = %node.node_id,
                step_id = %step.step_id,
                "returning configured test data override"
            );
            RunEvent::emit(
                &self.kernel.pool,
                &state.run_id,
                "step_test_override_applied",
                Some(&node.node_id),
                Some(&step.step_id),
                None,
                Some(&json!({"step_id": step.step_id, "override": override_value})),
            )
            .await?;
            return Ok(override_value.clone());
        }

        if global_config.mock_external_calls && external {
            info!(
                node_id = %node.node_id,
                step_id = %step.step_id,
                binding = binding_kind,
                "mock_external_calls: returning stub result"
            );
            RunEvent::emit(
                &self.kernel.pool,
                &state.run_id,
                "step_mock_applied",
                Some(&node.node_id),
                Some(&step.step_id),
                None,
                Some(&json!({
                    "action": step.action,
                    "binding": binding_kind,
                    "ref": binding_ref,
                })),
            )
            .await?;
            return Ok(json!({
                "mocked": true,
                "action": step.action,
                "binding": binding_kind,
            }));
        }

        match resolved {
            ResolvedExecutor::Internal => {
                let call = execute_internal_action(&step.action, rendered_params, &mut state.vars);
                match step.timeout_ms.filter(|t| *t > 0) {
                    Some(timeout_ms) => {
                        match tokio::time::timeout(
                            Duration::from_millis(timeout_ms as u64),
                            call,
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(EngineError::Timeout { timeout_ms }),
                        }
                    }
                    None => call.await,
                }
            }
            ResolvedExecutor::Agent(target) => {
                let _permit = match &self.rate_limiter {
                    Some(semaphore) => Some(semaphore.clone().acquire_owned().await.map_err(
                        |_| EngineError::Other("rate limiter closed".into()),
                    )?),
                    None => None,
                };
                let ctx = StepContext {
                    run_id: &state.run_id,
                    node_id: &node.node_id,
                    step_id: &step.step_id,
                    channel: node.agent.as_deref(),
                };
                dispatch_to_agent(
                    &self.kernel,
                    &target,
                    &ctx,
                    &step.action,
                    rendered_params.clone(),
                    step.timeout_ms,
                )
                .await
            }
            ResolvedExecutor::Mcp { url } => {
                let _permit = match &self.rate_limiter {
                    Some(semaphore) => Some(semaphore.clone().acquire_owned().await.map_err(
                        |_| EngineError::Other("rate limiter closed".into()),
                    )?),
                    None => None,
                };
                dispatch_to_mcp(
                    &self.kernel,
                    &url,
                    &step.action,
                    rendered_params,
                    step.timeout_ms,
                )
                .await
            }
        }
    }

    /// Walk the node's error handlers; first match by error kind (or any
    /// when unset) wins. Recovery steps run before the handler action.
    async fn apply_error_handlers(
        &self,
        node: &IrNode,
        seq: &SequencePayload,
        step: &Step,
        error: &EngineError,
        state: &mut RunState,
        attempt: i64,
    ) -> EngineResult<HandlerOutcome> {
        for handler in &seq.error_handlers {
            if let Some(wanted) = &handler.error_type {
                if wanted != error.kind_name() {
                    continue;
                }
            }

            for recovery in &handler.recovery_steps {
                let rendered = render_value(&recovery.params, &state.vars);
                execute_internal_action(&recovery.action, &rendered, &mut state.vars).await?;
            }

            if handler.notify_on_error {
                let emitted = RunEvent::emit(
                    &self.kernel.pool,
                    &state.run_id,
                    "step_error_notification",
                    Some(&node.node_id),
                    Some(&step.step_id),
                    None,
                    Some(&json!({
                        "error_type": handler.error_type,
                        "error": error.to_string(),
                        "handler_action": handler.action,
                    })),
                )
                .await;
                if let Err(e) = emitted {
                    warn!(error = %e, "notify_on_error: failed to emit event");
                }
                self.fire_alert_webhook(&state.run_id, error);
            }

            match handler.action.as_str() {
                "retry" => {
                    if attempt < handler.max_retries {
                        return Ok(HandlerOutcome::RetryStep {
                            delay_ms: handler.delay_ms,
                        });
                    }
                    return Ok(HandlerOutcome::Raise);
                }
                "screenshot_and_fail" => {
                    warn!(
                        node_id = %node.node_id,
                        step_id = %step.step_id,
                        "screenshot_and_fail: failing step"
                    );
                    return Ok(HandlerOutcome::Raise);
                }
                "fail" => return Ok(HandlerOutcome::Raise),
                // escalate routes to the fallback node; ignore suppresses
                _ => {
                    if let Some(fallback_node) = &handler.fallback_node {
                        return Ok(HandlerOutcome::Fallback(fallback_node.clone()));
                    }
                    return Ok(HandlerOutcome::Suppress);
                }
            }
        }
        Ok(HandlerOutcome::Raise)
    }

    /// Fire-and-forget POST to the configured alert webhook.
    fn fire_alert_webhook(&self, run_id: &str, error: &EngineError) {
        let Some(url) = self.kernel.settings.alert_webhook_url.clone() else {
            return;
        };
        let client = self.kernel.http.clone();
        let body = json!({
            "run_id": run_id,
            "error": error.to_string(),
            "error_type": error.kind_name(),
        });
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&body).send().await {
                warn!(error = %e, "alert webhook delivery failed");
            }
        });
    }

    async fn record_artifacts(
        &self,
        run_id: &str,
        node: &IrNode,
        step: &Step,
        result: &Value,
    ) -> EngineResult<()> {
        for (kind, uri) in extract_artifacts(result) {
            let artifact = Artifact::create(
                &self.kernel.pool,
                run_id,
                Some(&node.node_id),
                Some(&step.step_id),
                &kind,
                &uri,
            )
            .await?;
            RunEvent::emit(
                &self.kernel.pool,
                run_id,
                "artifact_created",
                Some(&node.node_id),
                Some(&step.step_id),
                None,
                Some(&json!({
                    "artifact_id": artifact.artifact_id,
                    "kind": artifact.kind,
                    "uri": artifact.uri,
                })),
            )
            .await?;
        }
        Ok(())
    }
}

/// Pull artifact references out of a step result.
pub(crate) fn extract_artifacts(result: &Value) -> Vec<(String, String)> {
    let mut artifacts: Vec<(String, String)> = Vec::new();
    let Some(map) = result.as_object() else {
        return artifacts;
    };

    if let Some(screenshot) = map.get("screenshot").and_then(|v| v.as_str()) {
        if !screenshot.is_empty() {
            let uri = if screenshot.contains("://") {
                screenshot.to_string()
            } else {
                format!("memory://{screenshot}")
            };
            artifacts.push(("screenshot".to_string(), uri));
        }
    }

    let mut push_object = |obj: &Map<String, Value>| {
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or("artifact")
            .to_string();
        if let Some(uri) = obj.get("uri").and_then(|v| v.as_str()) {
            if !uri.is_empty() {
                artifacts.push((kind, uri.to_string()));
            }
        }
    };
    if let Some(single) = map.get("artifact").and_then(|v| v.as_object()) {
        push_object(single);
    }
    if let Some(many) = map.get("artifacts").and_then(|v| v.as_array()) {
        for item in many {
            if let Some(obj) = item.as_object() {
                push_object(obj);
            }
        }
    }

    if let Some(uri) = map
        .get("artifact_uri")
        .or_else(|| map.get("uri"))
        .and_then(|v| v.as_str())
    {
        if !uri.is_empty() {
            let kind = map
                .get("artifact_kind")
                .and_then(|v| v.as_str())
                .unwrap_or("artifact")
                .to_string();
            artifacts.push((kind, uri.to_string()));
        }
    }

    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screenshot_gets_memory_scheme() {
        let found = extract_artifacts(&json!({"screenshot": "shot-1.png"}));
        assert_eq!(
            found,
            vec![("screenshot".to_string(), "memory://shot-1.png".to_string())]
        );
    }

    #[test]
    fn screenshot_with_scheme_is_kept() {
        let found = extract_artifacts(&json!({"screenshot": "s3://bucket/shot.png"}));
        assert_eq!(found[0].1, "s3://bucket/shot.png");
    }

    #[test]
    fn artifact_objects_and_lists_are_collected() {
        let found = extract_artifacts(&json!({
            "artifact": {"kind": "report", "uri": "file:///r.pdf"},
            "artifacts": [
                {"kind": "log", "uri": "file:///a.log"},
                {"uri": "file:///b.bin"}
            ]
        }));
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], ("report".to_string(), "file:///r.pdf".to_string()));
        assert_eq!(found[2].0, "artifact");
    }

    #[test]
    fn bare_uri_uses_artifact_kind_field() {
        let found =
            extract_artifacts(&json!({"uri": "file:///x", "artifact_kind": "screenshot"}));
        assert_eq!(found, vec![("screenshot".to_string(), "file:///x".to_string())]);
    }

    #[test]
    fn non_object_results_have_no_artifacts() {
        assert!(extract_artifacts(&json!("plain text")).is_empty());
        assert!(extract_artifacts(&json!({"data": 1})).is_empty());
    }
}
