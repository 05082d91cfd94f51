//! LLM action node: prompt rendering, retries, token/cost accounting,
//! outputs mapping, and orchestration-mode routing.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::compiler::ir::{IrNode, LlmActionPayload};
use crate::db::{Run, RunEvent};
use crate::error::EngineResult;
use crate::kernel::{LlmCallRequest, LlmCallResult};
use crate::runtime::state::RunState;
use crate::runtime::walker::GraphWalker;
use crate::template::render_str;

/// Cost per 1k tokens (USD), prompt/completion. Public pricing pages as of
/// 2026-02; `LLM_MODEL_COST_JSON` overrides merge on top.
const MODEL_COST_PER_1K: &[(&str, f64, f64)] = &[
    ("gpt-4", 0.03, 0.06),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-4o", 0.005, 0.015),
    ("gpt-3.5-turbo", 0.0005, 0.0015),
    ("claude-3-opus", 0.015, 0.075),
    ("claude-3-sonnet", 0.003, 0.015),
    ("claude-3-haiku", 0.00025, 0.00125),
    ("claude-3-5-sonnet", 0.003, 0.015),
];

/// Rates for a model name, falling back to the gpt-4 rates for unknown
/// models. Gateway-prefixed names (`org/model`) match on the last segment.
pub(crate) fn cost_rates(
    model: &str,
    overrides: &std::collections::HashMap<String, (f64, f64)>,
) -> (f64, f64) {
    let key = model
        .to_lowercase()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if let Some(rates) = overrides.get(&key) {
        return *rates;
    }
    MODEL_COST_PER_1K
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, prompt, completion)| (*prompt, *completion))
        .unwrap_or((0.03, 0.06))
}

pub(crate) fn estimate_cost_usd(
    model: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
    overrides: &std::collections::HashMap<String, (f64, f64)>,
) -> f64 {
    let (prompt_rate, completion_rate) = cost_rates(model, overrides);
    (prompt_tokens as f64 * prompt_rate + completion_tokens as f64 * completion_rate) / 1000.0
}

/// System-prompt directive injected in orchestration mode.
fn orchestration_directive(branches: &[String]) -> String {
    format!(
        "You are orchestrating a workflow. Respond with a JSON object containing a \
         \"_next_node\" key whose value is one of: {}. Include any other output keys \
         alongside it.",
        branches.join(", ")
    )
}

impl GraphWalker {
    pub(crate) async fn execute_llm_action(
        &self,
        node: &IrNode,
        payload: &LlmActionPayload,
        mut state: RunState,
    ) -> EngineResult<RunState> {
        let prompt = render_str(&payload.prompt, &state.vars);
        let mut system_prompt = payload
            .system_prompt
            .as_deref()
            .map(|s| render_str(s, &state.vars));
        let mut json_mode = payload.json_mode;
        if payload.orchestration_mode {
            json_mode = true;
            let directive = orchestration_directive(&payload.branches);
            system_prompt = Some(match system_prompt {
                Some(existing) => format!("{existing}\n\n{directive}"),
                None => directive,
            });
        }
        info!(
            node_id = %node.node_id,
            model = %payload.model,
            "LLM action: {}",
            prompt.chars().take(100).collect::<String>()
        );

        let retry = self.proc.global_config.step_retry(payload.retry.as_ref());

        let request = LlmCallRequest {
            model: payload.model.clone(),
            prompt,
            system_prompt,
            temperature: payload.temperature,
            max_tokens: payload.max_tokens,
            json_mode,
        };

        let mut attempt: i64 = 0;
        let llm_result: LlmCallResult = loop {
            if let Err(error) = self.kernel.llm_circuit.check("llm") {
                state.fail(
                    &node.node_id,
                    json!({"message": error.to_string(), "node_id": node.node_id}),
                );
                return Ok(state);
            }
            match self.kernel.llm.complete(&request).await {
                Ok(result) => {
                    self.kernel.llm_circuit.record_success("llm");
                    break result;
                }
                Err(error) => {
                    self.kernel.llm_circuit.record_failure("llm");
                    if attempt < retry.max_retries {
                        let delay = retry.backoff_ms(attempt);
                        warn!(
                            node_id = %node.node_id,
                            attempt = attempt + 1,
                            max_retries = retry.max_retries,
                            delay_ms = delay,
                            error = %error,
                            "LLM call failed; retrying"
                        );
                        self.kernel
                            .metrics
                            .record_retry_attempt(&node.node_id, &node.node_id);
                        tokio::time::sleep(Duration::from_millis(delay.max(0) as u64)).await;
                        attempt += 1;
                        continue;
                    }
                    state.fail(
                        &node.node_id,
                        json!({"message": error.to_string(), "node_id": node.node_id}),
                    );
                    return Ok(state);
                }
            }
        };

        // Token and cost accounting onto the run row
        if llm_result.prompt_tokens > 0 || llm_result.completion_tokens > 0 {
            let model_name = llm_result.model.as_deref().unwrap_or(&payload.model);
            let cost = estimate_cost_usd(
                model_name,
                llm_result.prompt_tokens,
                llm_result.completion_tokens,
                &self.kernel.settings.llm_model_cost_overrides,
            );
            if let Err(e) = Run::add_token_usage(
                &self.kernel.pool,
                &state.run_id,
                llm_result.prompt_tokens,
                llm_result.completion_tokens,
                cost,
            )
            .await
            {
                warn!(error = %e, "failed to persist LLM token usage");
            }
            RunEvent::emit(
                &self.kernel.pool,
                &state.run_id,
                "llm_usage",
                Some(&node.node_id),
                None,
                None,
                Some(&json!({
                    "model": model_name,
                    "prompt_tokens": llm_result.prompt_tokens,
                    "completion_tokens": llm_result.completion_tokens,
                    "total_tokens": if llm_result.total_tokens > 0 {
                        llm_result.total_tokens
                    } else {
                        llm_result.prompt_tokens + llm_result.completion_tokens
                    },
                })),
            )
            .await?;
        }

        // Outputs mapping
        let text = llm_result.text;
        for (key, mapping) in &payload.outputs {
            match mapping.as_str() {
                "text" | "raw" | "content" => {
                    state.vars.insert(key.clone(), Value::String(text.clone()));
                }
                mapping if mapping.starts_with("json:") => {
                    let field = &mapping["json:".len()..];
                    let extracted = serde_json::from_str::<Value>(&text)
                        .ok()
                        .and_then(|parsed| parsed.get(field).cloned());
                    state.vars.insert(
                        key.clone(),
                        extracted.unwrap_or_else(|| Value::String(text.clone())),
                    );
                }
                _ => {
                    state.vars.insert(key.clone(), Value::String(text.clone()));
                }
            }
        }
        if payload.outputs.is_empty() {
            state
                .vars
                .insert("llm_output".to_string(), Value::String(text.clone()));
        }

        // Orchestration mode: the model selects the next node
        if payload.orchestration_mode {
            let chosen = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|parsed| {
                    parsed
                        .get("_next_node")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                })
                .filter(|candidate| payload.branches.contains(candidate));
            let next = chosen.or_else(|| payload.branches.first().cloned());
            state.next_node_id = next;
            state.current_node_id = node.node_id.clone();
            return Ok(state);
        }

        state.next_node_id = payload.next_node_id.clone();
        state.current_node_id = node.node_id.clone();
        Ok(state)
    }
}
