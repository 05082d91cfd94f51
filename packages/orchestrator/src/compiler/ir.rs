//! Typed intermediate representation of a CKP procedure.
//!
//! Node payloads are a sum type discriminated by the CKP `type` field.
//! Unknown JSON fields are ignored on parse; serialization mirrors the CKP
//! field names so a validated IR round-trips through its JSON form.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type JsonMap = Map<String, Value>;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_empty_value(v: &Value) -> bool {
    v.is_null() || v.as_object().map(|m| m.is_empty()).unwrap_or(false)
}

fn default_object() -> Value {
    Value::Object(Map::new())
}

// ── Executor binding ─────────────────────────────────────────────

/// How a step executes: in-process, against an agent's `/execute`, or as an
/// MCP tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    Internal,
    AgentHttp {
        #[serde(rename = "ref")]
        url: String,
    },
    McpTool {
        #[serde(rename = "ref")]
        url: String,
    },
}

// ── Retry configuration ──────────────────────────────────────────

/// Raw retry override block; any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl RetryOverride {
    pub fn is_empty(&self) -> bool {
        self.max_retries.is_none()
            && self.retry_delay_ms.is_none()
            && self.delay_ms.is_none()
            && self.backoff_multiplier.is_none()
    }

    pub fn delay(&self) -> Option<i64> {
        self.retry_delay_ms.or(self.delay_ms)
    }
}

/// Fully-resolved retry policy after merging step and global layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveRetry {
    pub max_retries: i64,
    pub retry_delay_ms: i64,
    pub backoff_multiplier: f64,
}

impl EffectiveRetry {
    /// Backoff before attempt `attempt` (0-based): `delay * multiplier^attempt`.
    pub fn backoff_ms(&self, attempt: i64) -> i64 {
        let factor = self.backoff_multiplier.powi(attempt.max(0) as i32);
        (self.retry_delay_ms as f64 * factor) as i64
    }
}

// ── Global config ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiting {
    #[serde(default)]
    pub max_concurrent: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mock_external_calls: bool,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub test_data_overrides: JsonMap,
    #[serde(default, skip_serializing_if = "is_false")]
    pub screenshot_on_fail: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiting: Option<RateLimiting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
}

impl GlobalConfig {
    /// Global retry policy: `retry_policy` block, then top-level shortcuts,
    /// then the hard-coded defaults.
    pub fn effective_retry(&self) -> EffectiveRetry {
        let policy = self.retry_policy.clone().unwrap_or_default();
        EffectiveRetry {
            max_retries: policy.max_retries.or(self.max_retries).unwrap_or(3),
            retry_delay_ms: policy.delay().or(self.retry_delay_ms).unwrap_or(1000),
            backoff_multiplier: policy
                .backoff_multiplier
                .or(self.backoff_multiplier)
                .unwrap_or(2.0),
        }
    }

    /// Step-level override wins per-field over the global policy.
    pub fn step_retry(&self, step_override: Option<&RetryOverride>) -> EffectiveRetry {
        let global = self.effective_retry();
        let Some(over) = step_override else {
            return global;
        };
        if over.is_empty() {
            return global;
        }
        EffectiveRetry {
            max_retries: over.max_retries.unwrap_or(global.max_retries),
            retry_delay_ms: over.delay().unwrap_or(global.retry_delay_ms),
            backoff_multiplier: over.backoff_multiplier.unwrap_or(global.backoff_multiplier),
        }
    }
}

// ── Node payloads ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub action: String,
    #[serde(default = "default_object", skip_serializing_if = "is_empty_value")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_after_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub retry_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryOverride>,
    /// Explicit executor binding from the CKP; the binder fills this in for
    /// built-in internal actions when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<Binding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub action: String,
    #[serde(default = "default_object", skip_serializing_if = "is_empty_value")]
    pub params: Value,
}

fn default_handler_action() -> String {
    "ignore".to_string()
}

fn default_handler_delay() -> i64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default = "default_handler_action")]
    pub action: String,
    #[serde(default)]
    pub max_retries: i64,
    #[serde(default = "default_handler_delay")]
    pub delay_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_node: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub notify_on_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_steps: Vec<RecoveryStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequencePayload {
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_handlers: Vec<ErrorHandler>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicRule {
    #[serde(alias = "condition")]
    pub condition_expr: String,
    #[serde(rename = "next_node")]
    pub next_node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicPayload {
    #[serde(default)]
    pub rules: Vec<LogicRule>,
    #[serde(
        default,
        rename = "default_next_node",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_next_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopPayload {
    /// Variable holding the collection to iterate.
    #[serde(alias = "iterator")]
    pub iterator_var: String,
    /// Variable the current item is exposed under.
    #[serde(alias = "item_variable")]
    pub iterator_variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_variable: Option<String>,
    #[serde(rename = "body_node")]
    pub body_node_id: String,
    #[serde(
        default,
        rename = "next_node",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub branch_id: String,
    #[serde(rename = "start_node")]
    pub start_node_id: String,
}

fn default_wait_strategy() -> String {
    "all".to_string()
}

fn default_branch_failure() -> String {
    "continue".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelPayload {
    #[serde(default)]
    pub branches: Vec<ParallelBranch>,
    #[serde(
        default,
        rename = "next_node",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_node_id: Option<String>,
    #[serde(default = "default_wait_strategy")]
    pub wait_strategy: String,
    #[serde(default = "default_branch_failure")]
    pub branch_failure: String,
}

fn default_prompt() -> String {
    "Approval required".to_string()
}

fn default_decision_type() -> String {
    "approve_reject".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanApprovalPayload {
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_decision_type")]
    pub decision_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_approve: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmActionPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub json_mode: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOverride>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub orchestration_mode: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    #[serde(
        default,
        rename = "next_node",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_node_id: Option<String>,
}

fn default_on_failure() -> String {
    "fail_parent".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubflowPayload {
    pub procedure_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub input_mapping: JsonMap,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub output_mapping: JsonMap,
    #[serde(default, skip_serializing_if = "is_false")]
    pub inherit_context: bool,
    #[serde(default = "default_on_failure")]
    pub on_failure: String,
    #[serde(
        default,
        rename = "next_node",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    #[serde(rename = "type")]
    pub op_type: String,
    pub source_variable: String,
    pub output_variable: String,
    #[serde(default)]
    pub expression: String,
    #[serde(default = "default_object", skip_serializing_if = "is_empty_value")]
    pub params: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformPayload {
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    #[serde(
        default,
        rename = "next_node",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_node_id: Option<String>,
}

fn default_on_fail() -> String {
    "fail_workflow".to_string()
}

fn default_check_message() -> String {
    "verification failed".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub condition: String,
    #[serde(default = "default_on_fail")]
    pub on_fail: String,
    #[serde(default = "default_check_message")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationPayload {
    #[serde(default)]
    pub checks: Vec<VerificationCheck>,
    #[serde(
        default,
        rename = "next_node",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOperation {
    pub action: String,
    #[serde(default = "default_object", skip_serializing_if = "is_empty_value")]
    pub params: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingPayload {
    #[serde(default)]
    pub operations: Vec<ProcessingOperation>,
    #[serde(
        default,
        rename = "next_node",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_node_id: Option<String>,
}

fn default_terminate_status() -> String {
    "success".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminatePayload {
    #[serde(default = "default_terminate_status")]
    pub status: String,
}

/// Tagged node payload, discriminated by the CKP `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Sequence(SequencePayload),
    Logic(LogicPayload),
    Loop(LoopPayload),
    Parallel(ParallelPayload),
    HumanApproval(HumanApprovalPayload),
    LlmAction(LlmActionPayload),
    Subflow(SubflowPayload),
    Transform(TransformPayload),
    Verification(VerificationPayload),
    Processing(ProcessingPayload),
    Terminate(TerminatePayload),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Sequence(_) => "sequence",
            NodeKind::Logic(_) => "logic",
            NodeKind::Loop(_) => "loop",
            NodeKind::Parallel(_) => "parallel",
            NodeKind::HumanApproval(_) => "human_approval",
            NodeKind::LlmAction(_) => "llm_action",
            NodeKind::Subflow(_) => "subflow",
            NodeKind::Transform(_) => "transform",
            NodeKind::Verification(_) => "verification",
            NodeKind::Processing(_) => "processing",
            NodeKind::Terminate(_) => "terminate",
        }
    }
}

// ── Node common fields ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_breach: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default, skip_serializing_if = "is_false")]
    pub track_duration: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub track_retries: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrNode {
    pub node_id: String,
    pub kind: NodeKind,
    pub next_node_id: Option<String>,
    /// Channel of the agent this node's external steps route to.
    pub agent: Option<String>,
    pub checkpoint: bool,
    pub sla: Option<SlaConfig>,
    pub telemetry: TelemetryConfig,
}

// ── Trigger ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_source: Option<String>,
    #[serde(default)]
    pub dedupe_window_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_runs: Option<i64>,
}

// ── Procedure ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureIr {
    pub procedure_id: String,
    pub version: String,
    pub start_node_id: String,
    pub nodes: HashMap<String, IrNode>,
    pub variables_schema: JsonMap,
    pub global_config: GlobalConfig,
    pub trigger: Option<TriggerConfig>,
    pub provenance: Option<Value>,
    pub retrieval_metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_retry_defaults() {
        let retry = GlobalConfig::default().effective_retry();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.retry_delay_ms, 1000);
        assert_eq!(retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn retry_policy_block_wins_over_shortcuts() {
        let config = GlobalConfig {
            retry_policy: Some(RetryOverride {
                max_retries: Some(5),
                delay_ms: Some(200),
                ..Default::default()
            }),
            max_retries: Some(1),
            retry_delay_ms: Some(10),
            ..Default::default()
        };
        let retry = config.effective_retry();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.retry_delay_ms, 200);
    }

    #[test]
    fn step_override_merges_per_field() {
        let config = GlobalConfig {
            max_retries: Some(4),
            retry_delay_ms: Some(100),
            ..Default::default()
        };
        let step = RetryOverride {
            max_retries: Some(1),
            ..Default::default()
        };
        let retry = config.step_retry(Some(&step));
        assert_eq!(retry.max_retries, 1);
        assert_eq!(retry.retry_delay_ms, 100);
        assert_eq!(retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let retry = EffectiveRetry {
            max_retries: 3,
            retry_delay_ms: 100,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.backoff_ms(0), 100);
        assert_eq!(retry.backoff_ms(1), 200);
        assert_eq!(retry.backoff_ms(2), 400);
    }

    #[test]
    fn node_kind_tag_round_trips() {
        let kind = NodeKind::Terminate(TerminatePayload {
            status: "failed".into(),
        });
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "terminate");
        let back: NodeKind = serde_json::from_value(value).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let err = serde_json::from_value::<NodeKind>(serde_json::json!({"type": "quantum"}));
        assert!(err.is_err());
    }
}
