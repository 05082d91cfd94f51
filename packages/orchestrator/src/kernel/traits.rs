//! Infrastructure traits for external dependencies.
//!
//! The kernel holds these as trait objects so tests swap in in-memory
//! implementations without network access.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;

// ── LLM ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LlmCallRequest {
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub json_mode: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LlmCallResult {
    pub text: String,
    pub model: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Chat-completion backend behind the llm_action node.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, request: &LlmCallRequest) -> EngineResult<LlmCallResult>;
}

// ── Agent / MCP transport ────────────────────────────────────────

/// Body POSTed to `{base_url}/execute`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentExecuteRequest {
    pub action: String,
    pub params: Value,
    pub run_id: String,
    pub node_id: String,
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Agent `/execute` response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentExecuteResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentExecuteResponse {
    pub fn success(result: Value) -> Self {
        Self {
            status: "success".to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn accepted() -> Self {
        Self {
            status: "accepted".to_string(),
            result: None,
            error: None,
        }
    }
}

/// HTTP transport to agents and MCP endpoints. Timeouts are enforced by the
/// dispatch layer so it can account failures against circuit state.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// POST to `{base_url}/execute`.
    async fn execute(
        &self,
        base_url: &str,
        request: &AgentExecuteRequest,
    ) -> EngineResult<AgentExecuteResponse>;

    /// JSON-RPC `tools/call` against an MCP endpoint; returns the tool result.
    async fn call_mcp_tool(
        &self,
        url: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> EngineResult<Value>;
}
