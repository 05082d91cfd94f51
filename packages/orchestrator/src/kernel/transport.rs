//! HTTP transport to agents and MCP endpoints.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::traits::{AgentExecuteRequest, AgentExecuteResponse, AgentTransport};
use crate::error::{EngineError, EngineResult};

pub struct HttpAgentTransport {
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpAgentTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn execute(
        &self,
        base_url: &str,
        request: &AgentExecuteRequest,
    ) -> EngineResult<AgentExecuteResponse> {
        let url = format!("{}/execute", base_url.trim_end_matches('/'));
        debug!(url = %url, action = %request.action, "agent dispatch");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::Dispatch(format!("agent call to {url} failed: {e}")))?;
        let status = response.status();
        if status.as_u16() == 202 {
            return Ok(AgentExecuteResponse::accepted());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Dispatch(format!(
                "agent at {url} returned {status}: {body}"
            )));
        }
        let parsed: AgentExecuteResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Dispatch(format!("invalid agent response: {e}")))?;
        Ok(parsed)
    }

    async fn call_mcp_tool(
        &self,
        url: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> EngineResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": tool_name, "arguments": arguments},
        });
        debug!(url = %url, tool = %tool_name, "MCP tool call");
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::McpTool(format!("MCP call to {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::McpTool(format!(
                "MCP endpoint {url} returned {status}: {body}"
            )));
        }
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| EngineError::McpTool(format!("invalid MCP response: {e}")))?;
        if let Some(error) = envelope.get("error") {
            if !error.is_null() {
                return Err(EngineError::McpTool(format!("MCP tool error: {error}")));
            }
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}
