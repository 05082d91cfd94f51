//! MCP tool dispatch with a per-endpoint circuit breaker.

use std::time::Duration;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::kernel::OrchestratorKernel;

pub async fn dispatch_to_mcp(
    kernel: &OrchestratorKernel,
    url: &str,
    tool_name: &str,
    arguments: &Value,
    timeout_ms: Option<i64>,
) -> EngineResult<Value> {
    kernel.mcp_circuit.check(url)?;

    let call = kernel.transport.call_mcp_tool(url, tool_name, arguments);
    let result = match timeout_ms {
        Some(ms) if ms > 0 => {
            match tokio::time::timeout(Duration::from_millis(ms as u64), call).await {
                Ok(result) => result,
                Err(_) => {
                    kernel.mcp_circuit.record_failure(url);
                    return Err(EngineError::Timeout { timeout_ms: ms });
                }
            }
        }
        _ => call.await,
    };

    match result {
        Ok(value) => {
            kernel.mcp_circuit.record_success(url);
            Ok(value)
        }
        Err(e) => {
            kernel.mcp_circuit.record_failure(url);
            Err(e)
        }
    }
}
