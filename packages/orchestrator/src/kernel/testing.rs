//! In-memory implementations of the kernel traits for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::traits::{
    AgentExecuteRequest, AgentExecuteResponse, AgentTransport, LlmBackend, LlmCallRequest,
    LlmCallResult,
};
use crate::error::{EngineError, EngineResult};

/// Scripted LLM backend: pops queued results, then repeats the default.
pub struct MockLlm {
    responses: Mutex<VecDeque<LlmCallResult>>,
    default_text: String,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn new(default_text: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_text: default_text.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_response(&self, result: LlmCallResult) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn push_text(&self, text: impl Into<String>, prompt_tokens: i64, completion_tokens: i64) {
        self.push_response(LlmCallResult {
            text: text.into(),
            model: Some("mock-model".to_string()),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        });
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for MockLlm {
    async fn complete(&self, _request: &LlmCallRequest) -> EngineResult<LlmCallResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(queued.unwrap_or_else(|| LlmCallResult {
            text: self.default_text.clone(),
            model: Some("mock-model".to_string()),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }))
    }
}

/// One scripted transport outcome.
pub enum ScriptedOutcome {
    Success(Value),
    Accepted,
    Error(String),
    /// Sleep this long before answering (for timeout tests).
    Hang(std::time::Duration),
}

/// Scripted agent/MCP transport. Outcomes queue FIFO; when the queue is
/// empty every call succeeds with a stub result.
#[derive(Default)]
pub struct MockAgentTransport {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    requests: Mutex<Vec<AgentExecuteRequest>>,
    mcp_calls: AtomicUsize,
}

impl MockAgentTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    /// Queue `n` failures followed by nothing (so the next call succeeds).
    pub fn fail_times(&self, n: usize) {
        for _ in 0..n {
            self.push(ScriptedOutcome::Error("connection refused".to_string()));
        }
    }

    pub fn dispatch_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn recorded_requests(&self) -> Vec<AgentExecuteRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn mcp_call_count(&self) -> usize {
        self.mcp_calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Option<ScriptedOutcome> {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

#[async_trait]
impl AgentTransport for MockAgentTransport {
    async fn execute(
        &self,
        _base_url: &str,
        request: &AgentExecuteRequest,
    ) -> EngineResult<AgentExecuteResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        match self.next_outcome() {
            Some(ScriptedOutcome::Success(result)) => Ok(AgentExecuteResponse::success(result)),
            Some(ScriptedOutcome::Accepted) => Ok(AgentExecuteResponse::accepted()),
            Some(ScriptedOutcome::Error(message)) => Err(EngineError::Dispatch(message)),
            Some(ScriptedOutcome::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(AgentExecuteResponse::success(json!({"late": true})))
            }
            None => Ok(AgentExecuteResponse::success(json!({
                "ok": true,
                "action": request.action,
            }))),
        }
    }

    async fn call_mcp_tool(
        &self,
        _url: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> EngineResult<Value> {
        self.mcp_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_outcome() {
            Some(ScriptedOutcome::Success(result)) => Ok(result),
            Some(ScriptedOutcome::Error(message)) => Err(EngineError::McpTool(message)),
            Some(ScriptedOutcome::Accepted) => Ok(Value::Null),
            Some(ScriptedOutcome::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(json!({"late": true}))
            }
            None => Ok(json!({"tool": tool_name, "arguments": arguments})),
        }
    }
}
