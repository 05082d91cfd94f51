//! Engine error taxonomy.
//!
//! Step-level error handlers match on `kind_name()`, so each variant carries
//! a stable name. Retry policies treat everything except cancellation and
//! callback suspension as retryable; the queue layer decides terminal
//! failure from attempt counts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// CKP rejected before execution.
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    /// Bad JSON or unknown node types.
    #[error("compile error: {0}")]
    Compile(String),

    /// Agent HTTP failure or unresolvable executor.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Step or node deadline exceeded.
    #[error("step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: i64 },

    /// Resource lease unavailable.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// Cancellation probe fired.
    #[error("run cancelled: {0}")]
    Cancelled(String),

    /// Child run failed.
    #[error("subflow failed: {0}")]
    Subflow(String),

    /// LLM endpoint failure.
    #[error("LLM call failed: {0}")]
    LlmCall(String),

    /// MCP tool failure.
    #[error("MCP tool failed: {0}")]
    McpTool(String),

    /// Call attempted against an open circuit.
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    /// Agent accepted the call (202); the run suspends until the callback
    /// posts the result and requeues it.
    #[error("callback pending for step {step_id} of node {node_id}")]
    CallbackPending { node_id: String, step_id: String },

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Stable name used by CKP `error_handlers[*].error_type` matching.
    pub fn kind_name(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::Compile(_) => "CompileError",
            EngineError::Dispatch(_) => "DispatchError",
            EngineError::Timeout { .. } => "TimeoutError",
            EngineError::ResourceBusy(_) => "ResourceBusyError",
            EngineError::Cancelled(_) => "RunCancelledError",
            EngineError::Subflow(_) => "SubflowError",
            EngineError::LlmCall(_) => "LLMCallError",
            EngineError::McpTool(_) => "MCPToolError",
            EngineError::CircuitOpen(_) => "CircuitOpenError",
            EngineError::CallbackPending { .. } => "CallbackPending",
            EngineError::Db(_) => "DatabaseError",
            EngineError::Other(_) => "Error",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled(_))
    }

    /// Errors that must not pass through step retry or error handlers.
    pub fn bypasses_handlers(&self) -> bool {
        matches!(
            self,
            EngineError::Cancelled(_) | EngineError::CallbackPending { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Compile(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
