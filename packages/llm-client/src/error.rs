//! Error types for the LLM client.

use thiserror::Error;

/// Errors returned by [`LlmClient`](crate::LlmClient).
#[derive(Debug, Error)]
pub enum LlmError {
    /// Missing or invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure (connect, TLS, timeout).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx response from the completions endpoint.
    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// Response body did not match the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;
