//! Pure OpenAI-compatible REST client.
//!
//! A clean, minimal client for any `chat/completions`-shaped endpoint with no
//! domain-specific logic. Gateways (LiteLLM, vLLM, Azure, proxies) are
//! supported through a configurable base URL and extra headers; individual
//! calls may override the base URL, API key, and headers.
//!
//! # Example
//!
//! ```rust,ignore
//! use llm_client::{ChatRequest, LlmClient, Message};
//!
//! let client = LlmClient::from_env()?;
//!
//! let response = client.chat_completion(ChatRequest {
//!     model: "gpt-4o".into(),
//!     messages: vec![Message::user("Hello!")],
//!     ..Default::default()
//! }, None).await?;
//!
//! println!("{}", response.text());
//! ```

pub mod error;
pub mod types;

pub use error::{LlmError, Result};
pub use types::*;

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Per-call overrides merged on top of the client configuration.
#[derive(Debug, Clone, Default)]
pub struct CallOverrides {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub extra_headers: HashMap<String, String>,
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    http_client: Client,
    api_key: String,
    base_url: String,
    gateway_headers: HashMap<String, String>,
}

impl LlmClient {
    /// Create a new client with the given API key and the default base URL.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            gateway_headers: HashMap::new(),
        }
    }

    /// Create from `LLM_API_KEY` (falling back to `OPENAI_API_KEY`), with
    /// `LLM_BASE_URL` honored when set.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| LlmError::Config("LLM_API_KEY not set".into()))?;
        let mut client = Self::new(api_key);
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            if !url.is_empty() {
                client.base_url = url;
            }
        }
        Ok(client)
    }

    /// Set a custom base URL (gateway, Azure, proxy).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Headers sent with every request (e.g. gateway routing headers).
    pub fn with_gateway_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.gateway_headers = headers;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute a chat completion, applying per-call overrides when given.
    pub async fn chat_completion(
        &self,
        request: ChatRequest,
        overrides: Option<&CallOverrides>,
    ) -> Result<ChatResponse> {
        let base_url = overrides
            .and_then(|o| o.base_url.as_deref())
            .unwrap_or(&self.base_url)
            .trim_end_matches('/');
        let api_key = overrides
            .and_then(|o| o.api_key.as_deref())
            .unwrap_or(&self.api_key);
        let url = format!("{base_url}/chat/completions");

        debug!(model = %request.model, url = %url, "chat completion request");

        let mut builder = self
            .http_client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request);
        for (name, value) in &self.gateway_headers {
            builder = builder.header(name, value);
        }
        if let Some(o) = overrides {
            for (name, value) in &o.extra_headers {
                builder = builder.header(name, value);
            }
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parsed)
    }
}
