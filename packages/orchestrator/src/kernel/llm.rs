//! LLM backend over the OpenAI-compatible gateway client.

use async_trait::async_trait;
use llm_client::{ChatRequest, LlmClient, Message, ResponseFormat};

use super::traits::{LlmBackend, LlmCallRequest, LlmCallResult};
use crate::error::{EngineError, EngineResult};

pub struct GatewayLlm {
    client: LlmClient,
}

impl GatewayLlm {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LlmBackend for GatewayLlm {
    async fn complete(&self, request: &LlmCallRequest) -> EngineResult<LlmCallResult> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(request.prompt.clone()));

        let chat_request = ChatRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens.map(|t| t.max(0) as u32),
            response_format: request.json_mode.then(ResponseFormat::json_object),
        };

        let response = self
            .client
            .chat_completion(chat_request, None)
            .await
            .map_err(|e| EngineError::LlmCall(e.to_string()))?;

        let usage = response.usage.clone().unwrap_or_default();
        Ok(LlmCallResult {
            text: response.text(),
            model: response.model.clone(),
            prompt_tokens: usage.prompt_tokens as i64,
            completion_tokens: usage.completion_tokens as i64,
            total_tokens: usage.total_tokens as i64,
        })
    }
}
