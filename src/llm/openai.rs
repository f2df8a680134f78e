// OpenAI-compatible chat-completions generator.
// Works against any endpoint that speaks POST {base}/chat/completions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::provider::{PromptContext, TextGenerator, SYSTEM_PROMPT};
use crate::types::{CallFailure, LLMMessage, LLMRequest};

pub struct OpenAIGenerator {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [LLMMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl OpenAIGenerator {
    pub fn new(api_key: &str, base_url: &str, model: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    fn request(&self, prompt: &PromptContext, temperature: f32, max_tokens: u32) -> LLMRequest {
        LLMRequest {
            model: self.model.clone(),
            messages: vec![LLMMessage::system(SYSTEM_PROMPT), LLMMessage::user(prompt.render())],
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
        }
    }

    async fn complete(&self, request: &LLMRequest) -> Result<String, CallFailure> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| CallFailure::unavailable(format!("generation request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);

            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => CallFailure {
                    message: format!("generation rate limited: {}", message),
                    ..CallFailure::rate_limited(retry_after)
                },
                s if s.is_client_error() => CallFailure::invalid(format!("generation rejected ({}): {}", s, message)),
                s => CallFailure::unavailable(format!("generation error ({}): {}", s, message)),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CallFailure::unavailable(format!("failed to parse generation response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| CallFailure::unavailable("generation returned no content"))
    }
}

#[async_trait]
impl TextGenerator for OpenAIGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &PromptContext,
        temperature: f32,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String, CallFailure> {
        let request = self.request(prompt, temperature, max_tokens);
        debug!(model = %self.model, evidence = prompt.evidence.len(), "Requesting justification");
        tokio::select! {
            _ = cancel.cancelled() => Err(CallFailure::cancelled()),
            result = self.complete(&request) => result,
        }
    }
}
