//! OpenAI-compatible chat completions client used to generate character replies.

use super::retry::{with_retry, RetryPolicy};
use super::{BackendError, GenerationMode, Generator};
use crate::config::LlmConfig;
use crate::models::ChatMessage;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Prepended to every voice-mode request.
const VOICE_STYLE_INSTRUCTION: &str = "This is a live voice call. Reply the way you would speak out loud, \
    staying fully in character. Use one or two short, natural sentences. Never describe actions, \
    expressions or tone in brackets or asterisks, and never use lists or markdown.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<&'a ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

pub struct ChatCompletionsClient {
    http: Client,
    config: LlmConfig,
    policy: RetryPolicy,
}

impl ChatCompletionsClient {
    pub fn new(http: Client, config: LlmConfig) -> Self {
        let policy = RetryPolicy::from(&config.backend);
        Self { http, config, policy }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn request_once(&self, body: &ChatRequest<'_>) -> Result<String, BackendError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .timeout(self.policy.timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(BackendError::Status { status: status.as_u16(), body: message });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| BackendError::Protocol("response contained no choices".to_string()))
    }
}

#[async_trait]
impl Generator for ChatCompletionsClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        mode: GenerationMode,
    ) -> Result<String, BackendError> {
        if self.config.api_key.is_empty() {
            return Err(BackendError::NotConfigured("llm"));
        }

        let style = ChatMessage::system(VOICE_STYLE_INSTRUCTION);
        let (prefix, max_tokens) = match mode {
            GenerationMode::Voice => (Some(&style), self.config.voice_max_tokens),
            GenerationMode::Chat => (None, self.config.chat_max_tokens),
        };

        let body = ChatRequest {
            model: &self.config.model,
            messages: prefix.into_iter().chain(messages.iter()).collect(),
            temperature,
            max_tokens,
        };
        debug!(model = %self.config.model, messages = body.messages.len(), ?mode, "requesting completion");

        let reply = with_retry("llm", &self.policy, || self.request_once(&body)).await?;
        info!(chars = reply.chars().count(), "completion received");
        Ok(reply)
    }
}
