//! OpenAI-compatible Provider
//!
//! Chat completions over `POST {base_url}/chat/completions` with server-sent
//! events streaming, and model listing over `GET {base_url}/models`.
//!
//! # Streaming format
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}
//! data: [DONE]
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::http::{request_error, status_error};
use super::{
    ChatRequest, ChatResponse, ModelInfo, Provider, ProviderError, ProviderErrorKind, Role,
    StreamCallback, StreamChunk,
};

const PROVIDER_NAME: &str = "openai";

/// Default API endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default chat model
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI adapter settings
#[derive(Clone)]
pub struct OpenAiConfig {
    /// Bearer token
    pub api_key: String,
    /// Model used when a request names none
    pub model: String,
    /// Default response length limit
    pub max_tokens: u32,
    /// Default sampling temperature
    pub temperature: f32,
    /// Whole-request timeout
    pub timeout: Duration,
    /// API root, e.g. `https://api.openai.com/v1`
    pub base_url: String,
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            timeout: Duration::from_secs(60),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Check that an API key has the expected shape
///
/// Only catches obvious paste errors; the provider has the final word.
#[must_use]
pub fn looks_like_api_key(key: &str) -> bool {
    key.starts_with("sk-") && key.len() >= 20
}

/// OpenAI-compatible chat provider
#[derive(Clone)]
pub struct OpenAiProvider {
    config: OpenAiConfig,
    http_client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider
    ///
    /// # Errors
    ///
    /// Returns an `Auth` error if the API key is empty and a `Network` error
    /// if the HTTP client cannot be built.
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        if config.api_key.trim().is_empty() {
            return Err(ProviderError::new(
                PROVIDER_NAME,
                ProviderErrorKind::Auth,
                "API key is required",
            ));
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                ProviderError::new(
                    PROVIDER_NAME,
                    ProviderErrorKind::Network,
                    format!("Failed to create HTTP client: {e}"),
                )
            })?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Settings in use
    #[must_use]
    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn resolve_model<'a>(&'a self, request: &'a ChatRequest) -> &'a str {
        if request.model.is_empty() {
            &self.config.model
        } else {
            &request.model
        }
    }

    fn build_body(&self, request: &ChatRequest, model: &str) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({"role": Role::System.as_str(), "content": system}));
        }
        for message in &request.messages {
            messages.push(json!({"role": message.role.as_str(), "content": message.content}));
        }

        let max_tokens = if request.max_tokens == 0 {
            self.config.max_tokens
        } else {
            request.max_tokens
        };

        json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": request.temperature.unwrap_or(self.config.temperature),
            "stream": true,
        })
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let response = self
            .http_client
            .get(self.url("models"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER_NAME, &e))?;

        if !response.status().is_success() {
            return Err(status_error(PROVIDER_NAME, response).await);
        }

        let data: Value = response.json().await.map_err(|e| request_error(PROVIDER_NAME, &e))?;
        let mut models: Vec<ModelInfo> = data
            .get("data")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        Some(ModelInfo {
                            id: m.get("id")?.as_str()?.to_string(),
                            owned_by: m
                                .get("owned_by")
                                .and_then(Value::as_str)
                                .map(String::from),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    async fn chat(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        on_chunk: &StreamCallback<'_>,
    ) -> Result<ChatResponse, ProviderError> {
        let model = self.resolve_model(request).to_string();
        let body = self.build_body(request, &model);

        tracing::debug!(model = %model, messages = request.messages.len(), "Starting chat completion");

        let send = self
            .http_client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(ProviderError::cancelled(PROVIDER_NAME)),
            response = send => response.map_err(|e| request_error(PROVIDER_NAME, &e))?,
        };

        if !response.status().is_success() {
            return Err(status_error(PROVIDER_NAME, response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut finish_reason = None;

        'stream: loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(ProviderError::cancelled(PROVIDER_NAME)),
                next = stream.next() => next,
            };

            let Some(chunk) = next else {
                break;
            };
            let bytes = chunk.map_err(|e| request_error(PROVIDER_NAME, &e))?;
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_sse_line(&line) {
                    SseEvent::Delta {
                        content: delta,
                        finish_reason: reason,
                    } => {
                        if !delta.is_empty() {
                            content.push_str(&delta);
                            on_chunk(StreamChunk::delta(delta));
                        }
                        if reason.is_some() {
                            finish_reason = reason;
                        }
                    }
                    SseEvent::Error(message) => {
                        return Err(ProviderError::new(
                            PROVIDER_NAME,
                            ProviderErrorKind::Server,
                            message,
                        ));
                    }
                    SseEvent::Done => break 'stream,
                    SseEvent::Skip => {}
                }
            }
        }

        on_chunk(StreamChunk::done());

        Ok(ChatResponse {
            content,
            model,
            finish_reason,
        })
    }

    async fn validate_connection(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.list_models(cancel).await.map(|_| ())
    }

    async fn list_models(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelInfo>, ProviderError> {
        tokio::select! {
            () = cancel.cancelled() => Err(ProviderError::cancelled(PROVIDER_NAME)),
            models = self.get_models() => models,
        }
    }
}

/// One parsed server-sent-events line
#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// Content delta (possibly empty) and optional finish reason
    Delta {
        /// Incremental text
        content: String,
        /// Why generation stopped
        finish_reason: Option<String>,
    },
    /// Error object embedded in the stream
    Error(String),
    /// End-of-stream sentinel
    Done,
    /// Comment, keep-alive, non-data field or undecodable data
    Skip,
}

/// Parse a single SSE line
#[must_use]
pub fn parse_sse_line(line: &[u8]) -> SseEvent {
    let Ok(text) = std::str::from_utf8(line) else {
        return SseEvent::Skip;
    };
    let Some(data) = text.trim().strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return SseEvent::Done;
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping undecodable stream line");
            return SseEvent::Skip;
        }
    };

    if let Some(message) = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return SseEvent::Error(message.to_string());
    }

    let choice = value.get("choices").and_then(|c| c.get(0));
    let content = choice
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str)
        .map(String::from);

    SseEvent::Delta {
        content,
        finish_reason,
    }
}
