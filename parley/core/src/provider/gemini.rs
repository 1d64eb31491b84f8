//! Google Gemini Provider
//!
//! `POST {base_url}/models/{model}:streamGenerateContent?alt=sse` with the key
//! in `x-goog-api-key`. Each event carries a full candidate fragment:
//!
//! ```text
//! data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}
//! data: {"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP"}]}
//! ```
//!
//! There is no end sentinel; the stream simply closes.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::http::{request_error, status_error};
use super::openai::SseEvent;
use super::{
    ChatRequest, ChatResponse, ModelInfo, Provider, ProviderError, ProviderErrorKind, Role,
    StreamCallback, StreamChunk,
};

const PROVIDER_NAME: &str = "gemini";

/// Default API endpoint
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default chat model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Gemini adapter settings
#[derive(Clone)]
pub struct GeminiConfig {
    /// API key
    pub api_key: String,
    /// Model used when a request names none
    pub model: String,
    /// Default response length limit
    pub max_tokens: u32,
    /// Default sampling temperature
    pub temperature: f32,
    /// Whole-request timeout
    pub timeout: Duration,
    /// API root, e.g. `https://generativelanguage.googleapis.com/v1beta`
    pub base_url: String,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for GeminiConfig {
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

/// Gemini chat provider
#[derive(Clone)]
pub struct GeminiProvider {
    config: GeminiConfig,
    http_client: reqwest::Client,
}

impl GeminiProvider {
    /// Create a provider
    ///
    /// # Errors
    ///
    /// Returns an `Auth` error if the API key is empty and a `Network` error
    /// if the HTTP client cannot be built.
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
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
    pub fn config(&self) -> &GeminiConfig {
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

    fn build_body(&self, request: &ChatRequest) -> Value {
        // System turns travel in systemInstruction, not in contents
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let max_tokens = if request.max_tokens == 0 {
            self.config.max_tokens
        } else {
            request.max_tokens
        };

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": max_tokens,
                "temperature": request.temperature.unwrap_or(self.config.temperature),
            },
        });
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        body
    }

    async fn get(&self, path: &str) -> Result<Value, ProviderError> {
        let response = self
            .http_client
            .get(self.url(path))
            .header("x-goog-api-key", &self.config.api_key)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER_NAME, &e))?;

        if !response.status().is_success() {
            return Err(status_error(PROVIDER_NAME, response).await);
        }
        response
            .json()
            .await
            .map_err(|e| request_error(PROVIDER_NAME, &e))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let data = self.get("models?pageSize=1000").await?;
        let mut models: Vec<ModelInfo> = data
            .get("models")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(chat_model).collect())
            .unwrap_or_default();

        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

/// Models that can serve `generateContent`, with the `models/` prefix removed
fn chat_model(model: &Value) -> Option<ModelInfo> {
    let supports_chat = model
        .get("supportedGenerationMethods")
        .and_then(Value::as_array)
        .is_some_and(|methods| methods.iter().any(|m| m == "generateContent"));
    if !supports_chat {
        return None;
    }

    let name = model.get("name")?.as_str()?;
    Some(ModelInfo {
        id: name.strip_prefix("models/").unwrap_or(name).to_string(),
        owned_by: Some("google".to_string()),
    })
}

#[async_trait]
impl Provider for GeminiProvider {
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
        let body = self.build_body(request);

        tracing::debug!(model = %model, messages = request.messages.len(), "Starting Gemini stream");

        let send = self
            .http_client
            .post(self.url(&format!("models/{model}:streamGenerateContent?alt=sse")))
            .header("x-goog-api-key", &self.config.api_key)
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

        loop {
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
                match parse_gemini_line(&line) {
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
                    SseEvent::Done | SseEvent::Skip => {}
                }
            }
        }

        if content.is_empty() {
            return Err(ProviderError::new(
                PROVIDER_NAME,
                ProviderErrorKind::Server,
                format!(
                    "No response content received (finish reason: {})",
                    finish_reason.as_deref().unwrap_or("none")
                ),
            ));
        }

        on_chunk(StreamChunk::done());

        Ok(ChatResponse {
            content,
            model,
            finish_reason,
        })
    }

    async fn validate_connection(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let path = format!("models/{}", self.config.model);
        tokio::select! {
            () = cancel.cancelled() => Err(ProviderError::cancelled(PROVIDER_NAME)),
            result = self.get(&path) => result.map(|_| ()),
        }
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

/// Parse one line of a `streamGenerateContent` SSE stream
#[must_use]
pub fn parse_gemini_line(line: &[u8]) -> SseEvent {
    let Ok(text) = std::str::from_utf8(line) else {
        return SseEvent::Skip;
    };
    let Some(data) = text.trim().strip_prefix("data:") else {
        return SseEvent::Skip;
    };

    let value: Value = match serde_json::from_str(data.trim()) {
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
    if let Some(reason) = value
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(Value::as_str)
    {
        return SseEvent::Error(format!("Prompt blocked: {reason}"));
    }

    let candidate = value.get("candidates").and_then(|c| c.get(0));
    let content = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();
    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
        .map(String::from);

    SseEvent::Delta {
        content,
        finish_reason,
    }
}
