//! Chat Provider Abstraction
//!
//! Trait definitions for chat-completion providers. The orchestrator works
//! against [`Provider`] only; adapters handle API formats, auth and error
//! normalization.
//!
//! # Streaming contract
//!
//! `chat` invokes the callback zero or more times with incremental text, in
//! order, and then exactly once with a terminal chunk (empty content,
//! `done = true`). The callback is synchronous and must not block.

pub mod error;
pub mod gemini;
mod http;
pub mod openai;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use error::{ProviderError, ProviderErrorKind};
pub use gemini::{GeminiConfig, GeminiProvider};
pub use http::classify_status;
pub use openai::{OpenAiConfig, OpenAiProvider};

/// Speaker of a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model
    System,
    /// Human input
    User,
    /// Model output
    Assistant,
}

impl Role {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of conversation history sent to a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker
    pub role: Role,
    /// Text
    pub content: String,
}

impl ChatMessage {
    /// Create a message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Input for a chat completion
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatRequest {
    /// Conversation history, oldest first
    pub messages: Vec<ChatMessage>,
    /// Model identifier (empty = provider default)
    pub model: String,
    /// Response length limit (0 = provider default)
    pub max_tokens: u32,
    /// Sampling temperature (provider default when unset)
    pub temperature: Option<f32>,
    /// Prepended as a system message
    pub system_prompt: Option<String>,
}

impl ChatRequest {
    /// Create a request over `messages`
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Set model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }
}

/// Result of a completed chat call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatResponse {
    /// Full response text
    pub content: String,
    /// Model that produced it
    pub model: String,
    /// Why generation stopped, if reported
    pub finish_reason: Option<String>,
}

/// A piece of streamed output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamChunk {
    /// Incremental text (empty on the terminal chunk)
    pub content: String,
    /// Terminal marker
    pub done: bool,
}

impl StreamChunk {
    /// Incremental text
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
        }
    }

    /// Terminal marker
    #[must_use]
    pub fn done() -> Self {
        Self {
            content: String::new(),
            done: true,
        }
    }
}

/// Synchronous per-chunk callback
pub type StreamCallback<'a> = dyn Fn(StreamChunk) + Send + Sync + 'a;

/// Information about an available model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier
    pub id: String,
    /// Owning organisation, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

/// Chat-completion provider
///
/// Implement this trait to add support for another upstream.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier (e.g. "openai", "gemini")
    fn name(&self) -> &str;

    /// Model used when a request names none
    fn default_model(&self) -> &str;

    /// Send a chat request and stream the reply through `on_chunk`
    async fn chat(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        on_chunk: &StreamCallback<'_>,
    ) -> Result<ChatResponse, ProviderError>;

    /// Check that the provider is reachable and the credentials work
    async fn validate_connection(&self, cancel: &CancellationToken) -> Result<(), ProviderError>;

    /// List available models
    async fn list_models(&self, cancel: &CancellationToken)
        -> Result<Vec<ModelInfo>, ProviderError>;
}

/// Named providers available to the daemon
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<HashMap<String, Arc<dyn Provider>>>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous one
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        tracing::info!(provider = %name, model = %provider.default_model(), "Provider registered");
        self.providers.write().insert(name, provider);
    }

    /// Look up a provider by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().get(name).cloned()
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedProvider;

    #[test]
    fn test_role_wire_names() {
        let json = serde_json::to_string(&ChatMessage::new(Role::Assistant, "hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn test_request_builder() {
        let request = ChatRequest::new(vec![ChatMessage::new(Role::User, "hello")])
            .with_model("m1")
            .with_system_prompt("be brief")
            .with_max_tokens(64)
            .with_temperature(5.0);

        assert_eq!(request.model, "m1");
        assert_eq!(request.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(request.max_tokens, 64);
        assert_eq!(request.temperature, Some(2.0));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(ScriptedProvider::new("beta")));
        registry.register(Arc::new(ScriptedProvider::new("alpha")));

        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("gamma").is_none());
    }
}
