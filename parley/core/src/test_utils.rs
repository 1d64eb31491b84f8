//! Provider Test Utilities
//!
//! Scripted [`Provider`] for exercising the orchestrator, handler and server
//! without network access. Each call to `chat` pops the next [`Outcome`] from
//! the script; once the script is empty the fallback outcome is replayed.
//!
//! # Usage
//!
//! ```ignore
//! use parley_core::test_utils::{Outcome, ScriptedProvider};
//! use parley_core::provider::ProviderErrorKind;
//!
//! let provider = ScriptedProvider::new("mock")
//!     .with_script([Outcome::fail_after(["par", "tial"], ProviderErrorKind::Network)]);
//!
//! // ... drive a chat turn ...
//! assert_eq!(provider.call_count(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::provider::{
    ChatRequest, ChatResponse, ModelInfo, Provider, ProviderError, ProviderErrorKind,
    StreamCallback, StreamChunk,
};

// ============================================================================
// Outcomes
// ============================================================================

/// What a single scripted `chat` call does
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Stream the chunks, then the terminal marker, then succeed
    Reply(Vec<String>),
    /// Stream the chunks, then fail with the given kind (no terminal marker)
    FailAfter {
        /// Deltas delivered before the failure
        chunks: Vec<String>,
        /// Error kind returned
        kind: ProviderErrorKind,
    },
    /// Stream the chunks, then wait until cancelled
    Hang(Vec<String>),
}

impl Outcome {
    /// Successful reply made of `chunks`
    pub fn reply<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Reply(chunks.into_iter().map(Into::into).collect())
    }

    /// Failure with no output
    #[must_use]
    pub fn fail(kind: ProviderErrorKind) -> Self {
        Self::FailAfter {
            chunks: Vec::new(),
            kind,
        }
    }

    /// Failure after streaming `chunks`
    pub fn fail_after<I, S>(chunks: I, kind: ProviderErrorKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::FailAfter {
            chunks: chunks.into_iter().map(Into::into).collect(),
            kind,
        }
    }

    /// Output then block until cancellation
    pub fn hang<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Hang(chunks.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// Scripted Provider
// ============================================================================

/// Provider that replays a script of outcomes and records every request
pub struct ScriptedProvider {
    name: String,
    model: String,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicU32,
    validate_error: Mutex<Option<ProviderErrorKind>>,
}

impl ScriptedProvider {
    /// Provider named `name` that answers "Hello world" in two chunks
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "mock-model".to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Outcome::reply(["Hello", " world"])),
            requests: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            validate_error: Mutex::new(None),
        }
    }

    /// Set the default model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Queue outcomes for the next calls
    #[must_use]
    pub fn with_script(self, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    /// Outcome used once the script is exhausted
    #[must_use]
    pub fn with_fallback(self, outcome: Outcome) -> Self {
        *self.fallback.lock() = outcome;
        self
    }

    /// Make `validate_connection` fail with `kind`
    #[must_use]
    pub fn with_validate_error(self, kind: ProviderErrorKind) -> Self {
        *self.validate_error.lock() = Some(kind);
        self
    }

    /// Queue one more outcome
    pub fn push(&self, outcome: Outcome) {
        self.script.lock().push_back(outcome);
    }

    /// Number of `chat` calls so far
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    /// The most recent request
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().last().cloned()
    }

    fn next_outcome(&self) -> Outcome {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone())
    }

    fn error(&self, kind: ProviderErrorKind) -> ProviderError {
        ProviderError::new(&self.name, kind, format!("scripted {kind} failure"))
    }

    fn stream(
        &self,
        cancel: &CancellationToken,
        chunks: &[String],
        on_chunk: &StreamCallback<'_>,
    ) -> Result<String, ProviderError> {
        let mut content = String::new();
        for chunk in chunks {
            if cancel.is_cancelled() {
                return Err(ProviderError::cancelled(&self.name));
            }
            content.push_str(chunk);
            on_chunk(StreamChunk::delta(chunk.clone()));
        }
        Ok(content)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        on_chunk: &StreamCallback<'_>,
    ) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        match self.next_outcome() {
            Outcome::Reply(chunks) => {
                let content = self.stream(cancel, &chunks, on_chunk)?;
                on_chunk(StreamChunk::done());
                let model = if request.model.is_empty() {
                    self.model.clone()
                } else {
                    request.model.clone()
                };
                Ok(ChatResponse {
                    content,
                    model,
                    finish_reason: Some("stop".to_string()),
                })
            }
            Outcome::FailAfter { chunks, kind } => {
                self.stream(cancel, &chunks, on_chunk)?;
                Err(self.error(kind))
            }
            Outcome::Hang(chunks) => {
                self.stream(cancel, &chunks, on_chunk)?;
                cancel.cancelled().await;
                Err(ProviderError::cancelled(&self.name))
            }
        }
    }

    async fn validate_connection(&self, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        match *self.validate_error.lock() {
            Some(kind) => Err(self.error(kind)),
            None => Ok(()),
        }
    }

    async fn list_models(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(vec![ModelInfo {
            id: self.model.clone(),
            owned_by: Some(self.name.clone()),
        }])
    }
}
