//! Typed payloads carried inside envelopes

use serde::{Deserialize, Serialize};

use crate::store::{Conversation, Message};

/// `chat` request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Target conversation; a new one is created when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// User message text
    pub content: String,
}

/// `chat_chunk` event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunkPayload {
    /// Conversation the reply belongs to
    pub conversation_id: String,
    /// Pre-minted assistant message id, identical for every chunk of a turn
    pub message_id: String,
    /// Incremental text (empty on the terminal chunk)
    pub content: String,
    /// Terminal marker
    pub done: bool,
}

/// `chat_complete` event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletePayload {
    /// Conversation the reply belongs to
    pub conversation_id: String,
    /// The persisted assistant message
    pub message: Message,
}

/// `new_conv` request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewConversationPayload {
    /// Optional initial title
    #[serde(default)]
    pub title: Option<String>,
}

/// `load_conv` and `delete_conv` requests
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationPayload {
    /// Conversation id
    pub id: String,
}

/// `list_convs` request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListConversationsPayload {
    /// Maximum number of conversations to return
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `conv_data` response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationDataPayload {
    /// Conversation metadata
    pub conversation: Conversation,
    /// Messages in chronological order
    pub messages: Vec<Message>,
}

/// `conv_list` response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationListPayload {
    /// Conversations, most recently updated first
    pub conversations: Vec<Conversation>,
}

/// `set_provider` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetProviderPayload {
    /// Registered provider name
    pub provider: String,
}

/// `set_model` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetModelPayload {
    /// Model identifier understood by the active provider
    pub model: String,
}

/// `cancel` request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CancelPayload {
    /// Request to cancel; all of the connection's requests when absent
    #[serde(default)]
    pub request_id: Option<String>,
}

/// `retry` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPayload {
    /// Conversation whose last reply should be regenerated
    pub conversation_id: String,
}

/// `ack` response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Conversation the acknowledged request refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Number of requests cancelled (`cancel` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<usize>,
}

impl AckPayload {
    /// Ack that names a conversation
    #[must_use]
    pub fn conversation(id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(id.into()),
            cancelled: None,
        }
    }
}

/// `status` response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Always true when answered by a live daemon
    pub running: bool,
    /// Active provider name (`none` when unconfigured)
    pub provider: String,
    /// Active model
    pub model: String,
    /// Number of stored conversations
    pub conversations: usize,
    /// Seconds since the daemon started
    #[serde(default)]
    pub uptime_seconds: u64,
    /// Seconds since the last inbound request
    pub idle_seconds: u64,
    /// Live client connections
    pub connections: usize,
    /// Circuit breaker state guarding the provider
    pub circuit: String,
    /// Breaker transitions since start
    #[serde(default)]
    pub circuit_transitions: u64,
    /// Unix milliseconds of the last breaker transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_changed_at: Option<i64>,
}

/// `heartbeat` event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Daemon wall clock in milliseconds
    pub timestamp: i64,
}

/// Wire-level error code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Provider rate limit
    RateLimit,
    /// Missing or rejected credentials
    AuthFailed,
    /// Transient network failure or timeout
    NetworkError,
    /// Upstream failure or open circuit
    ServerDown,
    /// Request exceeds the model context
    TokenLimit,
    /// Malformed frame, unknown type, bad payload, unknown conversation
    InvalidRequest,
    /// Request cancelled
    Cancelled,
    /// Model not available
    LocalNoModel,
    /// Store or invariant failure
    InternalError,
}

/// `error` response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Whether retrying the same request may succeed
    pub retryable: bool,
    /// Seconds to wait before retrying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Extra diagnostic detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorPayload {
    /// Create an error payload
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            retry_after: None,
            details: None,
        }
    }

    /// Non-retryable `INVALID_REQUEST`
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, false)
    }

    /// Non-retryable `INTERNAL_ERROR`
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, false)
    }

    /// Attach a retry hint in seconds
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Attach diagnostic detail
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
