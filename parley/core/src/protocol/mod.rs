//! Wire Protocol
//!
//! Every message exchanged over the daemon socket is an [`Envelope`]: a typed,
//! correlated wrapper around a JSON payload.
//!
//! ```text
//! {"type":"chat","request_id":"7f3c...","payload":{"content":"hi"},"timestamp":1700000000000}
//! ```
//!
//! Responses reuse the request's `request_id`. Unsolicited broadcasts
//! (heartbeats) carry a freshly minted id. The `type` string selects the
//! payload shape; unknown type strings decode into [`MessageType::Unknown`] so
//! the daemon can answer them with an error instead of dropping the frame.

mod payloads;

pub use payloads::{
    AckPayload, CancelPayload, ChatChunkPayload, ChatCompletePayload, ChatPayload,
    ConversationDataPayload, ConversationListPayload, ConversationPayload, ErrorCode,
    ErrorPayload, HeartbeatPayload, ListConversationsPayload, NewConversationPayload,
    RetryPayload, SetModelPayload, SetProviderPayload, StatusPayload,
};

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from interpreting an envelope's payload
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload did not match the shape required by the message type
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// Message type whose payload failed to decode
        kind: MessageType,
        /// Underlying decode error
        source: serde_json::Error,
    },
}

/// Message type carried in the envelope's `type` field
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    // Requests
    /// Send a user message and stream the reply
    Chat,
    /// Create an empty conversation
    NewConversation,
    /// Fetch a conversation with its messages
    LoadConversation,
    /// List recent conversations
    ListConversations,
    /// Delete a conversation and its messages
    DeleteConversation,
    /// Daemon status (request and response)
    Status,
    /// Switch the active provider
    SetProvider,
    /// Switch the active model
    SetModel,
    /// Cancel in-flight requests on this connection
    Cancel,
    /// Regenerate the last assistant reply
    Retry,

    // Responses and events
    /// Streaming delta of an assistant reply
    ChatChunk,
    /// Final persisted assistant message
    ChatComplete,
    /// Error response
    Error,
    /// Periodic liveness broadcast
    Heartbeat,
    /// Conversation summaries
    ConversationList,
    /// One conversation with its messages
    ConversationData,
    /// Acknowledgement
    Ack,

    /// Any type string this daemon does not recognise
    Unknown(String),
}

impl MessageType {
    /// Wire representation
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::NewConversation => "new_conv",
            Self::LoadConversation => "load_conv",
            Self::ListConversations => "list_convs",
            Self::DeleteConversation => "delete_conv",
            Self::Status => "status",
            Self::SetProvider => "set_provider",
            Self::SetModel => "set_model",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
            Self::ChatChunk => "chat_chunk",
            Self::ChatComplete => "chat_complete",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::ConversationList => "conv_list",
            Self::ConversationData => "conv_data",
            Self::Ack => "ack",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "chat" => Self::Chat,
            "new_conv" => Self::NewConversation,
            "load_conv" => Self::LoadConversation,
            "list_convs" => Self::ListConversations,
            "delete_conv" => Self::DeleteConversation,
            "status" => Self::Status,
            "set_provider" => Self::SetProvider,
            "set_model" => Self::SetModel,
            "cancel" => Self::Cancel,
            "retry" => Self::Retry,
            "chat_chunk" => Self::ChatChunk,
            "chat_complete" => Self::ChatComplete,
            "error" => Self::Error,
            "heartbeat" => Self::Heartbeat,
            "conv_list" => Self::ConversationList,
            "conv_data" => Self::ConversationData,
            "ack" => Self::Ack,
            _ => Self::Unknown(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed, correlated message wrapper
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type; selects the payload shape
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Correlation token chosen by the requester
    #[serde(default)]
    pub request_id: String,
    /// Type-specific payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Wall clock time in milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Create an envelope with a fresh request id
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Self {
        Self::with_request_id(kind, new_request_id(), payload)
    }

    /// Create an envelope with an explicit request id
    pub fn with_request_id<T: Serialize>(
        kind: MessageType,
        request_id: impl Into<String>,
        payload: &T,
    ) -> Self {
        Self {
            payload: to_payload(&kind, payload),
            kind,
            request_id: request_id.into(),
            timestamp: now_millis(),
        }
    }

    /// Create an envelope without payload
    #[must_use]
    pub fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            request_id: new_request_id(),
            payload: Value::Null,
            timestamp: now_millis(),
        }
    }

    /// Build a response correlated to this envelope
    pub fn response<T: Serialize>(&self, kind: MessageType, payload: &T) -> Self {
        Self::with_request_id(kind, self.request_id.clone(), payload)
    }

    /// Build an error response correlated to this envelope
    #[must_use]
    pub fn error_response(&self, error: &ErrorPayload) -> Self {
        self.response(MessageType::Error, error)
    }

    /// Decode the payload into `T`
    ///
    /// A missing payload decodes as an empty object so request types whose
    /// fields are all optional need not send one.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let result = match &self.payload {
            Value::Null => serde_json::from_value(Value::Object(serde_json::Map::new())),
            value => T::deserialize(value),
        };
        result.map_err(|source| ProtocolError::InvalidPayload {
            kind: self.kind.clone(),
            source,
        })
    }
}

/// Mint a new correlation id
#[must_use]
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn to_payload<T: Serialize>(kind: &MessageType, payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|e| {
        tracing::error!(kind = %kind, error = %e, "Failed to encode payload");
        Value::Null
    })
}
