//! Conversation Store
//!
//! Durable state for conversations and their messages. The orchestrator talks
//! to the [`Store`] trait; two implementations ship with the daemon:
//!
//! - [`MemoryStore`]: reader/writer-locked maps, lost on exit
//! - [`JsonFileStore`]: a `MemoryStore` snapshotted to
//!   `<data_dir>/conversations.json` after every mutation

mod json_file;
mod memory;

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use json_file::{JsonFileStore, SNAPSHOT_FILE_NAME};
pub use memory::MemoryStore;

use crate::provider::Role;

/// Conversation metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique id
    pub id: String,
    /// Display title
    pub title: String,
    /// Provider active when the conversation was created
    pub provider: String,
    /// Model recorded for the conversation (empty = use the active model)
    pub model: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last time a message was added or metadata changed
    pub updated_at: DateTime<Utc>,
    /// Hidden from listings and counts
    #[serde(default)]
    pub archived: bool,
}

/// One stored message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Speaker
    pub role: Role,
    /// Text
    pub content: String,
    /// Estimated token count
    pub token_count: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// No conversation with this id
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// A message with this id already exists
    #[error("duplicate message id: {0}")]
    DuplicateMessage(String),

    /// Snapshot file could not be read or written
    #[error("store I/O error at {}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Snapshot file could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Conversation and message persistence
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a conversation
    async fn create_conversation(
        &self,
        provider: &str,
        model: &str,
        title: &str,
    ) -> Result<Conversation, StoreError>;

    /// Fetch one conversation
    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Most recently updated conversations first, archived excluded
    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>, StoreError>;

    /// Append a message under a fresh id
    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<Message, StoreError>;

    /// Append a message under a caller-chosen id; fails if the id exists
    async fn add_message_with_id(
        &self,
        conversation_id: &str,
        id: &str,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<Message, StoreError>;

    /// All messages of a conversation, oldest first
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    /// The last `limit` messages of a conversation, oldest first
    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Number of messages in a conversation
    async fn count_messages(&self, conversation_id: &str) -> Result<usize, StoreError>;

    /// Number of non-archived conversations
    async fn count_conversations(&self) -> Result<usize, StoreError>;

    /// Rename a conversation
    async fn update_conversation_title(&self, id: &str, title: &str) -> Result<(), StoreError>;

    /// Mark a conversation as just updated
    async fn update_conversation_time(&self, id: &str) -> Result<(), StoreError>;

    /// Remove a conversation and all its messages
    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError>;
}
