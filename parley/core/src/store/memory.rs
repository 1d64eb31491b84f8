//! In-memory store

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{Conversation, Message, Store, StoreError};
use crate::provider::Role;

/// Serializable image of the whole store
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    /// Least recently touched first
    pub conversations: Vec<Conversation>,
    /// Oldest first per conversation
    pub messages: Vec<Message>,
}

#[derive(Clone, Debug)]
struct ConversationEntry {
    conversation: Conversation,
    messages: Vec<Message>,
    /// Monotonic touch counter; orders listings by recency
    revision: u64,
}

#[derive(Clone, Debug, Default)]
struct State {
    conversations: HashMap<String, ConversationEntry>,
    /// Message id -> conversation id
    message_index: HashMap<String, String>,
    next_revision: u64,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut ConversationEntry, StoreError> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))
    }

    fn entry(&self, id: &str) -> Result<&ConversationEntry, StoreError> {
        self.conversations
            .get(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))
    }

    fn touch(&mut self, id: &str) -> Result<(), StoreError> {
        let revision = self.bump();
        let entry = self.entry_mut(id)?;
        entry.conversation.updated_at = Utc::now();
        entry.revision = revision;
        Ok(())
    }
}

/// Store backed by reader/writer-locked maps
///
/// Cloning shares the same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = State::default();

        for conversation in snapshot.conversations {
            let revision = state.bump();
            state.conversations.insert(
                conversation.id.clone(),
                ConversationEntry {
                    conversation,
                    messages: Vec::new(),
                    revision,
                },
            );
        }

        for message in snapshot.messages {
            match state.conversations.get_mut(&message.conversation_id) {
                Some(entry) => {
                    state
                        .message_index
                        .insert(message.id.clone(), message.conversation_id.clone());
                    entry.messages.push(message);
                }
                None => tracing::warn!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    "Dropping orphaned message from snapshot"
                ),
            }
        }

        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Independent copy of the current state
    pub(crate) fn fork(&self) -> Self {
        Self {
            state: Arc::new(RwLock::new(self.state.read().clone())),
        }
    }

    /// Adopt the state of a fork
    pub(crate) fn commit(&self, staged: Self) {
        let state = std::mem::take(&mut *staged.state.write());
        *self.state.write() = state;
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let state = self.state.read();

        let mut entries: Vec<&ConversationEntry> = state.conversations.values().collect();
        entries.sort_by_key(|e| e.revision);

        Snapshot {
            conversations: entries.iter().map(|e| e.conversation.clone()).collect(),
            messages: entries
                .iter()
                .flat_map(|e| e.messages.iter().cloned())
                .collect(),
        }
    }

    fn insert_message(
        &self,
        conversation_id: &str,
        id: String,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<Message, StoreError> {
        let mut state = self.state.write();

        // Checked first so a missing conversation is reported as such
        state.entry(conversation_id)?;
        if state.message_index.contains_key(&id) {
            return Err(StoreError::DuplicateMessage(id));
        }

        let message = Message {
            id: id.clone(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            token_count,
            created_at: Utc::now(),
        };

        state.entry_mut(conversation_id)?.messages.push(message.clone());
        state
            .message_index
            .insert(id, conversation_id.to_string());
        state.touch(conversation_id)?;

        Ok(message)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_conversation(
        &self,
        provider: &str,
        model: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            created_at: now,
            updated_at: now,
            archived: false,
        };

        let mut state = self.state.write();
        let revision = state.bump();
        state.conversations.insert(
            conversation.id.clone(),
            ConversationEntry {
                conversation: conversation.clone(),
                messages: Vec::new(),
                revision,
            },
        );

        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        Ok(self.state.read().entry(id)?.conversation.clone())
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>, StoreError> {
        let state = self.state.read();

        let mut entries: Vec<&ConversationEntry> = state
            .conversations
            .values()
            .filter(|e| !e.conversation.archived)
            .collect();
        entries.sort_by(|a, b| b.revision.cmp(&a.revision));

        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.conversation.clone())
            .collect())
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<Message, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.insert_message(conversation_id, id, role, content, token_count)
    }

    async fn add_message_with_id(
        &self,
        conversation_id: &str,
        id: &str,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<Message, StoreError> {
        self.insert_message(conversation_id, id.to_string(), role, content, token_count)
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self.state.read().entry(conversation_id)?.messages.clone())
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read();
        let messages = &state.entry(conversation_id)?.messages;
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn count_messages(&self, conversation_id: &str) -> Result<usize, StoreError> {
        Ok(self.state.read().entry(conversation_id)?.messages.len())
    }

    async fn count_conversations(&self) -> Result<usize, StoreError> {
        Ok(self
            .state
            .read()
            .conversations
            .values()
            .filter(|e| !e.conversation.archived)
            .count())
    }

    async fn update_conversation_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.entry_mut(id)?.conversation.title = title.to_string();
        state.touch(id)
    }

    async fn update_conversation_time(&self, id: &str) -> Result<(), StoreError> {
        self.state.write().touch(id)
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let entry = state
            .conversations
            .remove(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))?;

        for message in &entry.messages {
            state.message_index.remove(&message.id);
        }

        tracing::debug!(
            conversation_id = %id,
            messages = entry.messages.len(),
            "Conversation deleted"
        );
        Ok(())
    }
}
