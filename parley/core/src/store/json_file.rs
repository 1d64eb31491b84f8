//! JSON snapshot store
//!
//! Keeps everything in a [`MemoryStore`] and rewrites the snapshot file after
//! each mutation (write to a temp file, then rename). Writers are serialized
//! so snapshots land in mutation order.
//!
//! A mutation is applied to a fork of the in-memory state first; the fork
//! only replaces the live state once its snapshot is on disk, so a failed
//! write leaves both untouched.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::memory::{MemoryStore, Snapshot};
use super::{Conversation, Message, Store, StoreError};
use crate::provider::Role;

/// Snapshot file name inside the data directory
pub const SNAPSHOT_FILE_NAME: &str = "conversations.json";

/// Store persisted as a JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    memory: MemoryStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (or create) the store under `data_dir`
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or an existing snapshot
    /// cannot be read or parsed.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: data_dir.to_path_buf(),
                source,
            })?;

        let path = data_dir.join(SNAPSHOT_FILE_NAME);
        let memory = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                tracing::info!(
                    path = %path.display(),
                    conversations = snapshot.conversations.len(),
                    messages = snapshot.messages.len(),
                    "Loaded conversation store"
                );
                MemoryStore::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Starting with empty conversation store");
                MemoryStore::new()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Ok(Self {
            memory,
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Snapshot file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn commit(&self, staged: MemoryStore) -> Result<(), StoreError> {
        self.persist(&staged).await?;
        self.memory.commit(staged);
        Ok(())
    }

    async fn persist(&self, state: &MemoryStore) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&state.snapshot())?;
        let tmp = self.path.with_extension("json.tmp");

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        tracing::trace!(path = %self.path.display(), bytes = bytes.len(), "Snapshot written");
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn create_conversation(
        &self,
        provider: &str,
        model: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.memory.fork();
        let conversation = staged.create_conversation(provider, model, title).await?;
        self.commit(staged).await?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        self.memory.get_conversation(id).await
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>, StoreError> {
        self.memory.list_conversations(limit).await
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<Message, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.memory.fork();
        let message = staged
            .add_message(conversation_id, role, content, token_count)
            .await?;
        self.commit(staged).await?;
        Ok(message)
    }

    async fn add_message_with_id(
        &self,
        conversation_id: &str,
        id: &str,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<Message, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.memory.fork();
        let message = staged
            .add_message_with_id(conversation_id, id, role, content, token_count)
            .await?;
        self.commit(staged).await?;
        Ok(message)
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.memory.get_messages(conversation_id).await
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.memory.get_recent_messages(conversation_id, limit).await
    }

    async fn count_messages(&self, conversation_id: &str) -> Result<usize, StoreError> {
        self.memory.count_messages(conversation_id).await
    }

    async fn count_conversations(&self) -> Result<usize, StoreError> {
        self.memory.count_conversations().await
    }

    async fn update_conversation_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.memory.fork();
        staged.update_conversation_title(id, title).await?;
        self.commit(staged).await
    }

    async fn update_conversation_time(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.memory.fork();
        staged.update_conversation_time(id).await?;
        self.commit(staged).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.memory.fork();
        staged.delete_conversation(id).await?;
        self.commit(staged).await
    }
}
