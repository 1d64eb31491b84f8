//! Connection Registry
//!
//! Tracks every live client connection and its bounded outbound queue.
//!
//! ```text
//!                     ConnectionRegistry
//!                    ┌────────────────────────────────────────┐
//!                    │ HashMap<ConnectionId, ConnectionHandle> │
//!                    │   - wrapped in Arc<RwLock<>>            │
//!                    └───────────────┬────────────────────────┘
//!                                    │
//!             ┌──────────────────────┼──────────────────────┐
//!             │                      │                      │
//!      ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!      │   conn-1    │       │   conn-2     │       │   conn-3     │
//!      │ queue (100) │       │ queue (100)  │       │ queue (100)  │
//!      └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! # Backpressure
//!
//! Sends never wait. When a connection's queue is full the newest envelope is
//! dropped and the drop is logged; the producer carries on.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;

/// Unique identifier for a client connection
///
/// Assigned on accept and stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outcome of a best-effort send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Envelope placed on the outbound queue
    Queued,
    /// Queue full; envelope dropped
    Dropped,
    /// Connection gone
    Closed,
}

impl SendOutcome {
    /// Whether the envelope was queued
    #[must_use]
    pub fn is_queued(self) -> bool {
        self == Self::Queued
    }
}

/// Handle to a connected client
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Unique connection identifier
    pub id: ConnectionId,
    /// Outbound queue feeding the connection's write task
    pub tx: mpsc::Sender<Envelope>,
    /// Connection cancellation scope (child of the server scope)
    pub cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a new connection handle
    #[must_use]
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Envelope>, cancel: CancellationToken) -> Self {
        Self { id, tx, cancel }
    }

    /// Queue an envelope without waiting
    pub fn try_send(&self, envelope: Envelope) -> SendOutcome {
        match self.tx.try_send(envelope) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    kind = %dropped.kind,
                    request_id = %dropped.request_id,
                    "Outbound queue full, dropping message"
                );
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Number of connections that queued the message
    pub successful: usize,
    /// Number of connections that dropped the message
    pub failed: usize,
    /// IDs of connections that dropped the message
    pub failed_ids: Vec<ConnectionId>,
}

/// Registry of live connections
///
/// Cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    pub fn register(&self, handle: ConnectionHandle) -> ConnectionId {
        let id = handle.id;
        self.inner.write().insert(id, handle);
        tracing::info!(connection_id = %id, "Connection registered");
        id
    }

    /// Unregister a connection, returning its handle if it was registered
    pub fn unregister(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let handle = self.inner.write().remove(id);
        if handle.is_some() {
            tracing::info!(connection_id = %id, "Connection unregistered");
        }
        handle
    }

    /// Number of live connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Queue an envelope for one connection (queue-or-drop)
    pub fn send(&self, id: &ConnectionId, envelope: Envelope) -> SendOutcome {
        match self.inner.read().get(id) {
            Some(handle) => handle.try_send(envelope),
            None => {
                tracing::debug!(connection_id = %id, "Send to unknown connection");
                SendOutcome::Closed
            }
        }
    }

    /// Queue an envelope for every live connection
    ///
    /// Senders are snapshotted under the read lock; the fan-out itself runs
    /// without holding it.
    pub fn broadcast(&self, envelope: &Envelope) -> BroadcastResult {
        let targets: Vec<(ConnectionId, mpsc::Sender<Envelope>)> = {
            let inner = self.inner.read();
            inner.iter().map(|(id, h)| (*id, h.tx.clone())).collect()
        };

        let mut result = BroadcastResult::default();
        for (id, tx) in targets {
            match tx.try_send(envelope.clone()) {
                Ok(()) => result.successful += 1,
                Err(e) => {
                    if matches!(e, TrySendError::Full(_)) {
                        tracing::warn!(
                            connection_id = %id,
                            kind = %envelope.kind,
                            "Outbound queue full, dropping broadcast"
                        );
                    }
                    result.failed += 1;
                    result.failed_ids.push(id);
                }
            }
        }
        result
    }

    /// Remove every connection
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn create_test_handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = ConnectionHandle::new(ConnectionId::new(), tx, CancellationToken::new());
        (handle, rx)
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId(42);
        assert_eq!(format!("{id}"), "conn-42");
    }

    #[test]
    fn test_connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_registry_register_unregister() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = create_test_handle(4);
        let id = registry.register(handle);

        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id));

        assert!(registry.unregister(&id).is_some());
        assert_eq!(registry.count(), 0);
        assert!(registry.unregister(&id).is_none());
    }

    #[test]
    fn test_registry_send_to_one() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1) = create_test_handle(4);
        let (h2, mut rx2) = create_test_handle(4);
        let id1 = registry.register(h1);
        registry.register(h2);

        let outcome = registry.send(&id1, Envelope::empty(MessageType::Ack));
        assert_eq!(outcome, SendOutcome::Queued);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_send_unknown_connection() {
        let registry = ConnectionRegistry::new();
        let outcome = registry.send(&ConnectionId::new(), Envelope::empty(MessageType::Ack));
        assert_eq!(outcome, SendOutcome::Closed);
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = create_test_handle(2);
        let id = registry.register(handle);

        let first = Envelope::with_request_id(MessageType::Ack, "1", &serde_json::Value::Null);
        let second = Envelope::with_request_id(MessageType::Ack, "2", &serde_json::Value::Null);
        let third = Envelope::with_request_id(MessageType::Ack, "3", &serde_json::Value::Null);

        assert!(registry.send(&id, first).is_queued());
        assert!(registry.send(&id, second).is_queued());
        assert_eq!(registry.send(&id, third), SendOutcome::Dropped);

        assert_eq!(rx.try_recv().unwrap().request_id, "1");
        assert_eq!(rx.try_recv().unwrap().request_id, "2");
        assert!(rx.try_recv().is_err());

        // Space freed, connection writable again
        let fourth = Envelope::with_request_id(MessageType::Ack, "4", &serde_json::Value::Null);
        assert!(registry.send(&id, fourth).is_queued());
        assert_eq!(rx.try_recv().unwrap().request_id, "4");
    }

    #[test]
    fn test_registry_broadcast() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1) = create_test_handle(1);
        let (h2, mut rx2) = create_test_handle(1);
        registry.register(h1);
        let id2 = registry.register(h2);

        // Fill conn 2 so the broadcast overflows there only
        assert!(registry.send(&id2, Envelope::empty(MessageType::Ack)).is_queued());

        let result = registry.broadcast(&Envelope::empty(MessageType::Heartbeat));
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failed_ids, vec![id2]);

        assert_eq!(rx1.try_recv().unwrap().kind, MessageType::Heartbeat);
        assert_eq!(rx2.try_recv().unwrap().kind, MessageType::Ack);
    }
}
