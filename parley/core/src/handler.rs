//! Request dispatch
//!
//! [`RequestHandler`] is the daemon's [`MessageHandler`]: it decodes the
//! payload for each request type, calls into the [`ConversationManager`] and
//! answers on the originating connection with the request's `request_id`.
//!
//! In-flight chat turns are tracked per `(connection, request_id)` so a
//! `cancel` request can stop one of them or all of a connection's turns. A
//! turn whose `request_id` is already streaming on the same connection is
//! rejected.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lifecycle::ActivityClock;
use crate::orchestrator::{ChatError, ConversationManager, TurnChunk};
use crate::resilience::CircuitHistory;
use crate::protocol::{
    new_request_id, AckPayload, CancelPayload, ChatChunkPayload, ChatCompletePayload,
    ChatPayload, ConversationDataPayload, ConversationListPayload, ConversationPayload, Envelope,
    ErrorPayload, ListConversationsPayload, MessageType, NewConversationPayload, RetryPayload,
    SetModelPayload, SetProviderPayload, StatusPayload,
};
use crate::security::Sanitizer;
use crate::store::Message;
use crate::transport::{ConnectionId, ConnectionRegistry, MessageHandler, RequestContext};

type InFlightKey = (ConnectionId, String);

/// What a streamed turn should do
enum Turn {
    /// Persist a new user message, then reply
    Chat(String),
    /// Regenerate the reply to the last user message
    Retry,
}

/// Dispatches decoded envelopes to the orchestrator
pub struct RequestHandler {
    manager: Arc<ConversationManager>,
    sanitizer: Sanitizer,
    clock: ActivityClock,
    registry: ConnectionRegistry,
    circuit_history: CircuitHistory,
    in_flight: DashMap<InFlightKey, CancellationToken>,
}

impl RequestHandler {
    /// Create a handler
    ///
    /// `registry` is only read, to report the connection count.
    #[must_use]
    pub fn new(
        manager: Arc<ConversationManager>,
        sanitizer: Sanitizer,
        clock: ActivityClock,
        registry: ConnectionRegistry,
    ) -> Self {
        Self {
            manager,
            sanitizer,
            clock,
            registry,
            circuit_history: CircuitHistory::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Report breaker transitions from `history` in status replies
    ///
    /// `history` should be the one observing the manager's breaker.
    #[must_use]
    pub fn with_circuit_history(mut self, history: CircuitHistory) -> Self {
        self.circuit_history = history;
        self
    }

    /// Number of turns currently streaming
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn reply<T: Serialize>(ctx: &RequestContext, request: &Envelope, kind: MessageType, payload: &T) {
        ctx.reply(request.response(kind, payload));
    }

    fn reply_error(ctx: &RequestContext, request: &Envelope, error: &ErrorPayload) {
        debug!(
            connection_id = %ctx.connection_id,
            request_id = %request.request_id,
            code = ?error.code,
            message = %error.message,
            "Replying with error"
        );
        ctx.reply(request.error_response(error));
    }

    fn decode<T: serde::de::DeserializeOwned>(ctx: &RequestContext, request: &Envelope) -> Option<T> {
        match request.payload_as() {
            Ok(payload) => Some(payload),
            Err(e) => {
                Self::reply_error(ctx, request, &ErrorPayload::invalid_request(e.to_string()));
                None
            }
        }
    }

    /// Track a new turn; `None` if the id is already streaming on this connection
    fn begin_request(
        &self,
        ctx: &RequestContext,
        request_id: &str,
    ) -> Option<(InFlightKey, CancellationToken)> {
        let request_id = if request_id.is_empty() {
            new_request_id()
        } else {
            request_id.to_string()
        };
        let key = (ctx.connection_id, request_id);
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = ctx.cancel.child_token();
                slot.insert(token.clone());
                Some((key, token))
            }
        }
    }

    fn cancel_requests(&self, connection_id: ConnectionId, request_id: Option<String>) -> usize {
        let keys: Vec<InFlightKey> = match request_id {
            Some(request_id) => vec![(connection_id, request_id)],
            None => self
                .in_flight
                .iter()
                .filter(|entry| entry.key().0 == connection_id)
                .map(|entry| entry.key().clone())
                .collect(),
        };

        keys.into_iter()
            .filter_map(|key| self.in_flight.remove(&key))
            .map(|(_, token)| token.cancel())
            .count()
    }

    // ------------------------------------------------------------------------
    // Request types
    // ------------------------------------------------------------------------

    async fn handle_chat(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<ChatPayload>(ctx, request) else {
            return;
        };

        let sanitized = self.sanitizer.sanitize(&payload.content);
        for warning in &sanitized.warnings {
            warn!(
                connection_id = %ctx.connection_id,
                request_id = %request.request_id,
                kind = %warning.kind,
                "{}",
                warning.message
            );
        }
        if sanitized.input.trim().is_empty() {
            Self::reply_error(ctx, request, &ErrorPayload::invalid_request("Message content is empty"));
            return;
        }

        let conversation_id = payload.conversation_id.filter(|id| !id.is_empty());
        self.stream_turn(request, ctx, conversation_id, Turn::Chat(sanitized.input))
            .await;
    }

    async fn handle_retry(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<RetryPayload>(ctx, request) else {
            return;
        };
        self.stream_turn(request, ctx, Some(payload.conversation_id), Turn::Retry)
            .await;
    }

    /// Run one turn: `ack`, then chunks, then `chat_complete` or `error`
    ///
    /// Without a conversation id a new conversation is created first.
    async fn stream_turn(
        &self,
        request: &Envelope,
        ctx: &RequestContext,
        conversation_id: Option<String>,
        turn: Turn,
    ) {
        let Some((key, cancel)) = self.begin_request(ctx, &request.request_id) else {
            Self::reply_error(
                ctx,
                request,
                &ErrorPayload::invalid_request(format!(
                    "Request {} is already in progress",
                    request.request_id
                )),
            );
            return;
        };

        let result = self
            .run_turn(request, ctx, &cancel, conversation_id, turn)
            .await;
        self.in_flight.remove(&key);

        match result {
            Ok((conversation_id, message)) => Self::reply(
                ctx,
                request,
                MessageType::ChatComplete,
                &ChatCompletePayload {
                    conversation_id,
                    message,
                },
            ),
            Err(e) => Self::reply_error(ctx, request, &e.to_payload()),
        }
    }

    async fn run_turn(
        &self,
        request: &Envelope,
        ctx: &RequestContext,
        cancel: &CancellationToken,
        conversation_id: Option<String>,
        turn: Turn,
    ) -> Result<(String, Message), ChatError> {
        // Ack only a conversation that exists
        let conversation_id = match conversation_id {
            Some(id) => self.manager.conversation(&id).await?.id,
            None => self.manager.new_conversation(None).await?.id,
        };
        Self::reply(ctx, request, MessageType::Ack, &AckPayload::conversation(&conversation_id));

        let sink = |chunk: TurnChunk| {
            Self::reply(
                ctx,
                request,
                MessageType::ChatChunk,
                &ChatChunkPayload {
                    conversation_id: chunk.conversation_id,
                    message_id: chunk.message_id,
                    content: chunk.content,
                    done: chunk.done,
                },
            );
        };

        let message = match turn {
            Turn::Chat(content) => {
                self.manager
                    .chat(cancel, &conversation_id, &content, &sink)
                    .await?
            }
            Turn::Retry => self.manager.retry(cancel, &conversation_id, &sink).await?,
        };
        Ok((conversation_id, message))
    }

    async fn handle_new_conversation(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<NewConversationPayload>(ctx, request) else {
            return;
        };
        let result = self.manager.new_conversation(payload.title.as_deref()).await;
        Self::reply_result(ctx, request, result.map(|conversation| {
            (
                MessageType::ConversationData,
                ConversationDataPayload {
                    conversation,
                    messages: Vec::new(),
                },
            )
        }));
    }

    async fn handle_load_conversation(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<ConversationPayload>(ctx, request) else {
            return;
        };
        let result = self.manager.load_conversation(&payload.id).await;
        Self::reply_result(ctx, request, result.map(|(conversation, messages)| {
            (
                MessageType::ConversationData,
                ConversationDataPayload {
                    conversation,
                    messages,
                },
            )
        }));
    }

    async fn handle_list_conversations(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<ListConversationsPayload>(ctx, request) else {
            return;
        };
        let result = self.manager.list_conversations(payload.limit).await;
        Self::reply_result(ctx, request, result.map(|conversations| {
            (
                MessageType::ConversationList,
                ConversationListPayload { conversations },
            )
        }));
    }

    async fn handle_delete_conversation(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<ConversationPayload>(ctx, request) else {
            return;
        };
        let result = self.manager.delete_conversation(&payload.id).await;
        Self::reply_result(ctx, request, result.map(|()| {
            (MessageType::Ack, AckPayload::conversation(payload.id))
        }));
    }

    async fn handle_status(&self, request: &Envelope, ctx: &RequestContext) {
        let result = self.manager.status().await.map(|status| {
            (
                MessageType::Status,
                StatusPayload {
                    running: true,
                    provider: status.provider,
                    model: status.model,
                    conversations: status.conversations,
                    uptime_seconds: self.clock.uptime_seconds(),
                    idle_seconds: self.clock.idle_seconds(),
                    connections: self.registry.count(),
                    circuit: status.circuit.as_str().to_string(),
                    circuit_transitions: self.circuit_history.transitions(),
                    circuit_changed_at: self.circuit_history.last_change_ms(),
                },
            )
        });
        Self::reply_result(ctx, request, result);
    }

    fn handle_set_provider(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<SetProviderPayload>(ctx, request) else {
            return;
        };
        let result = self.manager.set_provider(&payload.provider);
        Self::reply_result(ctx, request, result.map(|()| (MessageType::Ack, AckPayload::default())));
    }

    fn handle_set_model(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<SetModelPayload>(ctx, request) else {
            return;
        };
        let result = self.manager.set_model(&payload.model);
        Self::reply_result(ctx, request, result.map(|()| (MessageType::Ack, AckPayload::default())));
    }

    fn handle_cancel(&self, request: &Envelope, ctx: &RequestContext) {
        let Some(payload) = Self::decode::<CancelPayload>(ctx, request) else {
            return;
        };
        let cancelled = self.cancel_requests(ctx.connection_id, payload.request_id);
        debug!(connection_id = %ctx.connection_id, cancelled, "Cancel requested");
        Self::reply(
            ctx,
            request,
            MessageType::Ack,
            &AckPayload {
                conversation_id: None,
                cancelled: Some(cancelled),
            },
        );
    }

    fn reply_result<T: Serialize>(
        ctx: &RequestContext,
        request: &Envelope,
        result: Result<(MessageType, T), ChatError>,
    ) {
        match result {
            Ok((kind, payload)) => Self::reply(ctx, request, kind, &payload),
            Err(e) => Self::reply_error(ctx, request, &e.to_payload()),
        }
    }
}

#[async_trait]
impl MessageHandler for RequestHandler {
    async fn handle(&self, envelope: Envelope, ctx: RequestContext) {
        // Status polling does not keep the daemon alive
        if envelope.kind != MessageType::Status {
            self.clock.touch();
        }

        debug!(
            connection_id = %ctx.connection_id,
            request_id = %envelope.request_id,
            kind = %envelope.kind,
            "Handling request"
        );

        match &envelope.kind {
            MessageType::Chat => self.handle_chat(&envelope, &ctx).await,
            MessageType::Retry => self.handle_retry(&envelope, &ctx).await,
            MessageType::NewConversation => self.handle_new_conversation(&envelope, &ctx).await,
            MessageType::LoadConversation => self.handle_load_conversation(&envelope, &ctx).await,
            MessageType::ListConversations => self.handle_list_conversations(&envelope, &ctx).await,
            MessageType::DeleteConversation => {
                self.handle_delete_conversation(&envelope, &ctx).await;
            }
            MessageType::Status => self.handle_status(&envelope, &ctx).await,
            MessageType::SetProvider => self.handle_set_provider(&envelope, &ctx),
            MessageType::SetModel => self.handle_set_model(&envelope, &ctx),
            MessageType::Cancel => self.handle_cancel(&envelope, &ctx),
            MessageType::Unknown(kind) => Self::reply_error(
                &ctx,
                &envelope,
                &ErrorPayload::invalid_request(format!("Unknown message type: {kind}")),
            ),
            other => Self::reply_error(
                &ctx,
                &envelope,
                &ErrorPayload::invalid_request(format!("Not a request type: {other}")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use crate::provider::{Provider, ProviderRegistry};
    use crate::resilience::ResilientExecutor;
    use crate::store::{MemoryStore, Store};
    use crate::test_utils::{Outcome, ScriptedProvider};
    use crate::transport::ConnectionHandle;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Setup {
        handler: Arc<RequestHandler>,
        ctx: RequestContext,
        rx: mpsc::Receiver<Envelope>,
        provider: Arc<ScriptedProvider>,
    }

    fn setup(provider: ScriptedProvider) -> Setup {
        let provider = Arc::new(provider);
        let providers = ProviderRegistry::new();
        providers.register(Arc::clone(&provider) as Arc<dyn Provider>);
        let manager = Arc::new(ConversationManager::new(
            Arc::new(MemoryStore::new()) as Arc<dyn Store>,
            providers,
            ResilientExecutor::default(),
        ));

        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(100);
        let id = ConnectionId::new();
        let cancel = CancellationToken::new();
        registry.register(ConnectionHandle::new(id, tx, cancel.clone()));

        let handler = Arc::new(RequestHandler::new(
            manager,
            Sanitizer::default(),
            ActivityClock::new(),
            registry.clone(),
        ));
        Setup {
            handler,
            ctx: RequestContext::new(id, cancel, registry),
            rx,
            provider,
        }
    }

    fn request(kind: MessageType, id: &str, payload: serde_json::Value) -> Envelope {
        Envelope::with_request_id(kind, id, &payload)
    }

    fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn test_chat_without_conversation() {
        let mut s = setup(ScriptedProvider::new("mock"));
        s.handler
            .handle(request(MessageType::Chat, "r1", json!({"content": "hi"})), s.ctx.clone())
            .await;

        let replies = drain(&mut s.rx);
        assert!(replies.iter().all(|e| e.request_id == "r1"));

        let kinds: Vec<MessageType> = replies.iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::Ack,
                MessageType::ChatChunk,
                MessageType::ChatChunk,
                MessageType::ChatChunk,
                MessageType::ChatComplete,
            ]
        );

        let ack: AckPayload = replies[0].payload_as().unwrap();
        let conversation_id = ack.conversation_id.unwrap();

        let chunks: Vec<ChatChunkPayload> = replies[1..4].iter().map(|e| e.payload_as().unwrap()).collect();
        assert!(chunks.iter().all(|c| c.conversation_id == conversation_id));
        assert!(chunks.iter().all(|c| c.message_id == chunks[0].message_id));
        assert!(chunks[2].done);

        let complete: ChatCompletePayload = replies[4].payload_as().unwrap();
        assert_eq!(complete.message.id, chunks[0].message_id);
        assert_eq!(s.handler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_is_invalid_request() {
        let mut s = setup(ScriptedProvider::new("mock"));
        s.handler
            .handle(request(MessageType::from("teleport".to_string()), "r9", json!({})), s.ctx.clone())
            .await;

        let replies = drain(&mut s.rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::Error);
        assert_eq!(replies[0].request_id, "r9");
        let error: ErrorPayload = replies[0].payload_as().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidRequest);
        assert!(error.message.contains("teleport"));
    }

    #[tokio::test]
    async fn test_bad_payload_is_invalid_request() {
        let mut s = setup(ScriptedProvider::new("mock"));
        s.handler
            .handle(request(MessageType::LoadConversation, "r2", json!({"nope": 1})), s.ctx.clone())
            .await;

        let error: ErrorPayload = drain(&mut s.rx)[0].payload_as().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidRequest);
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let mut s = setup(ScriptedProvider::new("mock"));
        s.handler
            .handle(request(MessageType::Chat, "r3", json!({"content": "\u{0007}  "})), s.ctx.clone())
            .await;

        let replies = drain(&mut s.rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::Error);
        assert_eq!(s.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_requests_of_connection() {
        let mut s = setup(ScriptedProvider::new("mock").with_fallback(Outcome::hang(["tick"])));

        let turn = {
            let handler = Arc::clone(&s.handler);
            let ctx = s.ctx.clone();
            tokio::spawn(async move {
                handler
                    .handle(request(MessageType::Chat, "long", json!({"content": "hi"})), ctx)
                    .await;
            })
        };

        while s.handler.in_flight() == 0 || s.provider.call_count() == 0 {
            tokio::task::yield_now().await;
        }

        s.handler
            .handle(request(MessageType::Cancel, "c1", json!({})), s.ctx.clone())
            .await;
        turn.await.unwrap();

        let replies = drain(&mut s.rx);
        let cancel_ack = replies.iter().find(|e| e.request_id == "c1").unwrap();
        let ack: AckPayload = cancel_ack.payload_as().unwrap();
        assert_eq!(ack.cancelled, Some(1));

        let last = replies.iter().rev().find(|e| e.request_id == "long").unwrap();
        assert_eq!(last.kind, MessageType::Error);
        let error: ErrorPayload = last.payload_as().unwrap();
        assert_eq!(error.code, ErrorCode::Cancelled);
        assert_eq!(s.handler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_conversation_gets_error_without_ack() {
        let mut s = setup(ScriptedProvider::new("mock"));
        s.handler
            .handle(
                request(MessageType::Chat, "r4", json!({"conversation_id": "ghost", "content": "hi"})),
                s.ctx.clone(),
            )
            .await;
        s.handler
            .handle(request(MessageType::Retry, "r5", json!({"conversation_id": "ghost"})), s.ctx.clone())
            .await;

        let replies = drain(&mut s.rx);
        let kinds: Vec<(String, MessageType)> = replies
            .iter()
            .map(|e| (e.request_id.clone(), e.kind.clone()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("r4".to_string(), MessageType::Error),
                ("r5".to_string(), MessageType::Error),
            ]
        );
        let error: ErrorPayload = replies[0].payload_as().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidRequest);
        assert_eq!(s.provider.call_count(), 0);
        assert_eq!(s.handler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected_while_streaming() {
        let mut s = setup(ScriptedProvider::new("mock").with_fallback(Outcome::hang(["tick"])));

        let first = {
            let handler = Arc::clone(&s.handler);
            let ctx = s.ctx.clone();
            tokio::spawn(async move {
                handler
                    .handle(request(MessageType::Chat, "dup", json!({"content": "one"})), ctx)
                    .await;
            })
        };
        while s.handler.in_flight() == 0 || s.provider.call_count() == 0 {
            tokio::task::yield_now().await;
        }

        s.handler
            .handle(request(MessageType::Chat, "dup", json!({"content": "two"})), s.ctx.clone())
            .await;
        let replies = drain(&mut s.rx);
        let rejection = replies.last().unwrap();
        assert_eq!(rejection.kind, MessageType::Error);
        let error: ErrorPayload = rejection.payload_as().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidRequest);
        assert!(error.message.contains("dup"));

        // The first turn keeps its token and stays cancellable
        assert_eq!(s.handler.in_flight(), 1);
        assert_eq!(s.provider.call_count(), 1);
        s.handler
            .handle(request(MessageType::Cancel, "c", json!({"request_id": "dup"})), s.ctx.clone())
            .await;
        first.await.unwrap();

        let replies = drain(&mut s.rx);
        let ack: AckPayload = replies
            .iter()
            .find(|e| e.request_id == "c")
            .unwrap()
            .payload_as()
            .unwrap();
        assert_eq!(ack.cancelled, Some(1));
        let last: ErrorPayload = replies
            .iter()
            .rev()
            .find(|e| e.request_id == "dup")
            .unwrap()
            .payload_as()
            .unwrap();
        assert_eq!(last.code, ErrorCode::Cancelled);
        assert_eq!(s.handler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let mut s = setup(ScriptedProvider::new("mock"));
        s.handler
            .handle(request(MessageType::Cancel, "c", json!({"request_id": "ghost"})), s.ctx.clone())
            .await;
        let ack: AckPayload = drain(&mut s.rx)[0].payload_as().unwrap();
        assert_eq!(ack.cancelled, Some(0));
    }

    #[tokio::test]
    async fn test_conversation_crud() {
        let mut s = setup(ScriptedProvider::new("mock"));

        s.handler
            .handle(request(MessageType::NewConversation, "n", json!({"title": "Plans"})), s.ctx.clone())
            .await;
        let data: ConversationDataPayload = drain(&mut s.rx)[0].payload_as().unwrap();
        assert_eq!(data.conversation.title, "Plans");
        assert!(data.messages.is_empty());
        let id = data.conversation.id;

        s.handler
            .handle(request(MessageType::ListConversations, "l", serde_json::Value::Null), s.ctx.clone())
            .await;
        let list: ConversationListPayload = drain(&mut s.rx)[0].payload_as().unwrap();
        assert_eq!(list.conversations.len(), 1);

        s.handler
            .handle(request(MessageType::DeleteConversation, "d", json!({"id": id})), s.ctx.clone())
            .await;
        let ack: AckPayload = drain(&mut s.rx)[0].payload_as().unwrap();
        assert_eq!(ack.conversation_id.as_deref(), Some(id.as_str()));

        s.handler
            .handle(request(MessageType::LoadConversation, "g", json!({"id": id})), s.ctx.clone())
            .await;
        let reply = &drain(&mut s.rx)[0];
        assert_eq!(reply.kind, MessageType::Error);
    }

    #[tokio::test]
    async fn test_status_reports_daemon_state() {
        let mut s = setup(ScriptedProvider::new("mock"));
        s.handler
            .handle(request(MessageType::Status, "s", serde_json::Value::Null), s.ctx.clone())
            .await;

        let reply = &drain(&mut s.rx)[0];
        assert_eq!(reply.kind, MessageType::Status);
        let status: StatusPayload = reply.payload_as().unwrap();
        assert!(status.running);
        assert_eq!(status.provider, "mock");
        assert_eq!(status.model, "mock-model");
        assert_eq!(status.connections, 1);
        assert_eq!(status.circuit, "closed");
        assert_eq!(status.circuit_transitions, 0);
        assert_eq!(status.circuit_changed_at, None);
    }

    #[tokio::test]
    async fn test_status_reports_circuit_history() {
        let s = setup(ScriptedProvider::new("mock"));
        let history = CircuitHistory::new();
        let handler = RequestHandler::new(
            Arc::clone(&s.handler.manager),
            Sanitizer::default(),
            ActivityClock::new(),
            s.handler.registry.clone(),
        )
        .with_circuit_history(history.clone());
        let mut rx = s.rx;

        history.record();
        history.record();
        handler
            .handle(request(MessageType::Status, "s", serde_json::Value::Null), s.ctx.clone())
            .await;

        let status: StatusPayload = drain(&mut rx)[0].payload_as().unwrap();
        assert_eq!(status.circuit_transitions, 2);
        assert_eq!(status.circuit_changed_at, history.last_change_ms());
        assert!(status.uptime_seconds < 5);
    }

    #[tokio::test]
    async fn test_set_provider_and_model() {
        let mut s = setup(ScriptedProvider::new("mock"));

        s.handler
            .handle(request(MessageType::SetProvider, "p", json!({"provider": "other"})), s.ctx.clone())
            .await;
        let error: ErrorPayload = drain(&mut s.rx)[0].payload_as().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidRequest);

        s.handler
            .handle(request(MessageType::SetModel, "m", json!({"model": "big"})), s.ctx.clone())
            .await;
        assert_eq!(drain(&mut s.rx)[0].kind, MessageType::Ack);
    }
}
