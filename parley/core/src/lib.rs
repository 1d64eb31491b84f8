//! Parley Core - Local Streaming Chat Daemon
//!
//! This crate holds everything the `parley` daemon does, independent of how
//! the process is started. Clients connect over a Unix socket, exchange
//! newline-delimited JSON envelopes, and receive streamed replies from an
//! upstream chat provider.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Clients (CLI, editors)                   │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ line-JSON over Unix socket
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          PARLEY CORE                              │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │ IpcServer ── ConnectionRegistry (bounded outbound queues)  │  │
//! │  └────────────────────────────┬───────────────────────────────┘  │
//! │                  RequestHandler (sanitize, dispatch, cancel)      │
//! │                               │                                   │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │ ConversationManager                                         │  │
//! │  │  ┌────────┐   ┌────────────────────┐   ┌─────────────────┐ │  │
//! │  │  │ Store  │   │ ResilientExecutor  │──▶│    Provider     │ │  │
//! │  │  │        │   │ (retry + breaker)  │   │ (Gemini/OpenAI) │ │  │
//! │  │  └────────┘   └────────────────────┘   └─────────────────┘ │  │
//! │  └─────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`transport`]: socket server, line framing, connection registry, client
//! - [`protocol`]: envelope and payload types
//! - [`handler`]: request dispatch and per-request cancellation
//! - [`orchestrator`]: conversation turns, history windows, titles
//! - [`provider`]: provider trait with the Gemini and OpenAI adapters
//! - [`resilience`]: retry with backoff and the circuit breaker
//! - [`store`]: in-memory and JSON-file conversation storage
//! - [`security`]: input sanitization
//! - [`lifecycle`]: idle shutdown and heartbeats
//! - [`config`]: TOML and environment configuration

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod handler;
pub mod lifecycle;
pub mod orchestrator;
pub mod protocol;
pub mod provider;
pub mod resilience;
pub mod security;
pub mod store;
pub mod test_utils;
pub mod transport;

// Transport exports
pub use transport::{
    default_socket_path, ConnectionId, ConnectionRegistry, IpcClient, IpcServer, MessageHandler,
    RequestContext, ServerConfig, TransportError,
};

// Protocol exports
pub use protocol::{Envelope, ErrorCode, ErrorPayload, MessageType};

// Orchestration exports
pub use handler::RequestHandler;
pub use orchestrator::{ChatError, ConversationManager, OrchestratorStatus, TurnChunk};

// Provider exports
pub use provider::{
    GeminiConfig, GeminiProvider, OpenAiConfig, OpenAiProvider, Provider, ProviderError,
    ProviderErrorKind, ProviderRegistry,
};

// Resilience exports
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitHistory, CircuitState, ExecuteError,
    ResilientExecutor, RetryConfig,
};

// Store exports
pub use store::{Conversation, JsonFileStore, MemoryStore, Message, Store, StoreError};

// Lifecycle exports
pub use lifecycle::{run_heartbeat, watch_idle, ActivityClock};

// Security exports
pub use security::{SanitizeResult, Sanitizer, SanitizerLimits};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    DaemonConfig,
};
