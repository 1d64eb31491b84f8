//! Parley Daemon
//!
//! Local chat daemon. Clients connect over a Unix socket and exchange
//! newline-delimited JSON envelopes; replies stream from the configured
//! provider.
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon with the default socket ($XDG_RUNTIME_DIR/parley/parley.sock)
//! GOOGLE_API_KEY=... parley daemon
//!
//! # OpenAI instead of Gemini
//! OPENAI_API_KEY=sk-... parley daemon
//!
//! # Custom socket and config file
//! parley daemon --socket /tmp/parley.sock --config ./parley.toml
//!
//! # Ask a running daemon for its status
//! parley status
//!
//! # Check provider credentials without starting the daemon
//! parley test --skip-chat
//!
//! # With verbose logging
//! RUST_LOG=debug parley daemon
//! ```
//!
//! # Files
//!
//! - Socket: `$XDG_RUNTIME_DIR/parley/parley.sock` (or `/tmp/parley-$UID/parley.sock`)
//! - PID file: `parley.pid` next to the socket
//! - Conversations: `$XDG_DATA_HOME/parley/conversations.json`
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (removes PID file and socket)

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use parley_core::provider::{ChatMessage, ChatRequest, Role, StreamChunk};
use parley_core::{
    default_socket_path, load_config, load_config_from_path, run_heartbeat, watch_idle,
    ActivityClock, CircuitBreaker, CircuitHistory, ConnectionRegistry, ConversationManager,
    DaemonConfig, Envelope, GeminiProvider, IpcClient, IpcServer, JsonFileStore, MessageType,
    OpenAiProvider, Provider, ProviderRegistry, RequestHandler, ResilientExecutor, Sanitizer,
};

const PID_FILE_NAME: &str = "parley.pid";
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const TEST_PROMPT: &str = "Reply with a short greeting.";

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Local streaming chat daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Daemon {
        /// Unix socket path (overrides config and PARLEY_SOCKET)
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Configuration file
        #[arg(long, env = "PARLEY_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Query a running daemon
    Status {
        /// Unix socket path
        #[arg(long, env = "PARLEY_SOCKET")]
        socket: Option<PathBuf>,
    },
    /// Check the configured provider directly
    Test {
        /// Only validate credentials, skip the streamed chat
        #[arg(long)]
        skip_chat: bool,
        /// Configuration file
        #[arg(long, env = "PARLEY_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(matches!(cli.command, Command::Daemon { .. }))?;

    match cli.command {
        Command::Daemon { socket, config } => run_daemon(socket, config).await,
        Command::Status { socket } => run_status(socket).await,
        Command::Test { skip_chat, config } => run_test(skip_chat, config).await,
    }
}

fn init_logging(daemon: bool) -> anyhow::Result<()> {
    let level = if daemon { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("parley={level}").parse()?)
                .add_directive(format!("parley_core={level}").parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn resolve_config(path: Option<PathBuf>) -> anyhow::Result<DaemonConfig> {
    let config = match path {
        Some(path) => load_config_from_path(Some(path)).await,
        None => load_config().await,
    };
    config.context("Failed to load configuration")
}

// ============================================================================
// PID file
// ============================================================================

fn pid_path_for(socket_path: &Path) -> PathBuf {
    socket_path
        .parent()
        .map_or_else(|| PathBuf::from(PID_FILE_NAME), |dir| dir.join(PID_FILE_NAME))
}

async fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pid = std::process::id();
    tokio::fs::write(path, format!("{pid}\n")).await?;

    info!(pid, path = %path.display(), "PID file created");
    Ok(())
}

async fn remove_pid_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "PID file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove PID file"),
    }
}

// ============================================================================
// daemon
// ============================================================================

async fn run_daemon(socket: Option<PathBuf>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = resolve_config(config_path).await?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }

    info!(
        pid = std::process::id(),
        socket = %config.socket_path.display(),
        data_dir = %config.data_dir.display(),
        source = %config.source(),
        "Starting parley daemon"
    );

    let pid_path = pid_path_for(&config.socket_path);
    write_pid_file(&pid_path).await.with_context(|| {
        format!(
            "Failed to write PID file at {}. Check directory permissions.",
            pid_path.display()
        )
    })?;

    let result = serve(&config).await;
    remove_pid_file(&pid_path).await;

    if let Err(e) = &result {
        error!(error = %e, "Daemon failed");
    } else {
        info!("Parley daemon stopped cleanly");
    }
    result
}

async fn serve(config: &DaemonConfig) -> anyhow::Result<()> {
    let store = JsonFileStore::open(&config.data_dir)
        .await
        .with_context(|| format!("Failed to open store in {}", config.data_dir.display()))?;

    let providers = build_providers(config);
    if providers.is_empty() {
        warn!(
            "Neither GOOGLE_API_KEY nor OPENAI_API_KEY set; \
             chat requests will fail until a provider is configured"
        );
    }

    let circuit_history = CircuitHistory::new();
    let executor = build_executor(config, &circuit_history);
    let manager = Arc::new(
        ConversationManager::new(Arc::new(store), providers, executor)
            .with_system_prompt(config.system_prompt.clone()),
    );

    let root = CancellationToken::new();
    let clock = ActivityClock::new();
    let registry = ConnectionRegistry::new();
    let handler = Arc::new(RequestHandler::new(
        manager,
        Sanitizer::new(config.sanitizer.clone()),
        clock.clone(),
        registry.clone(),
    )
    .with_circuit_history(circuit_history));

    let server = IpcServer::new(config.server_config(), registry.clone(), handler, &root);
    server.start().await.with_context(|| {
        format!(
            "Failed to listen on {}. Check if another daemon is running.",
            config.socket_path.display()
        )
    })?;

    let tasks = TaskTracker::new();
    tasks.spawn(watch_idle(clock, config.idle_timeout, root.clone()));
    tasks.spawn(run_heartbeat(
        registry,
        config.heartbeat_interval,
        root.child_token(),
    ));
    tasks.close();

    info!("Ready to accept connections");

    tokio::select! {
        result = shutdown_signal() => {
            result?;
        }
        () = root.cancelled() => {}
    }

    info!("Performing graceful shutdown...");
    root.cancel();
    server.stop().await;
    tasks.wait().await;
    Ok(())
}

/// Every adapter with credentials; the manager prefers `gemini` when both are present
fn build_providers(config: &DaemonConfig) -> ProviderRegistry {
    let providers = ProviderRegistry::new();
    if config.has_gemini_key() {
        match GeminiProvider::new(config.gemini.clone()) {
            Ok(provider) => providers.register(Arc::new(provider)),
            Err(e) => warn!(error = %e, "Gemini provider unavailable"),
        }
    }
    if config.has_openai_key() {
        match OpenAiProvider::new(config.openai.clone()) {
            Ok(provider) => providers.register(Arc::new(provider)),
            Err(e) => warn!(error = %e, "OpenAI provider unavailable"),
        }
    }
    providers
}

/// Executor whose breaker transitions are recorded in `history`
fn build_executor(config: &DaemonConfig, history: &CircuitHistory) -> ResilientExecutor {
    let breaker =
        CircuitBreaker::new(config.circuit_breaker.clone()).with_observer(history.observer());
    ResilientExecutor::with_breaker(config.retry.clone(), Arc::new(breaker))
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to install Ctrl+C handler")?;
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }
    Ok(())
}

// ============================================================================
// status
// ============================================================================

async fn run_status(socket: Option<PathBuf>) -> anyhow::Result<()> {
    let socket_path = socket.unwrap_or_else(default_socket_path);

    let Ok(mut client) = IpcClient::connect(&socket_path).await else {
        bail!("parley daemon is not running (no socket at {})", socket_path.display());
    };

    let reply = client
        .request(&Envelope::empty(MessageType::Status), STATUS_TIMEOUT)
        .await
        .context("Daemon did not answer the status request")?;

    if reply.kind == MessageType::Error {
        bail!("Daemon returned an error: {}", reply.payload);
    }

    println!("{}", serde_json::to_string_pretty(&reply.payload)?);
    Ok(())
}

// ============================================================================
// test
// ============================================================================

async fn run_test(skip_chat: bool, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = resolve_config(config_path).await?;
    let providers = build_providers(&config);
    let Some(provider): Option<Arc<dyn Provider>> = providers
        .names()
        .first()
        .and_then(|name| providers.get(name))
    else {
        bail!("No provider configured: set GOOGLE_API_KEY or OPENAI_API_KEY, or add a [gemini] or [openai] api_key");
    };

    let cancel = CancellationToken::new();

    println!("Provider: {} (model {})", provider.name(), provider.default_model());
    provider
        .validate_connection(&cancel)
        .await
        .context("Connection check failed")?;
    println!("Connection: ok");

    if skip_chat {
        return Ok(());
    }

    let request = ChatRequest::new(vec![ChatMessage::new(Role::User, TEST_PROMPT)])
        .with_system_prompt(config.system_prompt.clone());
    let response = provider
        .chat(&cancel, &request, &print_chunk)
        .await
        .context("Chat request failed")?;
    println!();
    println!(
        "Chat: ok ({} chars from {})",
        response.content.chars().count(),
        response.model
    );
    Ok(())
}

fn print_chunk(chunk: StreamChunk) {
    if chunk.content.is_empty() {
        return;
    }
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(chunk.content.as_bytes());
    let _ = out.flush();
}
