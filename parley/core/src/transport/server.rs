//! Unix Socket Server
//!
//! Accepts client connections on a local socket and multiplexes them onto a
//! single [`MessageHandler`].
//!
//! ```text
//!                       IpcServer (scope)
//!                             │
//!           ┌─────────────────┼─────────────────┐
//!           │                 │                 │
//!       conn-1 (child)    conn-2 (child)    conn-3 (child)
//!       read ─► handler   read ─► handler   read ─► handler
//!       write ◄─ queue    write ◄─ queue    write ◄─ queue
//! ```
//!
//! Each connection gets one read task, one write task, and one task per
//! inbound message. The read loop never waits for a handler, so replies to
//! two requests on the same connection may arrive in either order; clients
//! correlate by `request_id`.
//!
//! # Security
//!
//! - Socket created with mode 0600 (owner-only access)
//! - Peer UID validated via `SO_PEERCRED` (Linux)

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use super::frame::{encode_line, LineDecoder, MAX_FRAME_SIZE};
use super::registry::{
    BroadcastResult, ConnectionHandle, ConnectionId, ConnectionRegistry, SendOutcome,
};
use super::TransportError;
use crate::protocol::{Envelope, ErrorPayload, MessageType};

const READ_BUFFER_SIZE: usize = 8192;

/// Configuration for the socket server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Path of the socket file
    pub socket_path: PathBuf,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Per-connection outbound queue capacity
    pub queue_capacity: usize,
    /// Maximum size of a single inbound or outbound line
    pub max_frame_bytes: usize,
    /// How long `stop` waits for connection tasks to exit
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// Defaults for the given socket path
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_connections: 100,
            queue_capacity: 100,
            max_frame_bytes: MAX_FRAME_SIZE,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Set the connection limit
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the outbound queue capacity
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the frame size limit
    #[must_use]
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Set the shutdown deadline
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Processes decoded envelopes
///
/// Invoked on its own task for every well-formed inbound envelope.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one request; replies go through `ctx`
    async fn handle(&self, envelope: Envelope, ctx: RequestContext);
}

/// Where a request came from and how to answer it
#[derive(Clone)]
pub struct RequestContext {
    /// Originating connection
    pub connection_id: ConnectionId,
    /// Connection scope; cancelled when the connection or server goes away
    pub cancel: CancellationToken,
    registry: ConnectionRegistry,
}

impl RequestContext {
    /// Create a context for a registered connection
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        cancel: CancellationToken,
        registry: ConnectionRegistry,
    ) -> Self {
        Self {
            connection_id,
            cancel,
            registry,
        }
    }

    /// Queue an envelope for the originating connection
    pub fn reply(&self, envelope: Envelope) -> SendOutcome {
        self.registry.send(&self.connection_id, envelope)
    }
}

struct ServerShared {
    config: ServerConfig,
    registry: ConnectionRegistry,
    handler: Arc<dyn MessageHandler>,
    scope: CancellationToken,
    tracker: TaskTracker,
}

/// Local socket server
pub struct IpcServer {
    shared: Arc<ServerShared>,
    started: AtomicBool,
}

impl IpcServer {
    /// Create a server whose scope is a child of `parent`
    pub fn new(
        config: ServerConfig,
        registry: ConnectionRegistry,
        handler: Arc<dyn MessageHandler>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                registry,
                handler,
                scope: parent.child_token(),
                tracker: TaskTracker::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Path of the socket file
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.shared.config.socket_path
    }

    /// Live connections
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Server cancellation scope
    #[must_use]
    pub fn scope(&self) -> &CancellationToken {
        &self.shared.scope
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.registry.count()
    }

    /// Queue an envelope for one connection (queue-or-drop)
    pub fn send(&self, id: &ConnectionId, envelope: Envelope) -> SendOutcome {
        self.shared.registry.send(id, envelope)
    }

    /// Queue an envelope for every connection (queue-or-drop)
    pub fn broadcast(&self, envelope: &Envelope) -> BroadcastResult {
        self.shared.registry.broadcast(envelope)
    }

    /// Bind the socket and start accepting connections
    ///
    /// # Errors
    ///
    /// Fails if the server was already started, the socket directory cannot
    /// be created, or binding fails.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::InvalidState(
                "server already started".to_string(),
            ));
        }

        let path = &self.shared.config.socket_path;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TransportError::Io(io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {}: {e}", parent.display()),
                ))
            })?;
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => warn!(path = %path.display(), "Removed stale socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TransportError::Io(io::Error::new(
                    e.kind(),
                    format!("Failed to remove old socket {}: {e}", path.display()),
                )))
            }
        }

        let listener = UnixListener::bind(path)?;
        tokio::fs::set_permissions(path, PermissionsExt::from_mode(0o600)).await?;

        info!(path = %path.display(), "Listening on Unix socket");

        let shared = Arc::clone(&self.shared);
        self.shared
            .tracker
            .spawn(async move { shared.accept_loop(listener).await });
        Ok(())
    }

    /// Stop the server
    ///
    /// Cancels every connection, closes the listener, waits for connection
    /// tasks up to the shutdown deadline and removes the socket file.
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.scope.cancel();
        shared.tracker.close();

        let deadline = shared.config.shutdown_timeout;
        if tokio::time::timeout(deadline, shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                remaining_tasks = shared.tracker.len(),
                "Shutdown deadline elapsed, forcing exit"
            );
        }

        shared.registry.clear();

        let path = &shared.config.socket_path;
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Socket file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
        }

        info!("Server stopped");
    }
}

impl ServerShared {
    async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            let accepted = tokio::select! {
                () = self.scope.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _addr)) => self.open_connection(stream),
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
        debug!("Accept loop stopped");
    }

    fn open_connection(self: &Arc<Self>, stream: UnixStream) {
        if let Err(e) = validate_peer(&stream) {
            warn!(error = %e, "Rejecting connection");
            return;
        }

        let active = self.registry.count();
        if active >= self.config.max_connections {
            warn!(
                active,
                max = self.config.max_connections,
                "Connection limit reached, rejecting"
            );
            return;
        }

        let id = ConnectionId::new();
        let cancel = self.scope.child_token();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        self.registry
            .register(ConnectionHandle::new(id, tx, cancel.clone()));

        let (read_half, write_half) = stream.into_split();
        let span = tracing::info_span!("connection", connection_id = %id);

        let shared = Arc::clone(self);
        let read_cancel = cancel.clone();
        self.tracker.spawn(
            async move { shared.read_loop(id, read_cancel, read_half).await }
                .instrument(span.clone()),
        );
        self.tracker.spawn(
            write_loop(cancel, rx, write_half, self.config.max_frame_bytes).instrument(span),
        );
    }

    async fn read_loop(
        self: Arc<Self>,
        id: ConnectionId,
        cancel: CancellationToken,
        mut reader: OwnedReadHalf,
    ) {
        let mut decoder = LineDecoder::new(self.config.max_frame_bytes);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!("Connection closed by peer");
                    break;
                }
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    loop {
                        match decoder.decode::<Value>() {
                            Ok(Some(value)) => self.dispatch(id, &cancel, value),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "Frame decode error");
                                self.reject(id, String::new(), &e);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Read error");
                    break;
                }
            }
        }

        cancel.cancel();
        self.registry.unregister(&id);
        info!("Connection ended");
    }

    fn dispatch(&self, id: ConnectionId, cancel: &CancellationToken, value: Value) {
        let request_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let envelope = match serde_json::from_value::<Envelope>(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Invalid envelope");
                self.reject(id, request_id, &TransportError::Malformed(e.to_string()));
                return;
            }
        };

        debug!(kind = %envelope.kind, request_id = %envelope.request_id, "Dispatching");
        let ctx = RequestContext::new(id, cancel.clone(), self.registry.clone());
        let handler = Arc::clone(&self.handler);
        self.tracker
            .spawn(async move { handler.handle(envelope, ctx).await }.in_current_span());
    }

    fn reject(&self, id: ConnectionId, request_id: String, error: &TransportError) {
        let payload = ErrorPayload::invalid_request(error.to_string());
        let envelope = Envelope::with_request_id(MessageType::Error, request_id, &payload);
        self.registry.send(&id, envelope);
    }
}

async fn write_loop(
    cancel: CancellationToken,
    mut rx: mpsc::Receiver<Envelope>,
    mut writer: OwnedWriteHalf,
    max_frame: usize,
) {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let line = match encode_line(&envelope, max_frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "Encode error, dropping message");
                continue;
            }
        };

        let written = tokio::select! {
            () = cancel.cancelled() => break,
            written = writer.write_all(&line) => written,
        };

        if let Err(e) = written {
            warn!(error = %e, "Write error, closing connection");
            cancel.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Validate peer credentials
///
/// On Linux, uses `SO_PEERCRED` to verify the connecting process runs as the
/// same user as the daemon.
#[cfg(target_os = "linux")]
fn validate_peer(stream: &UnixStream) -> Result<(), TransportError> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    // SAFETY: `cred` is a plain C struct sized by `len`; getsockopt writes at
    // most `len` bytes into it.
    let cred = unsafe {
        let mut cred: libc::ucred = std::mem::zeroed();
        let mut len = libc::socklen_t::try_from(std::mem::size_of::<libc::ucred>())
            .unwrap_or(libc::socklen_t::MAX);

        let result = libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
            &mut len,
        );

        if result < 0 {
            return Err(TransportError::AuthenticationFailed(
                "Failed to get peer credentials".to_string(),
            ));
        }
        cred
    };

    // SAFETY: getuid has no preconditions and cannot fail.
    let my_uid = unsafe { libc::getuid() };

    if cred.uid != my_uid {
        return Err(TransportError::AuthenticationFailed(format!(
            "Peer UID {} does not match server UID {my_uid}",
            cred.uid
        )));
    }

    debug!(peer_uid = cred.uid, peer_pid = cred.pid, "Peer validated");
    Ok(())
}

/// Validate peer credentials (non-Linux fallback)
#[cfg(not(target_os = "linux"))]
fn validate_peer(_stream: &UnixStream) -> Result<(), TransportError> {
    // SO_PEERCRED is Linux-specific; the 0600 socket mode still applies
    debug!("Peer validation skipped (non-Linux platform)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::IpcClient;
    use tempfile::TempDir;

    /// Echoes every request back as an ack with the same request id
    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, envelope: Envelope, ctx: RequestContext) {
            ctx.reply(envelope.response(MessageType::Ack, &Value::Null));
        }
    }

    /// Never finishes and ignores cancellation
    struct StuckHandler;

    #[async_trait]
    impl MessageHandler for StuckHandler {
        async fn handle(&self, _envelope: Envelope, _ctx: RequestContext) {
            std::future::pending::<()>().await;
        }
    }

    fn server(dir: &TempDir, handler: Arc<dyn MessageHandler>) -> IpcServer {
        let config = ServerConfig::new(dir.path().join("parley.sock"))
            .with_shutdown_timeout(Duration::from_millis(200));
        IpcServer::new(
            config,
            ConnectionRegistry::new(),
            handler,
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_start_sets_permissions_and_stop_removes_socket() {
        let temp_dir = TempDir::new().unwrap();
        let server = server(&temp_dir, Arc::new(EchoHandler));
        server.start().await.unwrap();

        let socket_path = server.socket_path().to_path_buf();
        let metadata = std::fs::metadata(&socket_path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);

        server.stop().await;
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let server = server(&temp_dir, Arc::new(EchoHandler));
        server.start().await.unwrap();

        let second = server.start().await;
        assert!(matches!(second, Err(TransportError::InvalidState(_))));
        assert!(server.socket_path().exists());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let temp_dir = TempDir::new().unwrap();
        let server = server(&temp_dir, Arc::new(EchoHandler));
        server.start().await.unwrap();

        let mut client = IpcClient::connect(server.socket_path()).await.unwrap();
        client.send_raw(b"{not json\n").await.unwrap();

        let error = client.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(error.kind, MessageType::Error);
        let payload: ErrorPayload = error.payload_as().unwrap();
        assert_eq!(payload.code, crate::protocol::ErrorCode::InvalidRequest);
        assert!(!payload.retryable);

        // Same connection still serves requests
        let request = Envelope::with_request_id(MessageType::Status, "after", &Value::Null);
        let reply = client
            .request(&request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.request_id, "after");
        assert_eq!(reply.kind, MessageType::Ack);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_envelope_keeps_request_id() {
        let temp_dir = TempDir::new().unwrap();
        let server = server(&temp_dir, Arc::new(EchoHandler));
        server.start().await.unwrap();

        let mut client = IpcClient::connect(server.socket_path()).await.unwrap();
        client
            .send_raw(b"{\"request_id\":\"r-7\",\"payload\":{}}\n")
            .await
            .unwrap();

        let error = client.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(error.kind, MessageType::Error);
        assert_eq!(error.request_id, "r-7");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_connections_tracked_and_released() {
        let temp_dir = TempDir::new().unwrap();
        let server = server(&temp_dir, Arc::new(EchoHandler));
        server.start().await.unwrap();

        let mut client = IpcClient::connect(server.socket_path()).await.unwrap();
        let request = Envelope::with_request_id(MessageType::Status, "ping", &Value::Null);
        client
            .request(&request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(server.connection_count(), 1);

        drop(client);
        for _ in 0..50 {
            if server.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connection_count(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig::new(temp_dir.path().join("limit.sock")).with_max_connections(1);
        let server = IpcServer::new(
            config,
            ConnectionRegistry::new(),
            Arc::new(EchoHandler),
            &CancellationToken::new(),
        );
        server.start().await.unwrap();

        let mut first = IpcClient::connect(server.socket_path()).await.unwrap();
        let request = Envelope::with_request_id(MessageType::Status, "one", &Value::Null);
        first.request(&request, Duration::from_secs(2)).await.unwrap();

        let mut second = IpcClient::connect(server.socket_path()).await.unwrap();
        let result = second.recv_timeout(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_forces_exit_after_deadline() {
        let temp_dir = TempDir::new().unwrap();
        let server = server(&temp_dir, Arc::new(StuckHandler));
        server.start().await.unwrap();

        let mut client = IpcClient::connect(server.socket_path()).await.unwrap();
        client
            .send(&Envelope::empty(MessageType::Status))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        server.stop().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        assert!(!server.socket_path().exists());
    }
}
