//! Transport Layer for daemon-client IPC
//!
//! Newline-delimited JSON envelopes over a Unix domain socket.
//!
//! # Security
//!
//! - Unix sockets use `SO_PEERCRED` to validate peer UID
//! - Socket files are created with 0600 permissions
//! - No network exposure

pub mod client;
pub mod error;
pub mod frame;
pub mod registry;
pub mod server;

use std::path::PathBuf;

pub use client::IpcClient;
pub use error::TransportError;
pub use frame::{encode_line, LineDecoder, MAX_FRAME_SIZE};
pub use registry::{
    BroadcastResult, ConnectionHandle, ConnectionId, ConnectionRegistry, SendOutcome,
};
pub use server::{IpcServer, MessageHandler, RequestContext, ServerConfig};

/// Socket file name inside the runtime directory
pub const SOCKET_FILE_NAME: &str = "parley.sock";

/// Default socket path
///
/// `$XDG_RUNTIME_DIR/parley/parley.sock`, falling back to
/// `/tmp/parley-$UID/parley.sock` when no runtime directory is available.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        return runtime_dir.join("parley").join(SOCKET_FILE_NAME);
    }

    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/parley-{uid}")).join(SOCKET_FILE_NAME)
}
