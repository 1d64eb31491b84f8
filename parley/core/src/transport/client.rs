//! Socket Client
//!
//! Minimal client used by the CLI and by tests to talk to a running daemon.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::frame::{encode_line, LineDecoder, MAX_FRAME_SIZE};
use super::TransportError;
use crate::protocol::{Envelope, MessageType};

const READ_BUFFER_SIZE: usize = 8192;

/// Client side of the daemon socket
pub struct IpcClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: LineDecoder,
    buf: Vec<u8>,
}

impl IpcClient {
    /// Connect to the daemon socket at `path`
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the socket is missing or
    /// refuses the connection.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("{}: {e}", path.display()))
        })?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader,
            writer,
            decoder: LineDecoder::new(MAX_FRAME_SIZE),
            buf: vec![0u8; READ_BUFFER_SIZE],
        })
    }

    /// Send one envelope
    ///
    /// # Errors
    ///
    /// Fails if the envelope cannot be encoded or the write fails.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let line = encode_line(envelope, MAX_FRAME_SIZE)?;
        self.send_raw(&line).await
    }

    /// Write raw bytes to the socket
    ///
    /// # Errors
    ///
    /// Fails if the write fails.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next envelope
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionClosed` on EOF and a frame error if
    /// the daemon sends something undecodable.
    pub async fn recv(&mut self) -> Result<Envelope, TransportError> {
        loop {
            if let Some(envelope) = self.decoder.decode::<Envelope>()? {
                return Ok(envelope);
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            self.decoder.push(&self.buf[..n]);
        }
    }

    /// Receive the next envelope, giving up after `timeout`
    ///
    /// # Errors
    ///
    /// As [`recv`](Self::recv), plus `TransportError::Timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Envelope, TransportError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| TransportError::Timeout(format!("no message within {timeout:?}")))?
    }

    /// Send a request and wait for the first reply carrying its request id
    ///
    /// Heartbeats and replies to other requests are skipped.
    ///
    /// # Errors
    ///
    /// As [`recv_timeout`](Self::recv_timeout).
    pub async fn request(
        &mut self,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        self.send(envelope).await?;

        let wait = async {
            loop {
                let reply = self.recv().await?;
                if reply.kind == MessageType::Heartbeat {
                    continue;
                }
                if reply.request_id == envelope.request_id {
                    return Ok(reply);
                }
                tracing::debug!(
                    kind = %reply.kind,
                    request_id = %reply.request_id,
                    "Skipping unrelated message"
                );
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::Timeout(format!("no reply within {timeout:?}")))?
    }
}
