//! Line Framing
//!
//! Wire format for daemon-client messages: one UTF-8 JSON document per line.
//!
//! # Frame Format
//!
//! ```text
//! {"type":"chat","request_id":"r1","payload":{...},"timestamp":1700000000000}\n
//! {"type":"status","request_id":"r2","timestamp":1700000000001}\n
//! ```
//!
//! # Limits
//!
//! - A single line may not exceed `max_line` bytes (default 1 MiB)
//! - An oversized line is reported once and then skipped up to the next newline
//! - Blank lines are ignored
//!
//! Decode errors never poison the decoder: the offending line is consumed and
//! the next call continues with the following frame.

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Maximum line size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Encode a message as a single newline-terminated JSON line
///
/// # Errors
///
/// Returns `TransportError::Serialization` if JSON serialization fails and
/// `TransportError::FrameTooLarge` if the encoded line exceeds `max_line`.
pub fn encode_line<T: Serialize>(msg: &T, max_line: usize) -> Result<Vec<u8>, TransportError> {
    let mut json = serde_json::to_vec(msg)?;

    if json.len() > max_line {
        return Err(TransportError::FrameTooLarge {
            size: json.len(),
            max: max_line,
        });
    }

    json.push(b'\n');
    Ok(json)
}

/// Incremental newline-delimited JSON decoder
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    max_line: usize,
    /// Skipping the remainder of an oversized line
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl LineDecoder {
    /// Create a decoder that rejects lines longer than `max_line` bytes
    #[must_use]
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_line,
            discarding: false,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next line
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete line was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(TransportError::FrameTooLarge)` once per oversized line
    /// - `Err(TransportError::Malformed)` if the line is not valid JSON for `T`
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            let newline = pending.iter().position(|&b| b == b'\n');

            if self.discarding {
                match newline {
                    Some(pos) => {
                        self.read_pos += pos + 1;
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.clear();
                        self.discarding = true;
                        return Ok(None);
                    }
                }
            }

            let Some(pos) = newline else {
                let waiting = pending.len();
                if waiting > self.max_line {
                    self.clear();
                    self.discarding = true;
                    return Err(TransportError::FrameTooLarge {
                        size: waiting,
                        max: self.max_line,
                    });
                }
                return Ok(None);
            };

            let start = self.read_pos;
            self.read_pos += pos + 1;

            let mut line = &self.buffer[start..start + pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if line.len() > self.max_line {
                return Err(TransportError::FrameTooLarge {
                    size: line.len(),
                    max: self.max_line,
                });
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return serde_json::from_slice(line)
                .map(Some)
                .map_err(|e| TransportError::Malformed(e.to_string()));
        }
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.discarding = false;
    }
}
