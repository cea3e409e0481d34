//! Transport abstraction.
//!
//! Two layers:
//! - [`Transport`]: any byte-oriented channel (TCP socket, WebSocket
//!   binary stream, test pipe). The I/O task is generic over it.
//! - [`MessageSink`]: where the session hands each finished envelope, and
//!   which decides when the envelope under construction is full
//!   (should-end-message). [`FramedSink`] bridges the two by encoding
//!   envelopes into length-prefixed frames.

use std::sync::Mutex;

use crate::error::Result;

use super::codec::{Codec, CodecKind, DEFAULT_MAX_FRAME_SIZE, encode_frame};
use super::guard::lock;
use super::value::Value;

/// Byte-oriented transport channel.
pub trait Transport: Send {
    /// Error type for this transport.
    type Error: core::fmt::Debug;

    /// Read up to `buf.len()` bytes into `buf`.
    /// Returns the number of bytes actually read.
    /// Returns 0 if no data is available (non-blocking).
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error>;

    /// Write `data` to the transport.
    /// Returns the number of bytes actually written.
    fn write(&mut self, data: &[u8]) -> core::result::Result<usize, Self::Error>;

    /// Flush any buffered output.
    fn flush(&mut self) -> core::result::Result<(), Self::Error>;

    /// `false` once the peer has gone away.
    fn is_connected(&self) -> bool;
}

/// A null transport that discards all writes and never reads.
pub struct NullTransport;

impl Transport for NullTransport {
    type Error = ();

    fn read(&mut self, _buf: &mut [u8]) -> core::result::Result<usize, ()> {
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> core::result::Result<usize, ()> {
        Ok(data.len())
    }

    fn flush(&mut self) -> core::result::Result<(), ()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

// ── Message layer ────────────────────────────────────────────

/// Size/frame-count limits for one outbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageBudget {
    pub max_bytes: usize,
    pub max_frames: usize,
}

impl Default for MessageBudget {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024,
            max_frames: 64,
        }
    }
}

impl MessageBudget {
    pub fn should_end(&self, bytes: usize, frames: usize) -> bool {
        bytes >= self.max_bytes || frames >= self.max_frames
    }
}

/// Destination for finished envelopes.
pub trait MessageSink: Send + Sync {
    /// Backpressure poll: is an envelope holding `bytes` in `frames`
    /// complete frames full?
    fn should_end_message(&self, bytes: usize, frames: usize) -> bool;

    /// Send one envelope. A sink that cannot carry it reports
    /// [`TransportError::FrameTooLarge`](crate::error::TransportError)
    /// and leaves the message with the caller.
    fn send(&self, message: &Value) -> Result<()>;
}

/// Encodes envelopes with a [`Codec`] and the length-prefix framing,
/// buffering the bytes until the writer collects them.
pub struct FramedSink {
    codec: Box<dyn Codec>,
    budget: MessageBudget,
    max_frame_size: usize,
    out: Mutex<Vec<u8>>,
}

impl FramedSink {
    pub fn new(kind: CodecKind, budget: MessageBudget, max_frame_size: usize) -> Self {
        Self {
            codec: kind.codec(),
            budget,
            max_frame_size,
            out: Mutex::new(Vec::new()),
        }
    }

    /// Take every byte encoded since the last call.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.out))
    }

    pub fn has_output(&self) -> bool {
        !lock(&self.out).is_empty()
    }
}

impl Default for FramedSink {
    fn default() -> Self {
        Self::new(CodecKind::Json, MessageBudget::default(), DEFAULT_MAX_FRAME_SIZE)
    }
}

impl MessageSink for FramedSink {
    fn should_end_message(&self, bytes: usize, frames: usize) -> bool {
        self.budget.should_end(bytes, frames)
    }

    fn send(&self, message: &Value) -> Result<()> {
        let payload = self.codec.encode(message)?;
        let mut out = lock(&self.out);
        encode_frame(&payload, self.max_frame_size, &mut out)
    }
}
