//! Length-prefix frame codec and message codecs.
//!
//! Wire format of one transport message:
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ Length (4B)│ encoded envelope (N B)       │
//! │ LE u32     │ JSON or postcard             │
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! The decoder accumulates incoming bytes and yields complete payloads.
//! This handles partial reads gracefully — a single `Transport::read`
//! call may return part of the header, part of the payload, or several
//! frames concatenated.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TransportError};

use super::value::Value;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size (4-byte little-endian length).
const HEADER_SIZE: usize = 4;

/// Decoder state machine.
enum DecoderState {
    /// Waiting for header bytes.
    ReadingHeader { collected: usize },
    /// Header received, reading payload.
    ReadingPayload { expected: usize },
}

/// Streaming frame decoder.
pub struct FrameDecoder {
    state: DecoderState,
    header_buf: [u8; HEADER_SIZE],
    payload: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: DecoderState::ReadingHeader { collected: 0 },
            header_buf: [0; HEADER_SIZE],
            payload: Vec::new(),
            max_frame_size,
        }
    }

    /// Feed bytes into the decoder, returning every payload completed by
    /// them in arrival order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match &mut self.state {
                DecoderState::ReadingHeader { collected } => {
                    let to_copy = (HEADER_SIZE - *collected).min(data.len() - offset);
                    self.header_buf[*collected..*collected + to_copy]
                        .copy_from_slice(&data[offset..offset + to_copy]);
                    *collected += to_copy;
                    offset += to_copy;

                    if *collected == HEADER_SIZE {
                        let expected = u32::from_le_bytes(self.header_buf) as usize;
                        if expected == 0 || expected > self.max_frame_size {
                            // Invalid frame — reset.
                            log::warn!("codec: dropping frame header with length {expected}");
                            self.state = DecoderState::ReadingHeader { collected: 0 };
                            continue;
                        }
                        self.payload.clear();
                        self.payload.reserve(expected);
                        self.state = DecoderState::ReadingPayload { expected };
                    }
                }

                DecoderState::ReadingPayload { expected } => {
                    let needed = *expected - self.payload.len();
                    let to_copy = needed.min(data.len() - offset);
                    self.payload
                        .extend_from_slice(&data[offset..offset + to_copy]);
                    offset += to_copy;

                    if self.payload.len() == *expected {
                        self.state = DecoderState::ReadingHeader { collected: 0 };
                        frames.push(core::mem::take(&mut self.payload));
                    }
                }
            }
        }

        frames
    }

    /// Reset decoder state (e.g. after a transport reconnect).
    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingHeader { collected: 0 };
        self.payload.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Encode a payload into a length-prefixed frame, appending to `out`.
pub fn encode_frame(payload: &[u8], max_frame_size: usize, out: &mut Vec<u8>) -> Result<()> {
    if payload.is_empty() || payload.len() > max_frame_size {
        return Err(TransportError::FrameTooLarge(payload.len()).into());
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::from(TransportError::FrameTooLarge(payload.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

// ── Message codecs ───────────────────────────────────────────

/// Turns envelopes into payload bytes and back.
pub trait Codec: Send + Sync {
    fn encode(&self, message: &Value) -> Result<Vec<u8>>;
    fn decode(&self, payload: &[u8]) -> Result<Value>;
}

/// Text codec (`serde_json`).
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Compact binary codec (`postcard`).
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    fn encode(&self, message: &Value) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(message)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        Ok(postcard::from_bytes(payload)?)
    }
}

/// Codec selection, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Json,
    Postcard,
}

impl CodecKind {
    pub fn codec(self) -> Box<dyn Codec> {
        match self {
            Self::Json => Box::new(JsonCodec),
            Self::Postcard => Box::new(PostcardCodec),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
