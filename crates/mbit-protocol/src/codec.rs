//! Streaming frame codec
//!
//! Transports deliver bytes in arbitrary chunks. [`FrameCodec`] buffers
//! them and yields one decoded envelope per complete frame. A frame that
//! fails to decode is still consumed by its declared length, so a single bad
//! frame never desynchronizes the stream.

use tracing::trace;

use crate::error::DecodeError;
use crate::message::Envelope;
use crate::wire::{self, HEADER_LEN, PAYLOAD_LEN_OFFSET};

/// Streaming envelope decoder
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: Vec<u8>,
}

impl FrameCodec {
    /// Create a new codec with an empty buffer
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Push raw bytes into the codec's buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next complete frame
    ///
    /// Returns `None` until a whole frame is buffered.
    pub fn next_frame(&mut self) -> Option<Result<Envelope, DecodeError>> {
        let frame_len = self.pending_frame_len()?;
        let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();
        trace!("frame codec extracted {} byte frame", frame_len);
        Some(wire::decode(&frame))
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the internal buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn pending_frame_len(&self) -> Option<usize> {
        if self.buffer.len() < HEADER_LEN {
            return None;
        }
        let len_bytes = [
            self.buffer[PAYLOAD_LEN_OFFSET],
            self.buffer[PAYLOAD_LEN_OFFSET + 1],
        ];
        let frame_len = HEADER_LEN + u16::from_be_bytes(len_bytes) as usize;
        (self.buffer.len() >= frame_len).then_some(frame_len)
    }
}
