//! Error types for wire decoding

use thiserror::Error;

/// Errors that can occur while decoding a wire frame
///
/// Decoding only checks framing and structure. Semantically invalid values
/// (brightness above 9, an unknown radio channel, ...) decode fine and are
/// rejected later by the device so the error can be tied to the operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Truncated, oversized or otherwise unparseable frame
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The kind byte or the opcode within a kind is not recognized
    #[error("unknown message kind: kind=0x{kind:02X} opcode=0x{opcode:02X}")]
    UnknownKind { kind: u8, opcode: u8 },

    /// The peer speaks a different protocol version
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u8, actual: u8 },
}

impl DecodeError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEnvelope(msg.into())
    }
}

/// Errors that can occur while encoding a frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A byte string or the whole payload exceeds the u16 length field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}
