//! Error types for the hub

use mbit_protocol::{DecodeError, DeviceId, EncodeError, ErrorCode};
use thiserror::Error;

use crate::events::SessionId;

/// Errors returned by the session manager
#[derive(Debug, Error)]
pub enum HubError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("no session owns device {0}")]
    DeviceNotFound(DeviceId),

    #[error("hub is shut down")]
    ShutDown,
}

/// Errors returned by [`DeviceClient`](crate::DeviceClient)
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// The device answered with an error response
    #[error("{code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("unexpected response to {request}: {response}")]
    UnexpectedResponse { request: &'static str, response: String },

    #[error("response sequence {actual} does not match request {expected}")]
    SequenceMismatch { expected: u64, actual: u64 },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed")]
    Closed,
}

impl ClientError {
    /// Error code of a remote error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}
