//! Error types for the simulation layer

use mbit_protocol::{DeviceId, ErrorCode, LifecycleKind};
use thiserror::Error;

/// Failure of a device operation
///
/// A failed operation never mutates device state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{operation} not allowed while {state:?}")]
    InvalidState {
        state: LifecycleKind,
        operation: &'static str,
    },

    #[error("invalid value: {0}")]
    Validation(String),
}

impl DeviceError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        DeviceError::Validation(message.into())
    }

    /// Error category reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            DeviceError::InvalidState { .. } => ErrorCode::InvalidState,
            DeviceError::Validation(_) => ErrorCode::Validation,
        }
    }
}

/// Failure of a radio domain operation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("{0} is not registered with the radio domain")]
    NotRegistered(DeviceId),
}
