//! Observer event stream
//!
//! Everything an external renderer or logger needs to follow the hub is
//! published on one broadcast channel: session lifecycle, device state
//! changes and radio traffic.

use std::fmt;

use mbit_protocol::{Button, DeviceId, DeviceSnapshot, Gesture};
use mbit_sim::BucketKey;
use serde::{Deserialize, Serialize};

/// Handle for a connected session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Registry entry describing a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session: SessionId,
    pub device: DeviceId,
    /// Remote address, when the transport has one
    pub peer: Option<String>,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The client closed its end
    CleanDisconnect,
    /// Reading or writing the transport failed
    TransportFailure(String),
    /// Ended through [`SessionManager::terminate`](crate::SessionManager::terminate)
    Terminated,
    /// The hub shut down
    Shutdown,
}

/// Counters kept for the lifetime of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Requests dispatched to the device
    pub requests: u64,
    /// Frames that failed to decode
    pub decode_failures: u64,
    /// Sequence, addressing or kind violations
    pub protocol_errors: u64,
}

/// Physical input applied to a device from outside its program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    ButtonPress(Button),
    ButtonRelease(Button),
    /// Acceleration in milli-g
    Accelerometer { x: i16, y: i16, z: i16 },
    Gesture(Gesture),
    LightLevel(u8),
    Temperature(i16),
    /// Press the reset button
    Reset,
}

/// Unified event enum for all hub activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimEvent {
    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------
    /// A client connected and its device was created
    SessionOpened { info: SessionInfo },

    /// A session ended and its device was torn down
    SessionClosed {
        session: SessionId,
        device: DeviceId,
        reason: CloseReason,
        stats: SessionStats,
    },

    // -------------------------------------------------------------------------
    // Device state
    // -------------------------------------------------------------------------
    /// Observable device state changed
    StateChanged {
        session: SessionId,
        device: DeviceId,
        snapshot: DeviceSnapshot,
    },

    // -------------------------------------------------------------------------
    // Traffic
    // -------------------------------------------------------------------------
    /// A device broadcast a radio packet
    RadioTraffic {
        from: DeviceId,
        key: BucketKey,
        length: usize,
        delivered: usize,
        dropped: usize,
    },

    /// A client sent a frame that could not be decoded
    DecodeFailure {
        session: SessionId,
        message: String,
    },

    /// Something went wrong that did not end a session
    Error { source: String, message: String },
}

impl SimEvent {
    /// Check if this is a session lifecycle event
    pub fn is_session_lifecycle(&self) -> bool {
        matches!(
            self,
            SimEvent::SessionOpened { .. } | SimEvent::SessionClosed { .. }
        )
    }

    /// Session the event belongs to, if any
    pub fn session(&self) -> Option<SessionId> {
        match self {
            SimEvent::SessionOpened { info } => Some(info.session),
            SimEvent::SessionClosed { session, .. }
            | SimEvent::StateChanged { session, .. }
            | SimEvent::DecodeFailure { session, .. } => Some(*session),
            SimEvent::RadioTraffic { .. } | SimEvent::Error { .. } => None,
        }
    }

    /// Device the event concerns, if any
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            SimEvent::SessionOpened { info } => Some(info.device),
            SimEvent::SessionClosed { device, .. } | SimEvent::StateChanged { device, .. } => {
                Some(*device)
            }
            SimEvent::RadioTraffic { from, .. } => Some(*from),
            SimEvent::DecodeFailure { .. } | SimEvent::Error { .. } => None,
        }
    }
}
