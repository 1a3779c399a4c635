//! micro:bit Simulator Protocol Library
//!
//! This crate defines the message contract between a client hosting a user
//! program and the server that owns the simulated device:
//!
//! - **Message model**: requests, responses and unsolicited events wrapped in
//!   a sequence-numbered [`Envelope`]
//! - **Wire format**: a versioned, big-endian, length-delimited binary frame
//! - **Streaming codec**: [`FrameCodec`] reassembles frames from a byte stream
//!
//! Decoding only validates structure. Range checks on peripheral values are
//! left to the device so errors can be attributed to the failing operation.
//!
//! # Example
//!
//! ```rust
//! use mbit_protocol::{decode, encode, DeviceId, Envelope, Request};
//!
//! let env = Envelope::request(DeviceId(1), 1, Request::Sleep { millis: 100 });
//! let bytes = encode(&env).unwrap();
//! assert_eq!(decode(&bytes).unwrap(), env);
//! ```

pub mod codec;
pub mod error;
pub mod message;
pub mod wire;

pub use codec::FrameCodec;
pub use error::{DecodeError, EncodeError};
pub use message::{
    Button, DeviceId, DeviceSnapshot, Envelope, ErrorCode, Event, Gesture, Grid, LifecycleKind,
    MessageBody, MessageKind, RadioSettings, Request, Response, DISPLAY_SIZE, MAX_BRIGHTNESS,
};
pub use wire::{decode, encode, HEADER_LEN, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
