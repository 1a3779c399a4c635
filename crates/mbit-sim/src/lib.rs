//! micro:bit Simulation Library
//!
//! This crate holds the simulated hardware behind a session:
//!
//! - **VirtualClock**: per-device simulated time with ordered wake requests
//! - **Device**: peripheral state and the Running/Sleeping/Panicked/Reset lifecycle
//! - **RadioDomain**: the shared broadcast medium devices talk through
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mbit_protocol::{DeviceId, RadioSettings};
//! use mbit_sim::{Device, DeviceConfig, RadioDomain, RadioDomainConfig};
//!
//! let domain = Arc::new(RadioDomain::new(RadioDomainConfig::default()));
//! let mut a = Device::new(DeviceId(1), DeviceConfig::default(), domain.clone(), None);
//! let mut b = Device::new(DeviceId(2), DeviceConfig::default(), domain.clone(), None);
//! a.finish_reset();
//! b.finish_reset();
//!
//! a.configure_radio(RadioSettings::default()).unwrap();
//! b.configure_radio(RadioSettings::default()).unwrap();
//! a.radio_send(b"hi").unwrap();
//!
//! let packet = b.radio_receive().unwrap().unwrap();
//! assert_eq!(packet.payload, b"hi");
//! ```

pub mod clock;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod radio;

pub use clock::{VirtualClock, WakeToken};
pub use device::{AccelerometerReading, ButtonReading, Device, DeviceConfig};
pub use error::{DeviceError, RadioError};
pub use lifecycle::Lifecycle;
pub use radio::{
    BucketKey, OverflowPolicy, Packet, RadioDomain, RadioDomainConfig, RadioNotice, RadioNotifier,
    ReconfigurePolicy, RssiModel, SendReport,
};
