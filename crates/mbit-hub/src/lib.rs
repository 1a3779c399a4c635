//! micro:bit Simulator Hub
//!
//! This crate hosts simulated devices for remote user programs. Each client
//! connection becomes a session that owns exactly one device.
//!
//! # Architecture
//!
//! - **SessionManager**: accepts connections, assigns session and device ids,
//!   routes physical inputs and tears sessions down
//! - **Session task**: one tokio task per connection that decodes requests,
//!   dispatches them to its device and writes responses and events back
//! - **RadioDomain**: shared by all sessions, so packets cross session
//!   boundaries only through the broadcast medium
//! - **SimEvent**: unified observer stream for renderers and loggers
//!
//! Time is virtual by default: a `Sleep` completes as soon as the device's
//! clock has been advanced. With [`TimeMode::RealTime`] a ticker advances
//! every clock and sleeping sessions hold their requests until woken.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mbit_hub::{DeviceClient, HubConfig, SessionManager};
//! use mbit_sim::RadioDomain;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HubConfig::default();
//! let domain = Arc::new(RadioDomain::new(config.radio.clone()));
//! let hub = SessionManager::new(config, domain);
//!
//! let (client_side, server_side) = tokio::io::duplex(4096);
//! hub.accept(server_side, None)?;
//!
//! let mut client = DeviceClient::connect(client_side).await?;
//! client.sleep(100).await?;
//! assert_eq!(client.running_time().await?, 100_000);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
mod session;

pub use client::{DeviceClient, ReceivedPacket};
pub use config::{ConfigError, HubConfig, SessionConfig, TimeMode};
pub use error::{ClientError, HubError};
pub use events::{CloseReason, InputEvent, SessionId, SessionInfo, SessionStats, SimEvent};
pub use manager::SessionManager;
