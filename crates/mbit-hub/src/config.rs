//! Hub configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes.

use std::path::Path;

use mbit_sim::{DeviceConfig, RadioDomainConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How simulated time moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimeMode {
    /// Time moves only when a session's program sleeps or advances it
    #[default]
    Virtual,
    /// A shared wall-clock ticker advances every device by the same amount
    RealTime {
        /// Tick period in milliseconds
        tick_millis: u64,
    },
}

/// Per-session limits and behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Outbound write buffer in bytes
    pub outbound_buffer: usize,
    /// Capacity of the input injection mailbox
    pub input_buffer: usize,
    /// Requests held back while the device sleeps
    pub max_pending_requests: usize,
    /// Push `StateChanged` events to the client on lifecycle transitions
    pub client_state_events: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 8 * 1024,
            input_buffer: 64,
            max_pending_requests: 64,
            client_state_events: true,
        }
    }
}

/// Top-level hub configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// TCP address the daemon listens on
    pub bind_addr: String,
    /// Time source for device clocks
    pub time_mode: TimeMode,
    /// Session limits
    pub session: SessionConfig,
    /// Radio medium behavior
    pub radio: RadioDomainConfig,
    /// Device power-on defaults
    pub device: DeviceConfig,
    /// Capacity of the observer event channel
    pub event_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7979".to_string(),
            time_mode: TimeMode::Virtual,
            session: SessionConfig::default(),
            radio: RadioDomainConfig::default(),
            device: DeviceConfig::default(),
            event_buffer: 1024,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl HubConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the hub cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let TimeMode::RealTime { tick_millis: 0 } = self.time_mode {
            return Err(ConfigError::Invalid("tick_millis must be positive".into()));
        }
        if self.session.input_buffer == 0 {
            return Err(ConfigError::Invalid("input_buffer must be positive".into()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be positive".into()));
        }
        if self.radio.notify_buffer == 0 {
            return Err(ConfigError::Invalid("notify_buffer must be positive".into()));
        }
        Ok(())
    }
}
