//! Gateway configuration.
//!
//! Configuration is passed explicitly to the server. [`Settings`] is the
//! JSON file form:
//! ```json
//! {
//!   "serial": { "port": "/dev/ttyUSB0", "baud_rate": 38400 },
//!   "network": { "device_address": 1, "network_id": 46406, "frequency_channel": 0 },
//!   "ack_timeout": 2000,
//!   "max_tries": 3,
//!   "network_file": "network.json",
//!   "devices_file": "devices.json"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transport::SerialConfig;
use crate::transport::serial::millis;

/// Default wait for an acknowledgement or query response, per attempt.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default number of attempts for commands and queries.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Desired radio settings of the gateway. `None` leaves the modem's
/// current value alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Gateway address.
    pub device_address: Option<u8>,
    /// Network id, used as the radio sync word.
    pub network_id: Option<u16>,
    /// Radio frequency channel.
    pub frequency_channel: Option<u8>,
}

impl NetworkConfig {
    /// Sets the gateway address.
    #[must_use]
    pub const fn device_address(mut self, address: u8) -> Self {
        self.device_address = Some(address);
        self
    }

    /// Sets the network id.
    #[must_use]
    pub const fn network_id(mut self, id: u16) -> Self {
        self.network_id = Some(id);
        self
    }

    /// Sets the frequency channel.
    #[must_use]
    pub const fn frequency_channel(mut self, channel: u8) -> Self {
        self.frequency_channel = Some(channel);
        self
    }
}

/// Configuration of a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serial link to the modem.
    pub serial: SerialConfig,
    /// Desired gateway radio settings.
    pub network: NetworkConfig,
    /// Wait for an acknowledgement or response, per attempt.
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    /// Attempts for commands and queries.
    pub max_tries: u32,
    /// File the known motes are persisted to.
    pub network_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SerialConfig::default())
    }
}

impl ServerConfig {
    /// Creates a configuration with default protocol settings.
    #[must_use]
    pub fn new(serial: SerialConfig) -> Self {
        Self {
            serial,
            network: NetworkConfig::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_tries: DEFAULT_MAX_TRIES,
            network_file: None,
        }
    }

    /// Sets the desired radio settings.
    #[must_use]
    pub const fn network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Sets the acknowledgement timeout.
    #[must_use]
    pub const fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the number of attempts. Zero is treated as one.
    #[must_use]
    pub const fn max_tries(mut self, tries: u32) -> Self {
        self.max_tries = tries;
        self
    }

    /// Sets the network file.
    #[must_use]
    pub fn network_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.network_file = Some(path.into());
        self
    }
}

/// Settings file: server configuration plus the device definition library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server configuration.
    #[serde(flatten)]
    pub server: ServerConfig,
    /// Device definition library file.
    pub devices_file: Option<PathBuf>,
}

impl Settings {
    /// Reads a settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the settings file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
