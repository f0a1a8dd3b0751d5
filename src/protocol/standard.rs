//! Protocol-reserved addresses, register ids and system states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broadcast destination address.
pub const BROADCAST_ADDRESS: u8 = 0x00;

/// Address of a mote that has not been configured yet.
pub const UNSET_ADDRESS: u8 = 0xFF;

/// Standard register ids shared by every mote.
pub mod register_id {
    /// Manufacturer and product id, 8 bytes.
    pub const PRODUCT_CODE: u8 = 0;
    /// Hardware version.
    pub const HW_VERSION: u8 = 1;
    /// Firmware version.
    pub const FW_VERSION: u8 = 2;
    /// System state, see [`SystemState`](super::SystemState).
    pub const SYSTEM_STATE: u8 = 3;
    /// Frequency channel, 1 byte.
    pub const FREQ_CHANNEL: u8 = 4;
    /// Security option, 1 byte.
    pub const SECU_OPTION: u8 = 5;
    /// Security password.
    pub const SECU_PASSWD: u8 = 6;
    /// Security nonce.
    pub const SECU_NONCE: u8 = 7;
    /// Network id (radio sync word), 2 bytes.
    pub const NETWORK_ID: u8 = 8;
    /// Device address, 1 byte.
    pub const DEVICE_ADDR: u8 = 9;
    /// Periodic transmission interval in seconds, 2 bytes.
    pub const TX_INTERVAL: u8 = 10;

    /// Returns true for ids 0 to 10.
    #[must_use]
    pub const fn is_standard(id: u8) -> bool {
        id <= TX_INTERVAL
    }
}

/// Mote system state, reported through the system state register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum SystemState {
    /// Restarting.
    Restart,
    /// Running with the receiver on.
    #[default]
    RxOn,
    /// Running with the receiver off (power-down between transmissions).
    RxOff,
    /// Always listening, waiting to be configured.
    Sync,
    /// Battery low.
    LowBattery,
    /// Any value this library does not know.
    Other(u8),
}

impl From<u8> for SystemState {
    fn from(byte: u8) -> Self {
        match byte {
            0 => Self::Restart,
            1 => Self::RxOn,
            2 => Self::RxOff,
            3 => Self::Sync,
            4 => Self::LowBattery,
            other => Self::Other(other),
        }
    }
}

impl From<SystemState> for u8 {
    fn from(state: SystemState) -> Self {
        match state {
            SystemState::Restart => 0,
            SystemState::RxOn => 1,
            SystemState::RxOff => 2,
            SystemState::Sync => 3,
            SystemState::LowBattery => 4,
            SystemState::Other(other) => other,
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restart => f.write_str("restarting"),
            Self::RxOn => f.write_str("running"),
            Self::RxOff => f.write_str("power-down"),
            Self::Sync => f.write_str("synchronization mode"),
            Self::LowBattery => f.write_str("low battery"),
            Self::Other(state) => write!(f, "state {state}"),
        }
    }
}
