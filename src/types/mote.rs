//! Wireless motes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::standard::{SystemState, UNSET_ADDRESS};
use crate::types::register::{Parameter, Register};
use crate::types::value::Value;

/// Gets the current Unix timestamp in seconds.
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// A panStamp end-device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mote {
    /// Device address, unique within a network.
    pub address: u8,
    /// Manufacturer id (first half of the product code).
    pub manufacturer_id: u32,
    /// Product id (second half of the product code).
    pub product_id: u32,
    /// Product name from the device definition.
    #[serde(default)]
    pub name: String,
    /// Power-down mote, reachable for commands only while in sync mode.
    #[serde(default)]
    pub pwr_down_mode: bool,
    /// Last reported system state.
    #[serde(default)]
    pub state: SystemState,
    /// Security option.
    #[serde(default)]
    pub security: u8,
    /// Security nonce, sent back with every command.
    #[serde(default)]
    pub nonce: u8,
    /// Periodic transmission interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_interval: Option<u64>,
    /// Unix time of the last status received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
    /// Endpoint registers.
    #[serde(default)]
    pub regular_registers: Vec<Register>,
    /// Configuration registers.
    #[serde(default)]
    pub config_registers: Vec<Register>,
}

impl Mote {
    /// Creates a mote without registers.
    #[must_use]
    pub fn new(address: u8, manufacturer_id: u32, product_id: u32) -> Self {
        Self {
            address,
            manufacturer_id,
            product_id,
            name: String::new(),
            pwr_down_mode: false,
            state: SystemState::RxOn,
            security: 0,
            nonce: 0,
            tx_interval: None,
            last_seen: None,
            regular_registers: Vec::new(),
            config_registers: Vec::new(),
        }
    }

    /// Splits an 8-byte product code into manufacturer and product ids.
    ///
    /// Missing bytes read as zero.
    #[must_use]
    pub fn split_product_code(code: &Value) -> (u32, u32) {
        let mut bytes = [0u8; 8];
        for (dst, src) in bytes.iter_mut().zip(code.as_bytes()) {
            *dst = *src;
        }
        (
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        )
    }

    /// True if the mote still waits for an address.
    #[must_use]
    pub const fn is_unconfigured(&self) -> bool {
        self.address == UNSET_ADDRESS
    }

    /// Looks up a register, regular registers first.
    #[must_use]
    pub fn register(&self, id: u8) -> Option<&Register> {
        self.regular_registers
            .iter()
            .chain(&self.config_registers)
            .find(|r| r.id == id)
    }

    /// Looks up a register for update, regular registers first.
    pub fn register_mut(&mut self, id: u8) -> Option<&mut Register> {
        self.regular_registers
            .iter_mut()
            .chain(&mut self.config_registers)
            .find(|r| r.id == id)
    }

    /// Every endpoint of the regular registers.
    pub fn endpoints(&self) -> impl Iterator<Item = &Parameter> {
        self.regular_registers
            .iter()
            .flat_map(Register::parameters)
    }

    /// Every configuration parameter.
    pub fn config_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.config_registers.iter().flat_map(Register::parameters)
    }

    /// Records that the mote was just heard from.
    pub fn touch(&mut self) {
        self.last_seen = Some(current_timestamp());
    }
}
