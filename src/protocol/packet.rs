//! SWAP packets carried inside radio frames.
//!
//! ```text
//! ┌──────┬─────┬─────────┬───────┬──────┬─────────┬───────┬───────────┐
//! │ dest │ src │ hop|sec │ nonce │ func │ regAddr │ regId │ value...  │
//! │  1   │  1  │ 4b | 4b │   1   │  1   │    1    │   1   │ 0..N      │
//! └──────┴─────┴─────────┴───────┴──────┴─────────┴───────┴───────────┘
//! ```
//! The value is absent for queries.

use crate::error::FrameError;
use crate::protocol::ccpacket::CcPacket;
use crate::protocol::standard::BROADCAST_ADDRESS;
use crate::types::Value;

/// Header length in bytes.
pub const HEADER_LEN: usize = 7;

/// SWAP function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Function {
    /// Register value report, also used as acknowledgement.
    Status = 0x00,
    /// Request for a register value.
    Query = 0x01,
    /// Request to change a register value.
    Command = 0x02,
}

impl Function {
    /// Attempts to parse a function code from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Status),
            0x01 => Some(Self::Query),
            0x02 => Some(Self::Command),
            _ => None,
        }
    }
}

impl From<Function> for u8 {
    fn from(function: Function) -> Self {
        function as Self
    }
}

/// A decoded SWAP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPacket {
    /// Destination address, 0 for broadcast.
    pub dest_address: u8,
    /// Source address. Filled in by the modem when sending.
    pub src_address: u8,
    /// Hop count, 4 bits.
    pub hop: u8,
    /// Security option, 4 bits.
    pub security: u8,
    /// Security nonce.
    pub nonce: u8,
    /// Function code.
    pub function: Function,
    /// Address of the mote owning the register.
    pub reg_address: u8,
    /// Register id.
    pub reg_id: u8,
    /// Register value, `None` for queries.
    pub value: Option<Value>,
    /// Signal strength of a received packet.
    pub rssi: u8,
    /// Link quality of a received packet.
    pub lqi: u8,
}

impl SwapPacket {
    fn outgoing(
        dest_address: u8,
        function: Function,
        reg_address: u8,
        reg_id: u8,
        value: Option<Value>,
    ) -> Self {
        Self {
            dest_address,
            src_address: 0,
            hop: 0,
            security: 0,
            nonce: 0,
            function,
            reg_address,
            reg_id,
            value,
            rssi: 0,
            lqi: 0,
        }
    }

    /// Broadcast status report for a register.
    #[must_use]
    pub fn status(reg_address: u8, reg_id: u8, value: Value) -> Self {
        Self::outgoing(
            BROADCAST_ADDRESS,
            Function::Status,
            reg_address,
            reg_id,
            Some(value),
        )
    }

    /// Query addressed to the register owner (broadcast when `reg_address` is 0).
    #[must_use]
    pub fn query(reg_address: u8, reg_id: u8) -> Self {
        Self::outgoing(reg_address, Function::Query, reg_address, reg_id, None)
    }

    /// Command addressed to the register owner.
    #[must_use]
    pub fn command(reg_address: u8, reg_id: u8, value: Value, nonce: u8) -> Self {
        let mut packet = Self::outgoing(
            reg_address,
            Function::Command,
            reg_address,
            reg_id,
            Some(value),
        );
        packet.nonce = nonce;
        packet
    }

    /// Decodes a SWAP packet from a radio frame.
    pub fn decode(frame: &CcPacket) -> Result<Self, FrameError> {
        let data = &frame.data;
        if data.len() < HEADER_LEN {
            return Err(FrameError::PacketTooShort {
                needed: HEADER_LEN,
                got: data.len(),
            });
        }
        let function = Function::from_byte(data[4]).ok_or_else(|| FrameError::Malformed {
            reason: format!("unknown function code 0x{:02X}", data[4]),
        })?;
        let value = if function == Function::Query {
            None
        } else {
            if data.len() < HEADER_LEN + 1 {
                return Err(FrameError::PacketTooShort {
                    needed: HEADER_LEN + 1,
                    got: data.len(),
                });
            }
            Some(Value::from(&data[HEADER_LEN..]))
        };

        Ok(Self {
            dest_address: data[0],
            src_address: data[1],
            hop: (data[2] >> 4) & 0x0F,
            security: data[2] & 0x0F,
            nonce: data[3],
            function,
            reg_address: data[5],
            reg_id: data[6],
            value,
            rssi: frame.rssi,
            lqi: frame.lqi,
        })
    }

    /// Parses a received wire line straight into a SWAP packet.
    pub fn from_wire(line: &str) -> Result<Self, FrameError> {
        Self::decode(&CcPacket::parse(line)?)
    }

    /// Encodes header and value bytes. Queries never carry a value.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let value: &[u8] = match (&self.value, self.function) {
            (Some(value), Function::Status | Function::Command) => value.as_bytes(),
            _ => &[],
        };
        let mut data = Vec::with_capacity(HEADER_LEN + value.len());
        data.extend_from_slice(&[
            self.dest_address,
            self.src_address,
            ((self.hop & 0x0F) << 4) | (self.security & 0x0F),
            self.nonce,
            self.function.into(),
            self.reg_address,
            self.reg_id,
        ]);
        data.extend_from_slice(value);
        data
    }

    /// Wraps the encoded packet in a radio frame.
    #[must_use]
    pub fn to_cc_packet(&self) -> CcPacket {
        CcPacket {
            data: self.encode(),
            rssi: self.rssi,
            lqi: self.lqi,
        }
    }
}
