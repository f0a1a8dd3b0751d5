//! Raw CC11xx radio frames as exchanged with the modem.
//!
//! Received frames carry the link quality prefix:
//! ```text
//! ( RR LL ) DD DD DD ...
//!   │  │    └─ payload, two hex digits per byte
//!   │  └─ LQI
//!   └─ RSSI
//! ```
//! Frames sent by the gateway are the bare hex payload.

use std::fmt;
use std::str::FromStr;

use crate::error::FrameError;

/// A raw radio frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CcPacket {
    /// Protocol payload.
    pub data: Vec<u8>,
    /// Received signal strength.
    pub rssi: u8,
    /// Link quality indicator.
    pub lqi: u8,
}

impl CcPacket {
    /// Creates an outgoing frame. RSSI and LQI are zero.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            rssi: 0,
            lqi: 0,
        }
    }

    /// Parses a received frame (`(RRLL)` prefix followed by hex pairs).
    ///
    /// Fails with [`FrameError::Malformed`] when the prefix is missing or
    /// unclosed, so `"(00000102A53C"` is malformed rather than short.
    /// Payload length is checked by [`SwapPacket::decode`](crate::SwapPacket::decode),
    /// which reports [`FrameError::PacketTooShort`].
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let bytes = line.as_bytes();
        if bytes.len() < 6 || bytes[0] != b'(' || bytes[5] != b')' {
            return Err(FrameError::Malformed {
                reason: format!("missing (RSSI,LQI) prefix in {line:?}"),
            });
        }
        let payload = &line[6..];
        if payload.len() % 2 != 0 {
            return Err(FrameError::Malformed {
                reason: format!("odd number of hex digits in {line:?}"),
            });
        }

        let mut quality = [0u8; 2];
        hex::decode_to_slice(&line[1..5], &mut quality)?;
        let data = hex::decode(payload)?;

        Ok(Self {
            data,
            rssi: quality[0],
            lqi: quality[1],
        })
    }

    /// Returns the payload as uppercase hex, the form written to the modem.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.data)
    }

    /// Returns the frame as received on the wire, quality prefix included.
    #[must_use]
    pub fn to_wire(&self) -> String {
        format!("({:02X}{:02X}){}", self.rssi, self.lqi, self.to_hex())
    }
}

impl FromStr for CcPacket {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CcPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
