//! Error types for the SWAP gateway library.

use thiserror::Error;

/// The main error type for SWAP operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial port could not be opened.
    #[error("serial port {port} unavailable: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// The link was stopped or never opened.
    #[error("serial port closed")]
    PortClosed,

    /// I/O failure on the link. Fatal to the connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Frame or packet decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A value does not fit the width of the modem field it targets.
    #[error("{field} value 0x{value:X} exceeds {width} byte(s)")]
    InvalidFieldWidth {
        field: &'static str,
        value: u32,
        width: usize,
    },

    /// The modem answered an AT command with something other than `OK`.
    #[error("modem rejected {command:?}: {response:?}")]
    AtRejected { command: String, response: String },

    /// Timed out waiting for the modem.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The modem startup handshake failed.
    #[error("modem initialization failed: {reason}")]
    ModemInitFailed { reason: String },

    /// The modem could not be brought in line with the network configuration.
    #[error("unable to set modem {field}: {source}")]
    ConfigSyncFailed {
        field: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A command was never acknowledged by the mote.
    #[error("no acknowledgement after {attempts} attempt(s)")]
    NoAcknowledgement { attempts: u32 },

    /// A query was never answered by the mote.
    #[error("no response after {attempts} attempt(s)")]
    NoResponse { attempts: u32 },

    /// No mote with this address is known.
    #[error("unknown mote at address {address}")]
    UnknownMote { address: u8 },

    /// The mote has no register with this id.
    #[error("mote {address} has no register {register}")]
    UnknownRegister { address: u8, register: u8 },

    /// The register has no parameter with this name.
    #[error("register {register} has no parameter {name:?}")]
    UnknownParameter { register: u8, name: String },

    /// A value could not be parsed or does not fit its destination.
    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },

    /// The server is not running.
    #[error("server not running")]
    NotRunning,

    /// Reading or writing a JSON file failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] serde_json::Error),

    /// Internal channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

/// Framing and decoding errors. These never stop the server: the offending
/// frame is dropped.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Radio frame text is not `(RRLL)` followed by hex pairs.
    #[error("malformed radio frame: {reason}")]
    Malformed { reason: String },

    /// Not enough bytes for a SWAP packet.
    #[error("packet too short: need at least {needed} bytes, got {got}")]
    PacketTooShort { needed: usize, got: usize },

    /// Payload contains non-hex characters.
    #[error("invalid hex payload: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Result type alias for SWAP operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
