//! Protocol definitions for SWAP communication.
//!
//! This module contains the low-level protocol types including:
//! - Line framing of the modem's serial dialect
//! - Raw radio frames with their link quality prefix
//! - SWAP packet encoding/decoding
//! - Protocol-reserved addresses, register ids and states

pub mod ccpacket;
pub mod frame;
pub mod packet;
pub mod standard;

pub use ccpacket::CcPacket;
pub use frame::{COMMAND_ESCAPE, FRAME_END, FRAME_START, LineDecoder, encode as encode_frame};
pub use packet::{Function, HEADER_LEN, SwapPacket};
pub use standard::{BROADCAST_ADDRESS, SystemState, UNSET_ADDRESS, register_id};
