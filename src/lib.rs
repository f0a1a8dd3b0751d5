//! # panstamp-swap
//!
//! An async gateway library for panStamp wireless motes speaking SWAP
//! (Simple Wireless Abstract Protocol).
//!
//! A serial modem bridges the host to the radio network. The library runs
//! the modem's AT dialect, decodes the radio frames it forwards and keeps a
//! model of every mote it hears: its product, state, registers and the
//! endpoints and configuration parameters inside them.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Mote discovery driven by device definition files
//! - Acknowledged register commands and queries with retries
//! - Event-driven notification of mote and register changes
//! - Persistent network file
//!
//! ## Quick Start
//!
//! ```no_run
//! use panstamp_swap::{DeviceLibrary, EventDispatcher, Server, ServerConfig, SerialConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), panstamp_swap::Error> {
//!     let config = ServerConfig::new(SerialConfig::new("/dev/ttyUSB0"))
//!         .network_file("network.json");
//!     let library = DeviceLibrary::load("devices.json")?;
//!     let events = EventDispatcher::default();
//!     let mut subscription = events.subscribe();
//!
//!     let server = Server::new(config, library, events)?;
//!     server.start().await?;
//!
//!     while let Some(event) = subscription.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     server.stop().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - Serial link delivering text lines
//! - [`modem`] - AT command dialect and radio frame routing
//! - [`protocol`] - Radio frames and SWAP packets
//! - [`types`] - Values, registers, motes, the network and device definitions
//! - [`event`] - Notification handler and broadcast dispatcher
//! - [`config`] - Server configuration and settings file
//! - [`server`] - The high-level [`Server`]

pub mod config;
pub mod error;
pub mod event;
pub mod modem;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{NetworkConfig, ServerConfig, Settings};
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventDispatcher, EventFilter, EventHandler, EventKind, Subscription};
pub use modem::{Modem, ModemInfo, ModemMode};
pub use protocol::{CcPacket, Function, SwapPacket, SystemState};
pub use server::{Server, ServerState};
pub use transport::{SerialConfig, SerialTransport, Transport, serial::list_ports};
pub use types::{
    DeviceDefinition, DeviceLibrary, Direction, Mote, Network, ParamType, Parameter, Register,
    RegisterKind, Value,
};
