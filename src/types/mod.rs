//! Data types for SWAP network entities.
//!
//! This module contains the data model the server keeps in sync with the
//! air:
//! - Register values and the parameters packed into them
//! - Motes and the network directory
//! - Device definitions used to instantiate newly discovered motes

pub mod definition;
pub mod mote;
pub mod network;
pub mod register;
pub mod value;

pub use definition::{DeviceDefinition, DeviceLibrary, ParameterDefinition, RegisterDefinition};
pub use mote::Mote;
pub use network::Network;
pub use register::{Direction, ParamType, Parameter, Register, RegisterKind, Span, Unit};
pub use value::Value;
