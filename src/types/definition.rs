//! Device definitions: which registers and parameters a product carries.
//!
//! Definitions are loaded from a JSON library file:
//! ```json
//! { "devices": [ {
//!     "manufacturer_id": 1, "product_id": 2, "name": "temphum",
//!     "registers": [ { "id": 11, "name": "sensor", "parameters": [
//!         { "name": "temperature", "type": "number", "direction": "input",
//!           "position": "0", "size": "2",
//!           "units": [ { "name": "C", "factor": 0.1, "offset": -50 } ] } ] } ],
//!     "config_registers": [] } ] }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::mote::Mote;
use crate::types::register::{Direction, ParamType, Parameter, Register, RegisterKind, Span, Unit};

/// Collection of known products.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceLibrary {
    #[serde(default)]
    devices: Vec<DeviceDefinition>,
}

impl DeviceLibrary {
    /// Creates an empty library.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Reads a library file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Adds a definition, replacing any with the same product code.
    pub fn insert(&mut self, definition: DeviceDefinition) {
        self.devices.retain(|d| {
            (d.manufacturer_id, d.product_id) != (definition.manufacturer_id, definition.product_id)
        });
        self.devices.push(definition);
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, definition: DeviceDefinition) -> Self {
        self.insert(definition);
        self
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if the library has no definitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Finds the definition of a product.
    #[must_use]
    pub fn find(&self, manufacturer_id: u32, product_id: u32) -> Option<&DeviceDefinition> {
        self.devices
            .iter()
            .find(|d| d.manufacturer_id == manufacturer_id && d.product_id == product_id)
    }

    /// Builds a mote for a discovered product code.
    ///
    /// Unknown products still yield a mote, just without registers.
    pub fn instantiate(&self, address: u8, manufacturer_id: u32, product_id: u32) -> Result<Mote> {
        match self.find(manufacturer_id, product_id) {
            Some(definition) => definition.build(address),
            None => {
                tracing::warn!(
                    "no definition for product {manufacturer_id:08X}:{product_id:08X} \
                     (mote {address})"
                );
                Ok(Mote::new(address, manufacturer_id, product_id))
            }
        }
    }
}

/// Definition of one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Manufacturer id.
    pub manufacturer_id: u32,
    /// Product id.
    pub product_id: u32,
    /// Product name.
    #[serde(default)]
    pub name: String,
    /// The mote sleeps between transmissions and only listens in sync mode.
    #[serde(default)]
    pub pwr_down_mode: bool,
    /// Endpoint registers.
    #[serde(default)]
    pub registers: Vec<RegisterDefinition>,
    /// Configuration registers.
    #[serde(default)]
    pub config_registers: Vec<RegisterDefinition>,
}

impl DeviceDefinition {
    /// Creates a mote of this product at `address`.
    pub fn build(&self, address: u8) -> Result<Mote> {
        let mut mote = Mote::new(address, self.manufacturer_id, self.product_id);
        mote.name.clone_from(&self.name);
        mote.pwr_down_mode = self.pwr_down_mode;
        mote.regular_registers = self
            .registers
            .iter()
            .map(|r| r.build(RegisterKind::Regular))
            .collect::<Result<_>>()?;
        mote.config_registers = self
            .config_registers
            .iter()
            .map(|r| r.build(RegisterKind::Config))
            .collect::<Result<_>>()?;
        Ok(mote)
    }
}

/// Definition of one register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    /// Register id.
    pub id: u8,
    /// Register name.
    #[serde(default)]
    pub name: String,
    /// Parameters or endpoints.
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

impl RegisterDefinition {
    /// Creates the register with every parameter at its default.
    ///
    /// Configuration parameters never carry a direction.
    pub fn build(&self, kind: RegisterKind) -> Result<Register> {
        let mut parameters = Vec::with_capacity(self.parameters.len());
        for def in &self.parameters {
            let direction = match kind {
                RegisterKind::Regular => def.direction,
                RegisterKind::Config => None,
            };
            let mut param = Parameter::new(
                def.name.clone(),
                self.id,
                def.param_type,
                direction,
                def.position,
                def.size,
            )?;
            param.units.clone_from(&def.units);
            parameters.push(param);
        }

        let mut register = Register::new(self.id, self.name.clone(), kind, parameters);
        for def in &self.parameters {
            if let Some(default) = &def.default {
                register.set_parameter_from_str(&def.name, default)?;
            }
        }
        Ok(register)
    }
}

/// Definition of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Parameter name.
    pub name: String,
    /// Interpretation of the value.
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    /// Endpoint direction.
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Offset within the register.
    #[serde(default)]
    pub position: Span,
    /// Width of the field.
    pub size: Span,
    /// Initial value, as user text.
    #[serde(default)]
    pub default: Option<String>,
    /// Display conversions.
    #[serde(default)]
    pub units: Vec<Unit>,
}
