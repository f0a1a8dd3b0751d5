//! Registers and the bit-fields (parameters and endpoints) they carry.
//!
//! A register value is a big-endian bit string. Each parameter covers
//! `size` bits of it starting at `position`, both written `bytes.bits`
//! and counted from the most significant bit:
//! ```text
//! register  [7 6 5 4 3 2 1 0][7 6 5 4 3 2 1 0]
//!                      └──── 1.4 bits at 0.4 ───┘
//! parameter [0 0 0 0 x x x x][x x x x x x x x]
//! ```
//! Parameter values are right-aligned in `size.bytes` (+1 if `size.bits`)
//! bytes. Both copy directions walk the field from its most significant bit.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::value::Value;

/// A `bytes.bits` position or size, as written in device definitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Span {
    /// Whole bytes.
    pub bytes: u8,
    /// Extra bits, 0 to 7.
    pub bits: u8,
}

impl Span {
    /// Creates a span, rejecting bit counts above 7.
    pub fn new(bytes: u8, bits: u8) -> Result<Self> {
        if bits > 7 {
            return Err(Error::InvalidValue {
                reason: format!("bit component {bits} out of range 0..=7"),
            });
        }
        Ok(Self { bytes, bits })
    }

    /// Span of whole bytes.
    #[must_use]
    pub const fn bytes(bytes: u8) -> Self {
        Self { bytes, bits: 0 }
    }

    /// Total bits.
    #[must_use]
    pub const fn total_bits(self) -> usize {
        self.bytes as usize * 8 + self.bits as usize
    }
}

impl FromStr for Span {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidValue {
            reason: format!("{s:?} is not a bytes.bits span"),
        };
        let (bytes, bits) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
        let bytes = bytes.parse().map_err(|_| invalid())?;
        let bits = bits.parse().map_err(|_| invalid())?;
        Self::new(bytes, bits)
    }
}

impl TryFrom<String> for Span {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Span> for String {
    fn from(span: Span) -> Self {
        span.to_string()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bytes, self.bits)
    }
}

/// How a parameter's bytes are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Unsigned number.
    #[default]
    Number,
    /// On/off or other raw bits.
    Binary,
    /// ASCII text.
    String,
}

/// Data direction of an endpoint, seen from the mote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sensor reading reported by the mote.
    Input,
    /// Actuator controlled through the mote.
    Output,
}

/// Display conversion: `raw * factor + offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Unit name, e.g. `"C"`.
    pub name: String,
    /// Multiplier.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Added after scaling.
    #[serde(default)]
    pub offset: f64,
}

const fn default_factor() -> f64 {
    1.0
}

/// Whether a register holds runtime endpoints or configuration parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Endpoints (sensor and actuator values).
    #[default]
    Regular,
    /// Configuration parameters.
    Config,
}

/// A named bit-field of a register.
///
/// Endpoints are parameters with a direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ParameterRecord")]
pub struct Parameter {
    /// Parameter name.
    pub name: String,
    /// Id of the register this parameter lives in.
    pub register_id: u8,
    /// Interpretation of the value.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Direction, for endpoints only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Offset within the register.
    pub position: Span,
    /// Width of the field.
    pub size: Span,
    /// Display conversions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<Unit>,
    value: Value,
    #[serde(skip)]
    changed: bool,
}

/// Stored form of a [`Parameter`], checked before use.
#[derive(Deserialize)]
struct ParameterRecord {
    name: String,
    register_id: u8,
    #[serde(rename = "type")]
    param_type: ParamType,
    #[serde(default)]
    direction: Option<Direction>,
    position: Span,
    size: Span,
    #[serde(default)]
    units: Vec<Unit>,
    value: Value,
}

impl TryFrom<ParameterRecord> for Parameter {
    type Error = Error;

    fn try_from(record: ParameterRecord) -> Result<Self> {
        let mut param = Self::new(
            record.name,
            record.register_id,
            record.param_type,
            record.direction,
            record.position,
            record.size,
        )?;
        param.units = record.units;
        param.assign(record.value)?;
        Ok(param)
    }
}

impl Parameter {
    /// Creates a zero-valued parameter.
    pub fn new(
        name: impl Into<String>,
        register_id: u8,
        param_type: ParamType,
        direction: Option<Direction>,
        position: Span,
        size: Span,
    ) -> Result<Self> {
        let name = name.into();
        if size.total_bits() == 0 {
            return Err(Error::InvalidValue {
                reason: format!("parameter {name:?} has zero size"),
            });
        }
        let length = size.bytes as usize + usize::from(size.bits > 0);
        Ok(Self {
            name,
            register_id,
            param_type,
            direction,
            position,
            size,
            units: Vec::new(),
            value: Value::zeroed(length),
            changed: false,
        })
    }

    /// Current value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// True if the last register update changed this parameter.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.changed
    }

    /// True for endpoints.
    #[must_use]
    pub const fn is_endpoint(&self) -> bool {
        self.direction.is_some()
    }

    /// Length of the value in bytes.
    #[must_use]
    pub fn byte_length(&self) -> usize {
        self.value.len()
    }

    /// First register bit covered, counted from the most significant bit.
    #[must_use]
    pub const fn bit_offset(&self) -> usize {
        self.position.total_bits()
    }

    /// Number of bits covered.
    #[must_use]
    pub const fn bit_width(&self) -> usize {
        self.size.total_bits()
    }

    /// Bytes of register needed to hold this parameter.
    #[must_use]
    pub const fn register_extent(&self) -> usize {
        (self.bit_offset() + self.bit_width()).div_ceil(8)
    }

    /// Value converted with `unit`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaled(&self, unit: &Unit) -> f64 {
        self.value.to_integer() as f64 * unit.factor + unit.offset
    }

    fn padding(&self) -> usize {
        (self.byte_length() * 8).saturating_sub(self.bit_width())
    }

    /// Copies this parameter's bits out of `register`. Sets the changed flag
    /// if the value differs from the previous one.
    pub(crate) fn update_from(&mut self, register: &[u8]) {
        let previous = self.value.clone();
        let (offset, padding) = (self.bit_offset(), self.padding());
        let bytes = self.value.bytes_mut();
        for i in 0..self.size.total_bits() {
            set_bit(bytes, padding + i, bit(register, offset + i));
        }
        self.changed = self.value != previous;
    }

    /// Copies this parameter's bits into `register`.
    pub(crate) fn write_into(&self, register: &mut [u8]) {
        let (offset, padding) = (self.bit_offset(), self.padding());
        let bytes = self.value.as_bytes();
        for i in 0..self.bit_width() {
            set_bit(register, offset + i, bit(bytes, padding + i));
        }
    }

    /// Replaces the value. Bits beyond the field width are cleared.
    pub(crate) fn assign(&mut self, value: Value) -> Result<()> {
        if value.len() != self.byte_length() {
            return Err(Error::InvalidValue {
                reason: format!(
                    "{} expects {} byte(s), got {}",
                    self.name,
                    self.byte_length(),
                    value.len()
                ),
            });
        }
        let padding = self.padding();
        self.value = value;
        let bytes = self.value.bytes_mut();
        for i in 0..padding {
            set_bit(bytes, i, false);
        }
        Ok(())
    }

    /// Converts user text to a value of this parameter's type and length.
    pub fn parse_value(&self, text: &str) -> Result<Value> {
        match self.param_type {
            ParamType::Number | ParamType::Binary => {
                Value::parse_number(text, self.byte_length()).map_err(|_| Error::InvalidValue {
                    reason: format!("{text:?} is not a valid value for {}", self.name),
                })
            }
            ParamType::String => Ok(Value::from_ascii(text, self.byte_length())),
        }
    }
}

fn bit(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .is_some_and(|b| (b >> (7 - index % 8)) & 0x01 == 1)
}

fn set_bit(bytes: &mut [u8], index: usize, on: bool) {
    if let Some(b) = bytes.get_mut(index / 8) {
        let mask = 1 << (7 - index % 8);
        if on {
            *b |= mask;
        } else {
            *b &= !mask;
        }
    }
}

/// An addressable block of mote state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RegisterRecord")]
pub struct Register {
    /// Register id, unique within the mote.
    pub id: u8,
    /// Register name.
    #[serde(default)]
    pub name: String,
    /// Endpoint or configuration register.
    #[serde(default)]
    pub kind: RegisterKind,
    value: Value,
    #[serde(default)]
    parameters: Vec<Parameter>,
}

/// Stored form of a [`Register`], checked before use.
#[derive(Deserialize)]
struct RegisterRecord {
    id: u8,
    #[serde(default)]
    name: String,
    #[serde(default)]
    kind: RegisterKind,
    value: Value,
    #[serde(default)]
    parameters: Vec<Parameter>,
}

impl TryFrom<RegisterRecord> for Register {
    type Error = Error;

    fn try_from(record: RegisterRecord) -> Result<Self> {
        let register = Self {
            id: record.id,
            name: record.name,
            kind: record.kind,
            value: record.value,
            parameters: record.parameters,
        };
        if register.value.len() < register.length() {
            return Err(Error::InvalidValue {
                reason: format!(
                    "register {} needs {} byte(s), stored value has {}",
                    register.id,
                    register.length(),
                    register.value.len()
                ),
            });
        }
        Ok(register)
    }
}

impl Register {
    /// Creates a register and composes its initial value from the parameters.
    #[must_use]
    pub fn new(
        id: u8,
        name: impl Into<String>,
        kind: RegisterKind,
        parameters: Vec<Parameter>,
    ) -> Self {
        let mut register = Self {
            id,
            name: name.into(),
            kind,
            value: Value::default(),
            parameters,
        };
        register.value = Value::zeroed(register.length());
        register.compose();
        register
    }

    /// Byte length required by the parameters.
    #[must_use]
    pub fn length(&self) -> usize {
        self.parameters
            .iter()
            .map(Parameter::register_extent)
            .max()
            .unwrap_or(0)
    }

    /// Current value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Parameters in declaration order.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Looks up a parameter by name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Parameters whose value changed in the last [`set_value`](Self::set_value).
    pub fn changed_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(|p| p.changed())
    }

    /// Replaces the register value and re-extracts every parameter.
    pub fn set_value(&mut self, value: Value) -> Result<()> {
        if value.len() < self.length() {
            return Err(Error::InvalidValue {
                reason: format!(
                    "register {} needs {} byte(s), got {}",
                    self.id,
                    self.length(),
                    value.len()
                ),
            });
        }
        self.value = value;
        let Self {
            value, parameters, ..
        } = self;
        for param in parameters {
            param.update_from(value.as_bytes());
        }
        Ok(())
    }

    /// Sets one parameter and writes it back into the register value.
    pub fn set_parameter_value(&mut self, name: &str, value: Value) -> Result<()> {
        let id = self.id;
        let param = self
            .parameters
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::UnknownParameter {
                register: id,
                name: name.to_owned(),
            })?;
        param.assign(value)?;
        self.compose();
        Ok(())
    }

    /// Parses `text` for the named parameter and sets it.
    pub fn set_parameter_from_str(&mut self, name: &str, text: &str) -> Result<()> {
        let value = self
            .parameter(name)
            .ok_or_else(|| Error::UnknownParameter {
                register: self.id,
                name: name.to_owned(),
            })?
            .parse_value(text)?;
        self.set_parameter_value(name, value)
    }

    /// Register value that would result from setting one parameter, leaving
    /// this register untouched.
    pub fn value_with_parameter(&self, name: &str, text: &str) -> Result<Value> {
        let mut draft = self.clone();
        draft.set_parameter_from_str(name, text)?;
        Ok(draft.value)
    }

    /// Writes every parameter into the register value.
    fn compose(&mut self) {
        let Self {
            value, parameters, ..
        } = self;
        let bytes = value.bytes_mut();
        for param in parameters.iter() {
            param.write_into(bytes);
        }
    }
}
