//! Parameter catalog: which names live at which addresses, and how their
//! bytes are interpreted.
//!
//! The registry is built once and never mutated afterwards, so it is shared
//! between tasks behind a plain `Arc` without locking.

use crate::error::{Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Interpretation of a parameter's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[serde(alias = "uint8", alias = "uint16", alias = "uint32")]
    Uint,
    Float,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    pub address: u32,
    pub size: usize,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

impl ParameterDefinition {
    pub fn new(name: &str, address: u32, size: usize, kind: ValueKind, range: (f64, f64)) -> Self {
        Self {
            name: name.to_string(),
            address,
            size,
            kind,
            min: range.0,
            max: range.1,
            unit: String::new(),
            description: String::new(),
        }
    }

    pub fn with_unit(mut self, unit: &str, description: &str) -> Self {
        self.unit = unit.to_string();
        self.description = description.to_string();
        self
    }

    pub fn is_float(&self) -> bool {
        self.kind == ValueKind::Float
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if !matches!(self.size, 1 | 2 | 4) {
            return Err(ValidationError::Catalog(format!(
                "{}: size {} is not 1, 2 or 4",
                self.name, self.size
            )));
        }
        if self.is_float() && self.size != 4 {
            return Err(ValidationError::Catalog(format!(
                "{}: float parameters must be 4 bytes",
                self.name
            )));
        }
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max || !(self.max - self.min).is_finite() {
            return Err(ValidationError::Catalog(format!(
                "{}: invalid range [{}, {}]",
                self.name, self.min, self.max
            )));
        }
        if self.kind == ValueKind::Uint && self.min.max(0.0).ceil() > self.max.floor() {
            return Err(ValidationError::Catalog(format!(
                "{}: range [{}, {}] holds no unsigned integer",
                self.name, self.min, self.max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    parameters: Vec<ParameterDefinition>,
    by_address: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
}

impl ParameterRegistry {
    /// Build a registry, rejecting duplicate names or addresses and
    /// definitions whose size or range make no sense.
    pub fn new(parameters: Vec<ParameterDefinition>) -> std::result::Result<Self, ValidationError> {
        let mut by_address = HashMap::with_capacity(parameters.len());
        let mut by_name = HashMap::with_capacity(parameters.len());

        for (index, param) in parameters.iter().enumerate() {
            param.validate()?;
            if by_address.insert(param.address, index).is_some() {
                return Err(ValidationError::Catalog(format!(
                    "duplicate address 0x{:08X} ({})",
                    param.address, param.name
                )));
            }
            if by_name.insert(param.name.clone(), index).is_some() {
                return Err(ValidationError::Catalog(format!("duplicate name {}", param.name)));
            }
        }

        Ok(Self {
            parameters,
            by_address,
            by_name,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let parameters: Vec<ParameterDefinition> = serde_json::from_str(json).map_err(ValidationError::BadJson)?;
        Ok(Self::new(parameters)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Charger telemetry catalog used when no file is given
    pub fn default_catalog() -> Self {
        use ValueKind::Float;
        let parameters = vec![
            ParameterDefinition::new("INPUT_VOLTAGE", 0x2000_0000, 4, Float, (0.0, 1000.0))
                .with_unit("V", "Input AC voltage"),
            ParameterDefinition::new("INPUT_CURRENT", 0x2000_0004, 4, Float, (0.0, 100.0))
                .with_unit("A", "Input AC current"),
            ParameterDefinition::new("OUTPUT_VOLTAGE", 0x2000_0008, 4, Float, (0.0, 1000.0))
                .with_unit("V", "Output DC voltage"),
            ParameterDefinition::new("OUTPUT_CURRENT", 0x2000_000C, 4, Float, (0.0, 500.0))
                .with_unit("A", "Output DC current"),
            ParameterDefinition::new("TEMPERATURE", 0x2000_0010, 4, Float, (-20.0, 100.0))
                .with_unit("°C", "Charger temperature"),
            ParameterDefinition::new("CHARGE_RATE", 0x2000_0014, 4, Float, (0.0, 100.0))
                .with_unit("kW", "Charge rate"),
            ParameterDefinition::new("EFFICIENCY", 0x2000_0018, 4, Float, (0.0, 100.0))
                .with_unit("%", "Charging efficiency"),
            ParameterDefinition::new("STATE_OF_CHARGE", 0x2000_001C, 4, Float, (0.0, 100.0))
                .with_unit("%", "Battery state of charge"),
            ParameterDefinition::new("CHARGE_TIME", 0x2000_0020, 4, Float, (0.0, 1440.0))
                .with_unit("min", "Elapsed charge time"),
            ParameterDefinition::new("REMAINING_TIME", 0x2000_0024, 4, Float, (0.0, 1440.0))
                .with_unit("min", "Estimated remaining charge time"),
        ];
        // static table, checked by tests
        Self::new(parameters).unwrap_or_default()
    }

    pub fn lookup_by_address(&self, address: u32) -> Option<&ParameterDefinition> {
        self.by_address.get(&address).map(|&i| &self.parameters[i])
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&ParameterDefinition> {
        self.by_name.get(name).map(|&i| &self.parameters[i])
    }

    /// Value kind stored at `address`; uncatalogued addresses are integers
    pub fn kind_of(&self, address: u32) -> ValueKind {
        self.lookup_by_address(address)
            .map(|p| p.kind)
            .unwrap_or(ValueKind::Uint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterDefinition> {
        self.parameters.iter()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}
