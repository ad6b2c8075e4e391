//! TDF definition registry.
//!
//! A definition identifier selects the layout of a record's sample bytes.
//! The registry maps identifiers to [`TdfSchema`]s, which the decoder
//! consults; identifiers with no schema decode to raw records. Schemas come
//! from device firmware metadata, either built in code or loaded from YAML:
//!
//! ```yaml
//! definitions:
//!   - id: 10
//!     name: env_sample
//!     fields:
//!       - { name: temperature, kind: int16 }
//!       - { name: humidity, kind: uint8 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LinkError, Result};

/// Largest definition identifier; the record header keeps the id in 12 bits.
pub const MAX_DEFINITION_ID: u16 = 0x0FFF;

/// Byte order of a numeric field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Data types a schema may declare for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float32,
    Float64,
    Bool,
    String,
    Bytes,
}

impl FieldKind {
    /// Fixed byte width, or `None` for the length-prefixed kinds.
    pub const fn width(&self) -> Option<usize> {
        match self {
            FieldKind::UInt8 | FieldKind::Int8 | FieldKind::Bool => Some(1),
            FieldKind::UInt16 | FieldKind::Int16 => Some(2),
            FieldKind::UInt32 | FieldKind::Int32 | FieldKind::Float32 => Some(4),
            FieldKind::UInt64 | FieldKind::Int64 | FieldKind::Float64 => Some(8),
            FieldKind::String | FieldKind::Bytes => None,
        }
    }

    /// Whether the field is length-prefixed on the wire.
    pub const fn is_variable(&self) -> bool {
        self.width().is_none()
    }
}

/// One field of a record layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// Byte order for the numeric kinds; ignored for single-byte and
    /// length-prefixed fields.
    #[serde(default)]
    pub endian: Endian,
}

impl FieldDef {
    /// Little-endian field, the common case for device firmware.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self { name: name.into(), kind, endian: Endian::Little }
    }

    /// Big-endian field, for sensors that serialize network order.
    pub fn big_endian(name: impl Into<String>, kind: FieldKind) -> Self {
        Self { name: name.into(), kind, endian: Endian::Big }
    }
}

/// Layout of one TDF definition: an ordered list of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdfSchema {
    pub id: u16,
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl TdfSchema {
    /// Create a schema with validation.
    pub fn new(id: u16, name: impl Into<String>, fields: Vec<FieldDef>) -> Result<Self> {
        let schema = Self { id, name: name.into(), fields };
        schema.validate()?;
        Ok(schema)
    }

    /// Validate the schema for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.id > MAX_DEFINITION_ID {
            return Err(LinkError::config(
                "tdf schema",
                format!("definition id {} does not fit in 12 bits", self.id),
            ));
        }
        if self.name.is_empty() {
            return Err(LinkError::config(
                "tdf schema",
                format!("definition {} has an empty name", self.id),
            ));
        }
        if self.fields.is_empty() {
            return Err(LinkError::config(
                "tdf schema",
                format!("definition `{}` declares no fields", self.name),
            ));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(LinkError::config(
                    "tdf schema",
                    format!("definition `{}` field {} has an empty name", self.name, i),
                ));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(LinkError::config(
                    "tdf schema",
                    format!("definition `{}` repeats field `{}`", self.name, field.name),
                ));
            }
        }
        Ok(())
    }

    /// Sample width when every field is fixed-size, `None` otherwise.
    pub fn fixed_width(&self) -> Option<usize> {
        self.fields.iter().map(|f| f.kind.width()).sum()
    }

    /// Smallest sample that can satisfy this schema; variable-length fields
    /// contribute their one-byte length prefix.
    pub fn min_width(&self) -> usize {
        self.fields.iter().map(|f| f.kind.width().unwrap_or(1)).sum()
    }

    /// Position of a field by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Registry mapping definition identifiers to schemas.
#[derive(Debug, Default, Clone)]
pub struct TdfRegistry {
    schemas: HashMap<u16, Arc<TdfSchema>>,
}

impl TdfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a registry from a YAML document of device metadata.
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let parsed: RegistryDoc = serde_yaml_ng::from_str(doc)
            .map_err(|e| LinkError::config("registry yaml", e.to_string()))?;
        let mut registry = Self::new();
        for schema in parsed.definitions {
            registry.insert(schema)?;
        }
        Ok(registry)
    }

    /// Validates and registers a schema. Replacing an existing definition is
    /// allowed (firmware metadata gets reloaded); the replacement is logged.
    pub fn insert(&mut self, schema: TdfSchema) -> Result<()> {
        schema.validate()?;
        if let Some(previous) = self.schemas.insert(schema.id, Arc::new(schema)) {
            debug!("replaced schema `{}` for definition {}", previous.name, previous.id);
        }
        Ok(())
    }

    pub fn get(&self, id: u16) -> Option<&Arc<TdfSchema>> {
        self.schemas.get(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.schemas.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[derive(Deserialize)]
struct RegistryDoc {
    definitions: Vec<TdfSchema>,
}
