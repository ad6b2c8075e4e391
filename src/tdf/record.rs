//! Decoded telemetry records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::registry::{FieldKind, TdfSchema};
use super::time::DeviceTime;

/// Runtime value of one record field.
///
/// The variant preserves the width and signedness the schema declared; an
/// `int16` field is carried as `Int16`, never widened on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    UInt8(u8),
    Int8(i8),
    UInt16(u16),
    Int16(i16),
    UInt32(u32),
    Int32(i32),
    UInt64(u64),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// The schema kind this value decodes from.
    pub const fn kind(&self) -> FieldKind {
        match self {
            FieldValue::UInt8(_) => FieldKind::UInt8,
            FieldValue::Int8(_) => FieldKind::Int8,
            FieldValue::UInt16(_) => FieldKind::UInt16,
            FieldValue::Int16(_) => FieldKind::Int16,
            FieldValue::UInt32(_) => FieldKind::UInt32,
            FieldValue::Int32(_) => FieldKind::Int32,
            FieldValue::UInt64(_) => FieldKind::UInt64,
            FieldValue::Int64(_) => FieldKind::Int64,
            FieldValue::Float32(_) => FieldKind::Float32,
            FieldValue::Float64(_) => FieldKind::Float64,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Bytes(_) => FieldKind::Bytes,
        }
    }

    /// Signed view of any integer variant that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::UInt8(v) => Some(v.into()),
            FieldValue::Int8(v) => Some(v.into()),
            FieldValue::UInt16(v) => Some(v.into()),
            FieldValue::Int16(v) => Some(v.into()),
            FieldValue::UInt32(v) => Some(v.into()),
            FieldValue::Int32(v) => Some(v.into()),
            FieldValue::UInt64(v) => i64::try_from(v).ok(),
            FieldValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric view of integer and float variants.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Float32(v) => Some(v.into()),
            FieldValue::Float64(v) => Some(v),
            FieldValue::UInt64(v) => Some(v as f64),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            FieldValue::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::UInt8(v) => write!(f, "{v}"),
            FieldValue::Int8(v) => write!(f, "{v}"),
            FieldValue::UInt16(v) => write!(f, "{v}"),
            FieldValue::Int16(v) => write!(f, "{v}"),
            FieldValue::UInt32(v) => write!(f, "{v}"),
            FieldValue::Int32(v) => write!(f, "{v}"),
            FieldValue::UInt64(v) => write!(f, "{v}"),
            FieldValue::Int64(v) => write!(f, "{v}"),
            FieldValue::Float32(v) => write!(f, "{v}"),
            FieldValue::Float64(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "{v}"),
            FieldValue::Bytes(v) => {
                for byte in v {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// One decoded telemetry record.
#[derive(Debug, Clone, PartialEq)]
pub struct TdfRecord {
    /// Device that produced the record.
    pub device: u64,
    /// Definition identifier selecting the layout.
    pub definition: u16,
    /// Device-clock timestamp; `None` when the record carried no time and no
    /// anchor was in effect.
    pub time: Option<DeviceTime>,
    pub body: RecordBody,
}

/// Payload of a record: decoded against a schema, or the raw bytes when the
/// definition identifier is not in the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    Decoded {
        /// Shared layout; field names come from here, values align by index.
        schema: Arc<TdfSchema>,
        values: Vec<FieldValue>,
    },
    Raw {
        bytes: Vec<u8>,
    },
}

impl TdfRecord {
    /// Looks up a field value by name. `None` for raw records and unknown
    /// names.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        match &self.body {
            RecordBody::Decoded { schema, values } => {
                values.get(schema.field_index(field)?)
            }
            RecordBody::Raw { .. } => None,
        }
    }

    /// Iterates `(field name, value)` pairs in schema order. Empty for raw
    /// records.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        let decoded = match &self.body {
            RecordBody::Decoded { schema, values } => Some((schema, values)),
            RecordBody::Raw { .. } => None,
        };
        decoded.into_iter().flat_map(|(schema, values)| {
            schema.fields.iter().map(|f| f.name.as_str()).zip(values.iter())
        })
    }

    /// Schema name for decoded records.
    pub fn schema_name(&self) -> Option<&str> {
        match &self.body {
            RecordBody::Decoded { schema, .. } => Some(schema.name.as_str()),
            RecordBody::Raw { .. } => None,
        }
    }

    /// Whether the definition identifier was unknown to the registry.
    pub fn is_raw(&self) -> bool {
        matches!(self.body, RecordBody::Raw { .. })
    }

    /// The undecoded sample bytes of a raw record.
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            RecordBody::Raw { bytes } => Some(bytes),
            RecordBody::Decoded { .. } => None,
        }
    }
}
