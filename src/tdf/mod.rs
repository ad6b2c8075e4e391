//! Tagged Data Format (TDF) telemetry decoding.
//!
//! Devices pack sensor readings into self-describing records. Each record
//! starts with a core header naming a definition id, followed by optional
//! timestamp and array headers and then the sample data:
//!
//! | section      | bytes          | contents                                      |
//! |--------------|----------------|-----------------------------------------------|
//! | core header  | 3              | definition id and flags (u16 LE), sample len (u8) |
//! | timestamp    | 0, 2, 3 or 6   | per the timestamp mode flagged in the header  |
//! | array header | 0 or 3         | sample count (u8), tick period (u16 LE)       |
//! | data         | len × count    | samples, decoded against the registry schema  |
//!
//! Timestamps count 1/65536-second ticks since the GPS epoch. An absolute
//! timestamp anchors the payload; relative and extended-relative modes add a
//! tick offset to that anchor, which lets a device send one full timestamp
//! and then cheap deltas for the rest of the buffer.
//!
//! ## Architecture
//!
//! - [`TdfRegistry`] maps definition ids to [`TdfSchema`] field layouts
//! - [`TdfReader`] walks a payload and yields [`TdfRecord`]s, one per sample
//! - [`FieldValue`] preserves each field's declared width, no implicit widening
//! - Unknown definition ids come back as raw records, never dropped
//!
//! ## Usage Example
//!
//! ```rust
//! use downlink::tdf::{FieldDef, FieldKind, TdfReader, TdfRegistry, TdfSchema};
//!
//! let mut registry = TdfRegistry::new();
//! registry.insert(TdfSchema::new(
//!     1,
//!     "ambient_temp",
//!     vec![FieldDef::big_endian("temp", FieldKind::Int16)],
//! )?)?;
//!
//! // Core header (definition 1, no timestamp, 2 data bytes), then 100 big-endian.
//! let payload = [0x01, 0x00, 0x02, 0x00, 0x64];
//! let records: Vec<_> = TdfReader::new(&registry, 7, &payload)
//!     .collect::<Result<Vec<_>, _>>()?;
//! assert_eq!(records[0].get("temp").and_then(|v| v.as_i64()), Some(100));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod decode;
mod record;
mod registry;
mod time;

pub use decode::TdfReader;
pub use record::{FieldValue, RecordBody, TdfRecord};
pub use registry::{Endian, FieldDef, FieldKind, MAX_DEFINITION_ID, TdfRegistry, TdfSchema};
pub use time::{DeviceTime, GPS_UNIX_OFFSET, LEAP_SECONDS, TICKS_PER_SECOND};
