//! TDF payload decoding.
//!
//! A telemetry frame's record section concatenates records with the layout
//! described in the module docs of [`crate::tdf`]. [`TdfReader`] walks that
//! section and yields one item per sample: decoded records for definitions
//! the registry knows, raw records for the rest, and `DecodeError` items for
//! damage. Structural damage (a record running past the payload end) stops
//! the walk; a sample that merely fails its schema is reported and skipped.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use super::record::{FieldValue, RecordBody, TdfRecord};
use super::registry::{Endian, FieldDef, FieldKind, TdfRegistry, TdfSchema};
use super::time::DeviceTime;
use crate::error::DecodeError;

/// Record header bit assignments, shared with device firmware.
pub(crate) const TIMESTAMP_MASK: u16 = 0xC000;
pub(crate) const TIMESTAMP_ABSOLUTE: u16 = 0x4000;
pub(crate) const TIMESTAMP_RELATIVE: u16 = 0x8000;
pub(crate) const TIMESTAMP_EXTENDED: u16 = 0xC000;
pub(crate) const TIME_ARRAY: u16 = 0x1000;
pub(crate) const ID_MASK: u16 = 0x0FFF;

const CORE_HEADER_LEN: usize = 3;

/// Streaming decoder over one telemetry payload.
///
/// The relative-timestamp anchor lives here, so records must be pulled in
/// payload order. The iterator yields `Result` items; see the module docs
/// for which errors stop it.
pub struct TdfReader<'a> {
    registry: &'a TdfRegistry,
    device: u64,
    buf: &'a [u8],
    pos: usize,
    anchor: Option<DeviceTime>,
    queue: VecDeque<Result<TdfRecord, DecodeError>>,
    failed: bool,
}

impl<'a> TdfReader<'a> {
    /// Begins decoding the record section of a telemetry frame from `device`.
    pub fn new(registry: &'a TdfRegistry, device: u64, payload: &'a [u8]) -> Self {
        Self {
            registry,
            device,
            buf: payload,
            pos: 0,
            anchor: None,
            queue: VecDeque::new(),
            failed: false,
        }
    }

    fn take<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < N {
            return Err(DecodeError::Truncated { what, needed: N, remaining });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn bump_anchor(&mut self, delta: i64) -> Option<DeviceTime> {
        match self.anchor {
            Some(anchor) => {
                let time = anchor.offset_ticks(delta);
                self.anchor = Some(time);
                Some(time)
            }
            None => {
                debug!("relative timestamp with no anchor, leaving record untimed");
                None
            }
        }
    }

    /// Parses the next record and queues its samples. `Ok(false)` means the
    /// payload is cleanly exhausted (a trailing fragment shorter than a
    /// record header counts as padding, matching firmware).
    fn parse_record(&mut self) -> Result<bool, DecodeError> {
        if self.buf.len() - self.pos < CORE_HEADER_LEN + 1 {
            return Ok(false);
        }

        let header = self.take::<CORE_HEADER_LEN>("record header")?;
        let id_flags = u16::from_le_bytes([header[0], header[1]]);
        let sample_len = header[2] as usize;
        let definition = id_flags & ID_MASK;

        let time = match id_flags & TIMESTAMP_MASK {
            TIMESTAMP_ABSOLUTE => {
                let raw = self.take::<6>("absolute timestamp")?;
                let seconds = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                let subseconds = u16::from_le_bytes([raw[4], raw[5]]);
                let time = DeviceTime::from_parts(seconds, subseconds);
                self.anchor = Some(time);
                Some(time)
            }
            TIMESTAMP_RELATIVE => {
                let raw = self.take::<2>("relative timestamp")?;
                self.bump_anchor(u16::from_le_bytes(raw) as i64)
            }
            TIMESTAMP_EXTENDED => {
                let raw = self.take::<3>("extended timestamp")?;
                let ext = if raw[2] & 0x80 != 0 { 0xFF } else { 0x00 };
                self.bump_anchor(i32::from_le_bytes([raw[0], raw[1], raw[2], ext]) as i64)
            }
            _ => None,
        };

        let (count, period) = if id_flags & TIME_ARRAY != 0 {
            let raw = self.take::<3>("array header")?;
            (raw[0] as usize, u16::from_le_bytes([raw[1], raw[2]]) as u64)
        } else {
            (1, 0)
        };

        let total = sample_len * count;
        let remaining = self.buf.len() - self.pos;
        if remaining < total {
            return Err(DecodeError::Truncated { what: "record data", needed: total, remaining });
        }
        let data = &self.buf[self.pos..self.pos + total];
        self.pos += total;

        let schema = self.registry.get(definition).cloned();
        for i in 0..count {
            let sample = &data[i * sample_len..(i + 1) * sample_len];
            let sample_time = time.map(|t| t.offset_ticks((i as u64 * period) as i64));
            let item = match &schema {
                Some(schema) => match decode_sample(schema, sample) {
                    Ok(values) => Ok(TdfRecord {
                        device: self.device,
                        definition,
                        time: sample_time,
                        body: RecordBody::Decoded { schema: Arc::clone(schema), values },
                    }),
                    Err(err) => {
                        debug!("skipping sample of definition {definition}: {err}");
                        Err(err)
                    }
                },
                None => Ok(TdfRecord {
                    device: self.device,
                    definition,
                    time: sample_time,
                    body: RecordBody::Raw { bytes: sample.to_vec() },
                }),
            };
            self.queue.push_back(item);
        }
        Ok(true)
    }
}

impl Iterator for TdfReader<'_> {
    type Item = Result<TdfRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(item);
            }
            if self.failed {
                return None;
            }
            match self.parse_record() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Decodes one sample against its schema, field by field in declaration
/// order. The sample must be consumed exactly.
fn decode_sample(schema: &TdfSchema, data: &[u8]) -> Result<Vec<FieldValue>, DecodeError> {
    let mut values = Vec::with_capacity(schema.fields.len());
    let mut pos = 0;

    for field in &schema.fields {
        let value = match field.kind.width() {
            Some(width) => {
                let bytes =
                    data.get(pos..pos + width).ok_or_else(|| DecodeError::WidthMismatch {
                        schema: schema.name.clone(),
                        expected: schema.min_width(),
                        actual: data.len(),
                    })?;
                pos += width;
                decode_fixed(field, bytes)
            }
            None => {
                let declared = *data.get(pos).ok_or(DecodeError::Truncated {
                    what: "length prefix",
                    needed: 1,
                    remaining: 0,
                })? as usize;
                pos += 1;
                let remaining = data.len() - pos;
                if declared > remaining {
                    return Err(DecodeError::LengthOverrun {
                        field: field.name.clone(),
                        declared,
                        remaining,
                    });
                }
                let bytes = &data[pos..pos + declared];
                pos += declared;
                match field.kind {
                    FieldKind::String => FieldValue::String(
                        std::str::from_utf8(bytes)
                            .map_err(|_| DecodeError::InvalidUtf8 { field: field.name.clone() })?
                            .to_owned(),
                    ),
                    _ => FieldValue::Bytes(bytes.to_vec()),
                }
            }
        };
        values.push(value);
    }

    if pos != data.len() {
        return Err(DecodeError::WidthMismatch {
            schema: schema.name.clone(),
            expected: pos,
            actual: data.len(),
        });
    }
    Ok(values)
}

/// Fixed-width field decode with the declared byte order. `bytes` is exactly
/// the field's width.
fn decode_fixed(field: &FieldDef, bytes: &[u8]) -> FieldValue {
    let be = field.endian == Endian::Big;
    match field.kind {
        FieldKind::UInt8 => FieldValue::UInt8(bytes[0]),
        FieldKind::Int8 => FieldValue::Int8(bytes[0] as i8),
        FieldKind::Bool => FieldValue::Bool(bytes[0] != 0),
        FieldKind::UInt16 => {
            let raw = [bytes[0], bytes[1]];
            FieldValue::UInt16(if be { u16::from_be_bytes(raw) } else { u16::from_le_bytes(raw) })
        }
        FieldKind::Int16 => {
            let raw = [bytes[0], bytes[1]];
            FieldValue::Int16(if be { i16::from_be_bytes(raw) } else { i16::from_le_bytes(raw) })
        }
        FieldKind::UInt32 => {
            let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
            FieldValue::UInt32(if be { u32::from_be_bytes(raw) } else { u32::from_le_bytes(raw) })
        }
        FieldKind::Int32 => {
            let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
            FieldValue::Int32(if be { i32::from_be_bytes(raw) } else { i32::from_le_bytes(raw) })
        }
        FieldKind::Float32 => {
            let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
            FieldValue::Float32(if be { f32::from_be_bytes(raw) } else { f32::from_le_bytes(raw) })
        }
        FieldKind::UInt64 => {
            let raw = [
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ];
            FieldValue::UInt64(if be { u64::from_be_bytes(raw) } else { u64::from_le_bytes(raw) })
        }
        FieldKind::Int64 => {
            let raw = [
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ];
            FieldValue::Int64(if be { i64::from_be_bytes(raw) } else { i64::from_le_bytes(raw) })
        }
        FieldKind::Float64 => {
            let raw = [
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ];
            FieldValue::Float64(if be { f64::from_be_bytes(raw) } else { f64::from_le_bytes(raw) })
        }
        // Variable-width kinds never reach here; width() returned None.
        FieldKind::String | FieldKind::Bytes => FieldValue::Bytes(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    fn record_header(id: u16, flags: u16, len: u8) -> Vec<u8> {
        let mut out = (id | flags).to_le_bytes().to_vec();
        out.push(len);
        out
    }

    fn absolute_time(seconds: u32, subseconds: u16) -> Vec<u8> {
        let mut out = seconds.to_le_bytes().to_vec();
        out.extend_from_slice(&subseconds.to_le_bytes());
        out
    }

    fn registry_with_temp() -> TdfRegistry {
        let mut registry = TdfRegistry::new();
        registry
            .insert(
                TdfSchema::new(1, "temp_reading", vec![FieldDef::big_endian("temp", FieldKind::Int16)])
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn decodes_a_big_endian_int16_field() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, 0, 2);
        payload.extend_from_slice(&[0x00, 0x64]);

        let records: Vec<_> = TdfReader::new(&registry, 5, &payload).collect();
        assert_eq!(records.len(), 1);
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.definition, 1);
        assert_eq!(record.device, 5);
        assert_eq!(record.time, None);
        assert_eq!(record.get("temp"), Some(&FieldValue::Int16(100)));
    }

    #[test]
    fn unknown_definition_yields_raw_record_and_decoding_continues() {
        let registry = registry_with_temp();
        let mut payload = record_header(99, 0, 3);
        payload.extend_from_slice(&[0xCA, 0xFE, 0x42]);
        payload.extend_from_slice(&record_header(1, 0, 2));
        payload.extend_from_slice(&[0xFF, 0x9C]); // -100 big-endian

        let records: Vec<_> = TdfReader::new(&registry, 1, &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_raw());
        assert_eq!(records[0].definition, 99);
        assert_eq!(records[0].raw_bytes(), Some(&[0xCA, 0xFE, 0x42][..]));
        assert_eq!(records[1].get("temp"), Some(&FieldValue::Int16(-100)));
    }

    #[test]
    fn absolute_anchor_then_relative_offsets_accumulate() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, TIMESTAMP_ABSOLUTE, 2);
        payload.extend_from_slice(&absolute_time(1_000, 0));
        payload.extend_from_slice(&[0x00, 0x01]);
        payload.extend_from_slice(&record_header(1, TIMESTAMP_RELATIVE, 2));
        payload.extend_from_slice(&32_768u16.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x02]);
        payload.extend_from_slice(&record_header(1, TIMESTAMP_RELATIVE, 2));
        payload.extend_from_slice(&100u16.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x03]);

        let records: Vec<_> = TdfReader::new(&registry, 1, &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let base = DeviceTime::from_parts(1_000, 0);
        assert_eq!(records[0].time, Some(base));
        assert_eq!(records[1].time, Some(base.offset_ticks(32_768)));
        assert_eq!(records[2].time, Some(base.offset_ticks(32_868)));
    }

    #[test]
    fn extended_relative_offsets_can_step_backwards() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, TIMESTAMP_ABSOLUTE, 2);
        payload.extend_from_slice(&absolute_time(1_000, 0));
        payload.extend_from_slice(&[0x00, 0x01]);
        payload.extend_from_slice(&record_header(1, TIMESTAMP_EXTENDED, 2));
        payload.extend_from_slice(&(-70_000i32).to_le_bytes()[..3]);
        payload.extend_from_slice(&[0x00, 0x02]);

        let records: Vec<_> = TdfReader::new(&registry, 1, &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let base = DeviceTime::from_parts(1_000, 0);
        assert_eq!(records[1].time, Some(base.offset_ticks(-70_000)));
    }

    #[test]
    fn relative_time_without_anchor_leaves_record_untimed() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, TIMESTAMP_RELATIVE, 2);
        payload.extend_from_slice(&500u16.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x64]);

        let records: Vec<_> = TdfReader::new(&registry, 1, &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, None);
        assert_eq!(records[0].get("temp"), Some(&FieldValue::Int16(100)));
    }

    #[test]
    fn time_arrays_expand_with_stepped_timestamps() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, TIMESTAMP_ABSOLUTE | TIME_ARRAY, 2);
        payload.extend_from_slice(&absolute_time(2_000, 0));
        payload.push(3); // samples
        payload.extend_from_slice(&100u16.to_le_bytes()); // period in ticks
        payload.extend_from_slice(&[0x00, 0x0A, 0x00, 0x0B, 0x00, 0x0C]);

        let records: Vec<_> = TdfReader::new(&registry, 1, &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        let base = DeviceTime::from_parts(2_000, 0);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.time, Some(base.offset_ticks(i as i64 * 100)));
            assert_eq!(record.get("temp"), Some(&FieldValue::Int16(10 + i as i16)));
        }
    }

    #[test]
    fn structural_truncation_stops_the_walk() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, 0, 10);
        payload.extend_from_slice(&[0x00; 4]); // claims 10 data bytes, has 4

        let items: Vec<_> = TdfReader::new(&registry, 1, &payload).collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn sample_schema_mismatch_skips_only_that_record() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, 0, 1); // one byte cannot hold an int16
        payload.push(0x7F);
        payload.extend_from_slice(&record_header(1, 0, 2));
        payload.extend_from_slice(&[0x00, 0x64]);

        let items: Vec<_> = TdfReader::new(&registry, 1, &payload).collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(DecodeError::WidthMismatch { .. })));
        assert_eq!(items[1].as_ref().unwrap().get("temp"), Some(&FieldValue::Int16(100)));
    }

    #[test]
    fn oversized_sample_for_schema_is_a_width_mismatch() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, 0, 3);
        payload.extend_from_slice(&[0x00, 0x64, 0xEE]);

        let items: Vec<_> = TdfReader::new(&registry, 1, &payload).collect();
        assert!(matches!(
            items[0],
            Err(DecodeError::WidthMismatch { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn variable_length_fields_decode_and_guard_their_prefix() {
        let mut registry = TdfRegistry::new();
        registry
            .insert(
                TdfSchema::new(
                    20,
                    "announce",
                    vec![
                        FieldDef::new("banner", FieldKind::String),
                        FieldDef::new("blob", FieldKind::Bytes),
                    ],
                )
                .unwrap(),
            )
            .unwrap();

        let mut payload = record_header(20, 0, 7);
        payload.push(3);
        payload.extend_from_slice(b"hey");
        payload.push(2);
        payload.extend_from_slice(&[0xAB, 0xCD]);

        let records: Vec<_> = TdfReader::new(&registry, 9, &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records[0].get("banner").and_then(FieldValue::as_str), Some("hey"));
        assert_eq!(records[0].get("blob"), Some(&FieldValue::Bytes(vec![0xAB, 0xCD])));

        // Prefix overruns the sample: the record is reported, not truncated.
        let mut bad = record_header(20, 0, 3);
        bad.push(10);
        bad.extend_from_slice(&[0x01, 0x02]);
        let items: Vec<_> = TdfReader::new(&registry, 9, &bad).collect();
        assert!(matches!(
            items[0],
            Err(DecodeError::LengthOverrun { declared: 10, remaining: 2, .. })
        ));
    }

    #[test]
    fn invalid_utf8_in_a_string_field_is_reported() {
        let mut registry = TdfRegistry::new();
        registry
            .insert(
                TdfSchema::new(21, "label", vec![FieldDef::new("text", FieldKind::String)])
                    .unwrap(),
            )
            .unwrap();

        let mut payload = record_header(21, 0, 3);
        payload.push(2);
        payload.extend_from_slice(&[0xFF, 0xFE]);

        let items: Vec<_> = TdfReader::new(&registry, 9, &payload).collect();
        assert!(matches!(items[0], Err(DecodeError::InvalidUtf8 { .. })));
    }

    #[test]
    fn trailing_padding_shorter_than_a_header_is_ignored() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, 0, 2);
        payload.extend_from_slice(&[0x00, 0x64]);
        payload.extend_from_slice(&[0x00, 0x00, 0x00]);

        let records: Vec<_> = TdfReader::new(&registry, 1, &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn untimed_records_stay_untimed_even_with_an_anchor() {
        let registry = registry_with_temp();
        let mut payload = record_header(1, TIMESTAMP_ABSOLUTE, 2);
        payload.extend_from_slice(&absolute_time(3_000, 0));
        payload.extend_from_slice(&[0x00, 0x01]);
        payload.extend_from_slice(&record_header(1, 0, 2));
        payload.extend_from_slice(&[0x00, 0x02]);

        let records: Vec<_> = TdfReader::new(&registry, 1, &payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert!(records[0].time.is_some());
        assert_eq!(records[1].time, None);
    }
}
