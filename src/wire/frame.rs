//! Frame types and their payload encodings.
//!
//! Every message on the link is one of four frame kinds, encoded with the
//! layout described in the module docs of [`crate::wire`]. The typed payload
//! structures here parse and serialize the payload bytes; the surrounding
//! sync/length/CRC envelope is handled by the codec.

use crate::error::FramingError;

/// Sync marker opening every frame on the wire.
pub const SYNC: [u8; 2] = [0xD5, 0xCA];

/// Maximum payload bytes a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Bytes before the payload: sync marker, type tag, length field.
pub const HEADER_LEN: usize = 5;

/// Bytes after the payload: the CRC-32 trailer.
pub const TRAILER_LEN: usize = 4;

/// Smallest complete frame on the wire (empty payload).
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;

/// Type tag carried in byte 2 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    RpcRequest = 1,
    RpcResponse = 2,
    Telemetry = 3,
    ThroughputControl = 4,
}

impl FrameKind {
    /// Wire tag for this kind.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Parses a wire tag, returning `None` for tags this protocol version
    /// does not know.
    pub const fn from_tag(tag: u8) -> Option<FrameKind> {
        match tag {
            1 => Some(FrameKind::RpcRequest),
            2 => Some(FrameKind::RpcResponse),
            3 => Some(FrameKind::Telemetry),
            4 => Some(FrameKind::ThroughputControl),
            _ => None,
        }
    }

    /// Short name used in log lines.
    pub const fn name(self) -> &'static str {
        match self {
            FrameKind::RpcRequest => "rpc-request",
            FrameKind::RpcResponse => "rpc-response",
            FrameKind::Telemetry => "telemetry",
            FrameKind::ThroughputControl => "throughput-control",
        }
    }
}

/// A decoded message, one variant per frame kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    RpcRequest(RpcRequest),
    RpcResponse(RpcResponse),
    Telemetry(Telemetry),
    ThroughputControl(ThroughputControl),
}

/// Host-to-device RPC request.
///
/// Payload layout: `correlation u32 | device u64 | method u16 | args...`,
/// all little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub correlation: u32,
    pub device: u64,
    pub method: u16,
    pub args: Vec<u8>,
}

/// Device-to-host RPC response.
///
/// Payload layout: `correlation u32 | device u64 | status i16 | data...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub correlation: u32,
    pub device: u64,
    pub status: i16,
    pub data: Vec<u8>,
}

/// Asynchronous telemetry from a device.
///
/// Payload layout: `device u64 | concatenated TDF records...`. The record
/// bytes are opaque at this layer; the TDF decoder interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub device: u64,
    pub records: Vec<u8>,
}

/// Synthetic load frame, echoed verbatim by the remote.
///
/// Payload layout: `seq u32 | filler...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughputControl {
    pub seq: u32,
    pub filler: Vec<u8>,
}

impl RpcRequest {
    const FIXED_LEN: usize = 14;

    fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        if payload.len() < Self::FIXED_LEN {
            return Err(FramingError::ShortPayload {
                kind: FrameKind::RpcRequest.name(),
                len: payload.len(),
            });
        }
        Ok(Self {
            correlation: u32_at(payload, 0),
            device: u64_at(payload, 4),
            method: u16_at(payload, 12),
            args: payload[Self::FIXED_LEN..].to_vec(),
        })
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.args.len());
        out.extend_from_slice(&self.correlation.to_le_bytes());
        out.extend_from_slice(&self.device.to_le_bytes());
        out.extend_from_slice(&self.method.to_le_bytes());
        out.extend_from_slice(&self.args);
        out
    }
}

impl RpcResponse {
    const FIXED_LEN: usize = 14;

    fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        if payload.len() < Self::FIXED_LEN {
            return Err(FramingError::ShortPayload {
                kind: FrameKind::RpcResponse.name(),
                len: payload.len(),
            });
        }
        Ok(Self {
            correlation: u32_at(payload, 0),
            device: u64_at(payload, 4),
            status: i16_at(payload, 12),
            data: payload[Self::FIXED_LEN..].to_vec(),
        })
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.data.len());
        out.extend_from_slice(&self.correlation.to_le_bytes());
        out.extend_from_slice(&self.device.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

impl Telemetry {
    const FIXED_LEN: usize = 8;

    fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        if payload.len() < Self::FIXED_LEN {
            return Err(FramingError::ShortPayload {
                kind: FrameKind::Telemetry.name(),
                len: payload.len(),
            });
        }
        Ok(Self { device: u64_at(payload, 0), records: payload[Self::FIXED_LEN..].to_vec() })
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.records.len());
        out.extend_from_slice(&self.device.to_le_bytes());
        out.extend_from_slice(&self.records);
        out
    }
}

impl ThroughputControl {
    const FIXED_LEN: usize = 4;

    /// Builds a probe frame of exactly `payload_size` bytes of payload.
    ///
    /// The filler is a rolling byte pattern so transport-level corruption is
    /// unlikely to cancel out in the CRC. `payload_size` must be at least the
    /// 4 sequence bytes and at most [`MAX_PAYLOAD_LEN`].
    pub fn sized(seq: u32, payload_size: usize) -> Self {
        debug_assert!((Self::FIXED_LEN..=MAX_PAYLOAD_LEN).contains(&payload_size));
        let filler: Vec<u8> =
            (0..payload_size.saturating_sub(Self::FIXED_LEN)).map(|i| (i % 251) as u8).collect();
        Self { seq, filler }
    }

    /// Total payload bytes this frame occupies on the wire.
    pub fn payload_len(&self) -> usize {
        Self::FIXED_LEN + self.filler.len()
    }

    fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        if payload.len() < Self::FIXED_LEN {
            return Err(FramingError::ShortPayload {
                kind: FrameKind::ThroughputControl.name(),
                len: payload.len(),
            });
        }
        Ok(Self { seq: u32_at(payload, 0), filler: payload[Self::FIXED_LEN..].to_vec() })
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.filler.len());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.filler);
        out
    }
}

impl Frame {
    /// The type tag this frame carries on the wire.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::RpcRequest(_) => FrameKind::RpcRequest,
            Frame::RpcResponse(_) => FrameKind::RpcResponse,
            Frame::Telemetry(_) => FrameKind::Telemetry,
            Frame::ThroughputControl(_) => FrameKind::ThroughputControl,
        }
    }

    /// Serializes the complete frame: sync marker, tag, length, payload, CRC.
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        let payload = self.encode_payload();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::Oversize { length: payload.len(), max: MAX_PAYLOAD_LEN });
        }
        let mut out = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
        out.extend_from_slice(&SYNC);
        out.push(self.kind().tag());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&frame_crc(self.kind().tag(), &payload).to_le_bytes());
        Ok(out)
    }

    /// Parses a validated payload into the typed frame for `kind`.
    pub fn decode(kind: FrameKind, payload: &[u8]) -> Result<Frame, FramingError> {
        match kind {
            FrameKind::RpcRequest => RpcRequest::decode(payload).map(Frame::RpcRequest),
            FrameKind::RpcResponse => RpcResponse::decode(payload).map(Frame::RpcResponse),
            FrameKind::Telemetry => Telemetry::decode(payload).map(Frame::Telemetry),
            FrameKind::ThroughputControl => {
                ThroughputControl::decode(payload).map(Frame::ThroughputControl)
            }
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Frame::RpcRequest(f) => f.encode_payload(),
            Frame::RpcResponse(f) => f.encode_payload(),
            Frame::Telemetry(f) => f.encode_payload(),
            Frame::ThroughputControl(f) => f.encode_payload(),
        }
    }
}

/// CRC-32 (IEEE) over the frame body: type tag, length field, payload.
pub(crate) fn frame_crc(tag: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&(payload.len() as u16).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn i16_at(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn u64_at(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}
