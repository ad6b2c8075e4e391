//! Binary frame layout and the streaming codec.
//!
//! ## Wire format, version 1
//!
//! ```text
//! offset  size  field
//! 0       2     sync marker 0xD5 0xCA
//! 2       1     frame type tag (1 rpc-request, 2 rpc-response,
//!               3 telemetry, 4 throughput-control)
//! 3       2     payload length, u16 little-endian, at most 4096
//! 5       n     payload
//! 5+n     4     CRC-32 (IEEE) over bytes 2..5+n, u32 little-endian
//! ```
//!
//! The sync marker matches the serial framing spoken by gateway firmware;
//! the type tag and CRC trailer are additions of this protocol version. All
//! multi-byte fields are little-endian. A frame whose CRC does not validate
//! is discarded and the stream is rescanned from the byte after its sync
//! marker, so line corruption costs at most one frame.

mod codec;
mod frame;

pub use codec::{FrameCodec, Frames, FramingStats};
pub use frame::{
    Frame, FrameKind, MAX_PAYLOAD_LEN, MIN_FRAME_LEN, RpcRequest, RpcResponse, SYNC, Telemetry,
    ThroughputControl,
};

/// Version of the frame layout implemented by this module.
pub const PROTOCOL_VERSION: u8 = 1;
