//! Error types for the gateway link.
//!
//! Three layers mirror how failures propagate through the link:
//!
//! - **Framing errors**: corruption or oversize conditions in the raw byte
//!   stream. Always recoverable; the codec resynchronizes and counts them.
//! - **Decode errors**: a telemetry record that does not match its schema.
//!   The record is dropped and logged; the stream continues.
//! - **Link errors**: everything surfaced to callers: RPC timeouts,
//!   cancellation on session close, and fatal transport failures.
//!
//! ## Recovery
//!
//! ```rust
//! use downlink::LinkError;
//!
//! let err = LinkError::transport("gateway connection reset");
//! if !err.is_recoverable() {
//!     // close the session and reconnect
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for link operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Errors raised while delimiting frames in the byte stream.
///
/// These never terminate a session: the codec discards the damaged bytes,
/// scans forward for the next sync marker, and records the event in its
/// stats counters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FramingError {
    #[error("payload length {length} exceeds the {max} byte maximum")]
    Oversize { length: usize, max: usize },

    #[error("checksum mismatch: frame carries {received:#010x}, computed {computed:#010x}")]
    Checksum { received: u32, computed: u32 },

    #[error("unknown frame type tag {tag:#04x}")]
    UnknownType { tag: u8 },

    #[error("{kind} payload too short: {len} bytes")]
    ShortPayload { kind: &'static str, len: usize },
}

/// Errors raised while decoding TDF records from a telemetry payload.
///
/// A truncation ends decoding of the payload it occurred in; a width or
/// field-level mismatch skips only the offending record. Either way the
/// session keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("payload truncated reading {what}: need {needed} bytes, {remaining} remain")]
    Truncated { what: &'static str, needed: usize, remaining: usize },

    #[error("record data is {actual} bytes but schema `{schema}` expects {expected}")]
    WidthMismatch { schema: String, expected: usize, actual: usize },

    #[error("length prefix {declared} for field `{field}` exceeds {remaining} remaining bytes")]
    LengthOverrun { field: String, declared: usize, remaining: usize },

    #[error("field `{field}` is not valid UTF-8")]
    InvalidUtf8 { field: String },
}

/// Main error type for session, RPC and probe operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("framing: {0}")]
    Framing(#[from] FramingError),

    #[error("telemetry decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("rpc call timed out after {attempts} attempts over {elapsed:?}")]
    Timeout { attempts: u32, elapsed: Duration },

    #[error("session closed while the operation was pending")]
    Cancelled,

    #[error("transport failed: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("a throughput probe is already running on this session")]
    ProbeBusy,

    #[error("invalid {what}: {details}")]
    Config { what: &'static str, details: String },
}

impl LinkError {
    /// Helper constructor for transport failures without an I/O source.
    pub fn transport(reason: impl Into<String>) -> Self {
        LinkError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport failures wrapping an I/O error.
    pub fn transport_with_source(reason: impl Into<String>, source: std::io::Error) -> Self {
        LinkError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for invalid configuration or arguments.
    pub fn config(what: &'static str, details: impl Into<String>) -> Self {
        LinkError::Config { what, details: details.into() }
    }

    /// Returns whether the session survives this error.
    ///
    /// Framing and decode errors are absorbed by the link itself; a timed-out
    /// call may simply be issued again. Cancellation and transport failures
    /// mean the session is gone and the caller must reopen it.
    pub fn is_recoverable(&self) -> bool {
        match self {
            LinkError::Framing(_) => true,
            LinkError::Decode(_) => true,
            LinkError::Timeout { .. } => true,
            LinkError::ProbeBusy => true,
            LinkError::Cancelled => false,
            LinkError::Transport { .. } => false,
            LinkError::Config { .. } => false,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Transport { reason: err.kind().to_string(), source: Some(err) }
    }
}
