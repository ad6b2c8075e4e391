//! Async device link for field gateway deployments.
//!
//! Downlink speaks the framed binary protocol of sensor gateways over a
//! single duplex byte stream and multiplexes everything an operator console
//! needs on top of it: correlated RPC, decoded telemetry fan-out, and
//! in-band throughput probing.
//!
//! # Features
//!
//! - **Resilient framing**: CRC-32 trailers with resynchronization, so line
//!   corruption costs at most one frame
//! - **Schema-driven telemetry**: registry-based TDF decoding; unknown
//!   definitions survive as raw records instead of being dropped
//! - **Concurrent RPC**: correlation IDs, per-call timeouts, bounded retries
//! - **Link probing**: throughput measured on the live stream, alongside
//!   normal traffic
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use downlink::{Session, SessionConfig};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::connect("10.40.0.2:7700", SessionConfig::default()).await?;
//!
//!     let telemetry = session.subscribe_all();
//!     tokio::spawn(async move {
//!         let mut telemetry = Box::pin(telemetry);
//!         while let Some(record) = telemetry.next().await {
//!             println!("device {} definition {}", record.device, record.definition);
//!         }
//!     });
//!
//!     let reply = session.call(0x21, 4, Vec::new()).await?;
//!     println!("device replied with status {}", reply.status);
//!     Ok(())
//! }
//! ```

mod error;
mod router;

pub mod probe;
pub mod rpc;
pub mod session;
pub mod tdf;
pub mod wire;

pub use error::{DecodeError, FramingError, LinkError, Result};
pub use probe::{ProbeConfig, ThroughputSample};
pub use router::TelemetryStream;
pub use rpc::RpcReply;
pub use session::{Session, SessionConfig, SessionStats};
pub use tdf::{
    DeviceTime, FieldDef, FieldKind, FieldValue, RecordBody, TdfRecord, TdfRegistry, TdfSchema,
};
pub use wire::{Frame, FrameKind, PROTOCOL_VERSION};
