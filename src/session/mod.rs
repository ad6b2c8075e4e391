//! Transport session: exclusive owner of the gateway byte stream.
//!
//! One read task per session pulls bytes from the stream, feeds the framing
//! codec, and routes every decoded frame in read order: RPC responses
//! resolve pending calls, telemetry payloads decode into records for
//! subscribers, throughput echoes feed the active probe. Writes from any
//! task serialize behind one async mutex so frames never interleave on the
//! wire. No other component touches the stream.
//!
//! Corruption and unknown telemetry are absorbed (logged and counted); read
//! or write I/O failure is fatal to the session, failing pending calls and
//! ending subscriber streams. Reconnection is the caller's job.


use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{LinkError, Result};
use crate::probe::{self, ProbeConfig, ProbeRegistry, ThroughputSample};
use crate::router::{TelemetryRouter, TelemetryStream};
use crate::rpc::{RpcDispatcher, RpcReply};
use crate::tdf::{TdfReader, TdfRecord, TdfRegistry};
use crate::wire::{Frame, FrameCodec, FramingStats};

const READ_CHUNK: usize = 4096;

/// Session tuning, constructed by the caller (typically the CLI).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time one RPC attempt may wait for its response.
    pub rpc_timeout: Duration,
    /// Re-sends after the first attempt before a call times out.
    pub max_retries: u32,
    /// Telemetry records buffered per subscriber before oldest-drop kicks
    /// in. Clamped to at least 1.
    pub telemetry_capacity: usize,
    /// How long a throughput probe keeps collecting echoes after its send
    /// window closes.
    pub probe_drain: Duration,
    /// Definition registry for telemetry decoding; definitions it does not
    /// know surface as raw records.
    pub registry: Arc<TdfRegistry>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(1),
            max_retries: 2,
            telemetry_capacity: 256,
            probe_drain: Duration::from_millis(250),
            registry: Arc::new(TdfRegistry::new()),
        }
    }
}

impl SessionConfig {
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_telemetry_capacity(mut self, capacity: usize) -> Self {
        self.telemetry_capacity = capacity;
        self
    }

    pub fn with_probe_drain(mut self, window: Duration) -> Self {
        self.probe_drain = window;
        self
    }

    pub fn with_registry(mut self, registry: Arc<TdfRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

/// Point-in-time counters for one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub framing: FramingStats,
    /// Telemetry records decoded and routed.
    pub telemetry_records: u64,
    /// Telemetry records dropped by schema decode failures.
    pub decode_errors: u64,
    /// Host-bound RPC requests received and ignored.
    pub inbound_requests: u64,
}

/// State shared between the session handle and its read task.
pub(crate) struct Shared {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pub(crate) rpc: RpcDispatcher,
    router: TelemetryRouter,
    pub(crate) probe: ProbeRegistry,
    cancel: CancellationToken,
    failure: Mutex<Option<String>>,
    telemetry_records: AtomicU64,
    decode_errors: AtomicU64,
    inbound_requests: AtomicU64,
    config: SessionConfig,
}

impl Shared {
    /// Encodes and writes one frame. The writer mutex is the single point
    /// where concurrent senders serialize.
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.closed_error().await);
        }
        let bytes = frame.encode()?;
        let mut writer = self.writer.lock().await;
        let wrote = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        drop(writer);
        match wrote {
            Ok(()) => {
                trace!("sent {} frame, {} bytes on the wire", frame.kind().name(), bytes.len());
                Ok(())
            }
            Err(err) => {
                let reason = format!("write failed: {err}");
                error!("session transport failed: {reason}");
                self.shutdown(Some(reason.clone())).await;
                Err(LinkError::transport_with_source(reason, err))
            }
        }
    }

    /// The error operations on a dead session get: the recorded transport
    /// failure if there was one, otherwise plain cancellation.
    pub(crate) async fn closed_error(&self) -> LinkError {
        match self.failure.lock().await.clone() {
            Some(reason) => LinkError::transport(reason),
            None => LinkError::Cancelled,
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Tears the session down: records the failure (first one wins), stops
    /// the read task, ends subscriber streams, fails pending calls, clears
    /// the probe slot. Safe to call more than once.
    pub(crate) async fn shutdown(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            let mut failure = self.failure.lock().await;
            if failure.is_none() {
                *failure = Some(reason);
            }
        }
        self.cancel.cancel();
        let failure = self.failure.lock().await.clone();
        self.rpc
            .fail_all(move || match &failure {
                Some(reason) => LinkError::transport(reason.clone()),
                None => LinkError::Cancelled,
            })
            .await;
        self.probe.clear().await;
    }

    /// Exhaustive classification of one decoded frame.
    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::RpcResponse(response) => {
                let correlation = response.correlation;
                let reply = RpcReply {
                    device: response.device,
                    status: response.status,
                    data: response.data,
                };
                if !self.rpc.resolve(correlation, reply).await {
                    debug!(
                        "discarding rpc response with no pending call (correlation {correlation})"
                    );
                }
            }
            Frame::Telemetry(telemetry) => {
                let reader = TdfReader::new(
                    self.config.registry.as_ref(),
                    telemetry.device,
                    &telemetry.records,
                );
                for item in reader {
                    match item {
                        Ok(record) => {
                            self.telemetry_records.fetch_add(1, Ordering::Relaxed);
                            self.router.publish(record);
                        }
                        Err(err) => {
                            self.decode_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                "dropping telemetry record from device {}: {err}",
                                telemetry.device
                            );
                        }
                    }
                }
            }
            Frame::ThroughputControl(echo) => {
                self.probe.deliver(echo.seq, echo.payload_len()).await;
            }
            Frame::RpcRequest(request) => {
                self.inbound_requests.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "ignoring host-bound rpc request (device {}, method {}, correlation {})",
                    request.device, request.method, request.correlation
                );
            }
        }
    }
}

/// Exclusive owner of one duplex gateway stream.
///
/// All RPC, telemetry, and probe traffic multiplexes over the single stream.
/// Dropping the session cancels its read task; [`Session::close`] does the
/// same and additionally resolves pending calls right away.
pub struct Session {
    shared: Arc<Shared>,
    framing: watch::Receiver<FramingStats>,
}

impl Session {
    /// Connects to a gateway over TCP and attaches a session to the stream.
    pub async fn connect(addr: impl ToSocketAddrs, config: SessionConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        if let Ok(peer) = stream.peer_addr() {
            info!("connected to gateway at {peer}");
        }
        Ok(Self::attach(stream, config))
    }

    /// Takes exclusive ownership of any duplex byte stream and spawns the
    /// session's read task. Must be called inside a tokio runtime.
    pub fn attach<S>(stream: S, config: SessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let cancel = CancellationToken::new();
        let (stats_tx, stats_rx) = watch::channel(FramingStats::default());
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            rpc: RpcDispatcher::new(),
            router: TelemetryRouter::new(config.telemetry_capacity, cancel.clone()),
            probe: ProbeRegistry::new(),
            cancel,
            failure: Mutex::new(None),
            telemetry_records: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            inbound_requests: AtomicU64::new(0),
            config,
        });
        tokio::spawn(read_loop(Box::new(reader), Arc::clone(&shared), stats_tx));
        Self { shared, framing: stats_rx }
    }

    /// Issues an RPC with the session's configured timeout and retry budget.
    pub async fn call(&self, device: u64, method: u16, args: Vec<u8>) -> Result<RpcReply> {
        let config = &self.shared.config;
        self.call_with(device, method, args, config.rpc_timeout, config.max_retries).await
    }

    /// Issues an RPC with an explicit per-attempt timeout and retry budget.
    ///
    /// A retry re-sends the same correlation ID with a fresh clock;
    /// `max_retries = 2` means at most three sends.
    pub async fn call_with(
        &self,
        device: u64,
        method: u16,
        args: Vec<u8>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<RpcReply> {
        self.shared.rpc.call(&self.shared, device, method, args, timeout, max_retries).await
    }

    /// Subscribes to decoded telemetry records matching `filter`.
    ///
    /// The stream ends when the session closes or fails.
    pub fn subscribe<F>(&self, filter: F) -> TelemetryStream
    where
        F: Fn(&TdfRecord) -> bool + Send + Sync + 'static,
    {
        self.shared.router.subscribe(Box::new(filter))
    }

    /// Subscribes to every decoded telemetry record.
    pub fn subscribe_all(&self) -> TelemetryStream {
        self.subscribe(|_| true)
    }

    /// Subscribes to records of a single definition.
    pub fn subscribe_definition(&self, definition: u16) -> TelemetryStream {
        self.subscribe(move |record| record.definition == definition)
    }

    /// Measures link throughput with synthetic echo frames.
    ///
    /// One probe at a time per session; a concurrent attempt fails fast with
    /// [`LinkError::ProbeBusy`]. RPC and telemetry traffic continue
    /// unaffected while the probe runs.
    pub async fn probe(&self, config: ProbeConfig) -> Result<ThroughputSample> {
        probe::run(&self.shared, &config, self.shared.config.probe_drain).await
    }

    /// Sends a pre-built frame on the shared write path.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.shared.send_frame(frame).await
    }

    /// Closes the session: stops the read task, fails pending calls with
    /// [`LinkError::Cancelled`], ends subscriber streams. Idempotent.
    pub async fn close(&self) {
        if !self.shared.cancel.is_cancelled() {
            debug!("closing session");
        }
        self.shared.shutdown(None).await;
    }

    /// Whether the session has been closed or has failed.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// The terminal transport failure, if one occurred.
    pub async fn failure(&self) -> Option<String> {
        self.shared.failure.lock().await.clone()
    }

    /// Counter snapshot for diagnostics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            framing: *self.framing.borrow(),
            telemetry_records: self.shared.telemetry_records.load(Ordering::Relaxed),
            decode_errors: self.shared.decode_errors.load(Ordering::Relaxed),
            inbound_requests: self.shared.inbound_requests.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("dropping session");
        self.shared.cancel.cancel();
    }
}

/// The session's single read task. Owns the read half until cancellation,
/// EOF, or I/O failure, then tears the session down.
async fn read_loop(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    shared: Arc<Shared>,
    stats_tx: watch::Sender<FramingStats>,
) {
    debug!("session read task started");
    let mut codec = FrameCodec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut frames_seen = 0u64;

    let failure = loop {
        let read = tokio::select! {
            _ = shared.cancel.cancelled() => break None,
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break Some("connection closed by peer".to_string()),
            Ok(n) => {
                trace!("read {n} bytes");
                let frames: Vec<Frame> = codec.feed(&chunk[..n]).collect();
                stats_tx.send_replace(codec.stats());
                for frame in frames {
                    frames_seen += 1;
                    shared.dispatch(frame).await;
                }
            }
            Err(err) => break Some(format!("read failed: {err}")),
        }
    };

    match &failure {
        Some(reason) => error!("session transport failed: {reason}"),
        None => debug!("session read task cancelled"),
    }
    shared.shutdown(failure).await;
    debug!("session read task ended, {frames_seen} frames dispatched");
}
