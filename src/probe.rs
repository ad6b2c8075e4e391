//! Link throughput probing with synthetic echo frames.
//!
//! A probe sends fixed-size throughput-control frames at a steady interval
//! for a configured window and matches the gateway's echoes back to their
//! sequence numbers. Echoes ride the same stream as RPC and telemetry, so a
//! probe measures the link as the application actually uses it. One probe
//! runs per session at a time; the sequence ledger has no meaning across
//! overlapping runs.

use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{LinkError, Result};
use crate::session::Shared;
use crate::wire::{Frame, MAX_PAYLOAD_LEN, ThroughputControl};

/// Bytes of every probe payload taken by the sequence number.
const SEQ_PREFIX_LEN: usize = 4;

/// Shape of one throughput probe run.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Length of the send window.
    pub duration: Duration,
    /// Wire payload bytes per probe frame, sequence number included.
    pub payload_size: usize,
    /// Gap between probe frames.
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(2),
            payload_size: 256,
            interval: Duration::from_millis(10),
        }
    }
}

impl ProbeConfig {
    fn validate(&self) -> Result<()> {
        if self.payload_size < SEQ_PREFIX_LEN || self.payload_size > MAX_PAYLOAD_LEN {
            return Err(LinkError::config(
                "probe payload size",
                format!("{} is outside {SEQ_PREFIX_LEN}..={MAX_PAYLOAD_LEN}", self.payload_size),
            ));
        }
        if self.duration.is_zero() {
            return Err(LinkError::config("probe duration", "must be nonzero"));
        }
        if self.interval.is_zero() {
            return Err(LinkError::config("probe interval", "must be nonzero"));
        }
        Ok(())
    }
}

/// Ledger of one finished probe run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThroughputSample {
    /// Probe payload bytes sent during the window.
    pub bytes_sent: u64,
    /// Probe payload bytes echoed back, drain period included.
    pub bytes_acked: u64,
    /// Probe frames sent during the window.
    pub frames_sent: u64,
    /// Probe frames echoed back exactly once.
    pub frames_acked: u64,
    /// Length of the send window as measured.
    pub elapsed: Duration,
    /// Frames whose echo never arrived.
    pub lost: u64,
}

impl ThroughputSample {
    /// Acked payload bytes per second over the send window.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_acked as f64 / secs
    }

    /// Fraction of sent frames that were never echoed, in `0.0..=1.0`.
    pub fn loss_ratio(&self) -> f64 {
        if self.frames_sent == 0 {
            return 0.0;
        }
        self.lost as f64 / self.frames_sent as f64
    }
}

/// An echoed probe frame as seen by the read task.
#[derive(Debug, Clone, Copy)]
struct Echo {
    seq: u32,
    payload_len: usize,
}

/// Slot enforcing one probe run per session. The read task hands echoes to
/// whichever run holds the slot.
pub(crate) struct ProbeRegistry {
    active: Mutex<Option<mpsc::UnboundedSender<Echo>>>,
}

impl ProbeRegistry {
    pub(crate) fn new() -> Self {
        Self { active: Mutex::new(None) }
    }

    async fn begin(&self) -> Result<mpsc::UnboundedReceiver<Echo>> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(LinkError::ProbeBusy);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *active = Some(tx);
        Ok(rx)
    }

    pub(crate) async fn clear(&self) {
        *self.active.lock().await = None;
    }

    /// Routes one echo to the active run, if any.
    pub(crate) async fn deliver(&self, seq: u32, payload_len: usize) {
        match self.active.lock().await.as_ref() {
            Some(tx) => {
                let _ = tx.send(Echo { seq, payload_len });
            }
            None => debug!("ignoring probe echo with no probe running (seq {seq})"),
        }
    }
}

/// Runs one probe on a session, failing fast with [`LinkError::ProbeBusy`]
/// if another run already holds the slot.
pub(crate) async fn run(
    shared: &Shared,
    config: &ProbeConfig,
    drain: Duration,
) -> Result<ThroughputSample> {
    config.validate()?;
    let echoes = shared.probe.begin().await?;
    let result = drive(shared, config, drain, echoes).await;
    shared.probe.clear().await;
    result
}

async fn drive(
    shared: &Shared,
    config: &ProbeConfig,
    drain: Duration,
    mut echoes: mpsc::UnboundedReceiver<Echo>,
) -> Result<ThroughputSample> {
    info!(
        "probe started: {} byte payloads every {:?} for {:?}",
        config.payload_size, config.interval, config.duration
    );
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(config.duration);
    tokio::pin!(deadline);

    let started = std::time::Instant::now();
    let mut acked: Vec<bool> = Vec::new();
    let mut sample = ThroughputSample::default();

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = shared.cancel_token().cancelled() => return Err(shared.closed_error().await),
            _ = ticker.tick() => {
                let frame = Frame::ThroughputControl(ThroughputControl::sized(
                    acked.len() as u32,
                    config.payload_size,
                ));
                shared.send_frame(&frame).await?;
                acked.push(false);
                sample.frames_sent += 1;
                sample.bytes_sent += config.payload_size as u64;
            }
            echo = echoes.recv() => match echo {
                Some(echo) => note_echo(&mut acked, &mut sample, echo),
                None => return Err(shared.closed_error().await),
            },
        }
    }
    sample.elapsed = started.elapsed();

    // Echoes already in flight keep arriving after the send window closes.
    let drain_deadline = tokio::time::sleep(drain);
    tokio::pin!(drain_deadline);
    loop {
        tokio::select! {
            _ = &mut drain_deadline => break,
            _ = shared.cancel_token().cancelled() => break,
            echo = echoes.recv() => match echo {
                Some(echo) => note_echo(&mut acked, &mut sample, echo),
                None => break,
            },
        }
    }

    sample.lost = sample.frames_sent - sample.frames_acked;
    info!(
        "probe finished: {}/{} frames echoed, {:.0} bytes/s",
        sample.frames_acked, sample.frames_sent, sample.throughput()
    );
    Ok(sample)
}

/// Credits one echo against the send ledger. Duplicates and unknown
/// sequence numbers change nothing.
fn note_echo(acked: &mut [bool], sample: &mut ThroughputSample, echo: Echo) {
    match acked.get_mut(echo.seq as usize) {
        Some(slot) if !*slot => {
            *slot = true;
            sample.frames_acked += 1;
            sample.bytes_acked += echo.payload_len as u64;
        }
        Some(_) => debug!("duplicate probe echo (seq {})", echo.seq),
        None => debug!("probe echo for unknown sequence {}", echo.seq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        assert!(ProbeConfig::default().validate().is_ok());
    }

    #[test]
    fn undersized_and_oversized_payloads_are_rejected() {
        let tiny = ProbeConfig { payload_size: SEQ_PREFIX_LEN - 1, ..ProbeConfig::default() };
        assert!(matches!(tiny.validate(), Err(LinkError::Config { .. })));

        let huge = ProbeConfig { payload_size: MAX_PAYLOAD_LEN + 1, ..ProbeConfig::default() };
        assert!(matches!(huge.validate(), Err(LinkError::Config { .. })));
    }

    #[test]
    fn zero_windows_are_rejected() {
        let config = ProbeConfig { duration: Duration::ZERO, ..ProbeConfig::default() };
        assert!(config.validate().is_err());

        let config = ProbeConfig { interval: Duration::ZERO, ..ProbeConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn throughput_and_loss_come_from_the_ledger() {
        let sample = ThroughputSample {
            bytes_sent: 4000,
            bytes_acked: 3000,
            frames_sent: 4,
            frames_acked: 3,
            elapsed: Duration::from_secs(2),
            lost: 1,
        };
        assert!((sample.throughput() - 1500.0).abs() < f64::EPSILON);
        assert!((sample.loss_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_sample_reports_zero_rates() {
        let sample = ThroughputSample::default();
        assert_eq!(sample.throughput(), 0.0);
        assert_eq!(sample.loss_ratio(), 0.0);
    }

    #[test]
    fn duplicate_and_unknown_echoes_are_not_credited() {
        let mut acked = vec![false, false];
        let mut sample = ThroughputSample::default();

        note_echo(&mut acked, &mut sample, Echo { seq: 1, payload_len: 64 });
        note_echo(&mut acked, &mut sample, Echo { seq: 1, payload_len: 64 });
        note_echo(&mut acked, &mut sample, Echo { seq: 9, payload_len: 64 });

        assert_eq!(sample.frames_acked, 1);
        assert_eq!(sample.bytes_acked, 64);
        assert!(acked[1] && !acked[0]);
    }
}
