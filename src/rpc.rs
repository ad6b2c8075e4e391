//! RPC correlation, timeouts, and retries.
//!
//! Each call registers a oneshot result slot under a fresh correlation ID
//! before its request frame goes out; the session's read task resolves the
//! slot when the matching response arrives. The calling task suspends on its
//! own slot only, so concurrent calls never gate each other and the read
//! loop never waits on a caller.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::error::{LinkError, Result};
use crate::session::Shared;
use crate::wire::{Frame, RpcRequest};

/// Result of a successful RPC round trip.
///
/// `status` is the device's return code verbatim; nonzero values are device
/// errors whose meaning depends on the firmware, so they are surfaced rather
/// than mapped to a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    pub device: u64,
    pub status: i16,
    pub data: Vec<u8>,
}

impl RpcReply {
    /// True when the device reported success.
    pub fn ok(&self) -> bool {
        self.status == 0
    }
}

type Slot = oneshot::Sender<Result<RpcReply>>;

struct PendingCalls {
    next_id: u32,
    slots: HashMap<u32, Slot>,
}

/// Correlates outgoing requests with incoming responses.
///
/// Owns the correlation counter: IDs are unique among in-flight calls, and
/// a retry re-sends under the same ID so a slow first response still finds
/// its caller.
pub(crate) struct RpcDispatcher {
    pending: Mutex<PendingCalls>,
}

impl RpcDispatcher {
    pub(crate) fn new() -> Self {
        Self { pending: Mutex::new(PendingCalls { next_id: 1, slots: HashMap::new() }) }
    }

    /// Allocates the next correlation ID and registers its result slot.
    /// Wraparound skips zero and any ID still pending.
    async fn register(&self) -> (u32, oneshot::Receiver<Result<RpcReply>>) {
        let mut pending = self.pending.lock().await;
        let mut id = pending.next_id;
        while id == 0 || pending.slots.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        pending.next_id = id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        pending.slots.insert(id, tx);
        (id, rx)
    }

    async fn remove(&self, correlation: u32) {
        self.pending.lock().await.slots.remove(&correlation);
    }

    /// Routes a response to its pending call. Returns false when nothing is
    /// pending under that ID (late or duplicate response).
    pub(crate) async fn resolve(&self, correlation: u32, reply: RpcReply) -> bool {
        let slot = self.pending.lock().await.slots.remove(&correlation);
        match slot {
            Some(tx) => {
                if tx.send(Ok(reply)).is_err() {
                    debug!("rpc caller gone before its response (correlation {correlation})");
                }
                true
            }
            None => false,
        }
    }

    /// Fails every pending call, at close or on transport failure.
    pub(crate) async fn fail_all(&self, make_error: impl Fn() -> LinkError) {
        let slots: Vec<Slot> = {
            let mut pending = self.pending.lock().await;
            pending.slots.drain().map(|(_, tx)| tx).collect()
        };
        if !slots.is_empty() {
            debug!("failing {} pending rpc calls", slots.len());
        }
        for tx in slots {
            let _ = tx.send(Err(make_error()));
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.lock().await.slots.len()
    }

    /// Full call cycle: send the request, await its response, retry on
    /// timeout with the same correlation ID and a fresh clock.
    pub(crate) async fn call(
        &self,
        shared: &Shared,
        device: u64,
        method: u16,
        args: Vec<u8>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<RpcReply> {
        let (correlation, mut rx) = self.register().await;
        let frame = Frame::RpcRequest(RpcRequest { correlation, device, method, args });
        let started = Instant::now();

        for attempt in 0..=max_retries {
            if attempt > 0 {
                debug!(
                    "rpc retry {attempt}/{max_retries} (device {device}, method {method}, correlation {correlation})"
                );
            }
            if let Err(err) = shared.send_frame(&frame).await {
                self.remove(correlation).await;
                return Err(err);
            }
            match tokio::time::timeout(timeout, &mut rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => {
                    // Slot dropped without a value; the session is gone.
                    self.remove(correlation).await;
                    return Err(LinkError::Cancelled);
                }
                Err(_) => {}
            }
        }

        self.remove(correlation).await;
        warn!(
            "rpc call timed out after {} attempts (device {device}, method {method}, correlation {correlation})",
            max_retries + 1
        );
        Err(LinkError::Timeout { attempts: max_retries + 1, elapsed: started.elapsed() })
    }
}
