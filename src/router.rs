//! Telemetry distribution to subscribers.
//!
//! The session's read task publishes every decoded record here once;
//! subscribers each see the records matching their predicate, in arrival
//! order. Delivery is decoupled from the read loop by a bounded broadcast
//! queue: a subscriber that stops polling loses the oldest queued records
//! rather than stalling the link, and the loss is logged and counted on its
//! stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Future, Stream, ready};
use pin_project_lite::pin_project;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::warn;

use crate::tdf::TdfRecord;

type Predicate = Box<dyn Fn(&TdfRecord) -> bool + Send + Sync>;

/// Fan-out point between the read task and subscriber streams.
pub(crate) struct TelemetryRouter {
    tx: broadcast::Sender<Arc<TdfRecord>>,
    cancel: CancellationToken,
}

impl TelemetryRouter {
    pub(crate) fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, cancel }
    }

    /// Fire-and-forget: a send with no live subscriber is not an error.
    pub(crate) fn publish(&self, record: TdfRecord) {
        let _ = self.tx.send(Arc::new(record));
    }

    pub(crate) fn subscribe(&self, filter: Predicate) -> TelemetryStream {
        TelemetryStream {
            inner: BroadcastStream::new(self.tx.subscribe()),
            closed: self.cancel.clone().cancelled_owned(),
            filter,
            lagged: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pin_project! {
    /// Stream of telemetry records matching one subscription's predicate.
    ///
    /// Ends when the session closes or fails. Records the subscriber was too
    /// slow to take are dropped oldest-first; [`TelemetryStream::lagged`]
    /// counts them.
    pub struct TelemetryStream {
        #[pin]
        inner: BroadcastStream<Arc<TdfRecord>>,
        #[pin]
        closed: WaitForCancellationFutureOwned,
        filter: Predicate,
        lagged: u64,
    }
}

impl TelemetryStream {
    /// Records this subscriber missed to the overflow policy.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}

impl Stream for TelemetryStream {
    type Item = Arc<TdfRecord>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if this.closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(record)) => {
                    if (this.filter)(record.as_ref()) {
                        return Poll::Ready(Some(record));
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    *this.lagged += missed;
                    warn!("telemetry subscriber lagging, dropped {missed} oldest records");
                }
                None => return Poll::Ready(None),
            }
        }
    }
}
