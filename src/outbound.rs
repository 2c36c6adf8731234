//! Outbound message buffering and relay.
//!
//! Complete reassembled payloads wait in [`OutboundQueue`] until the relay
//! timer fires. A flush joins everything buffered into one request; single
//! payloads are held back one cycle to avoid chatty one-message round trips.
//! The snapshot-and-clear is atomic with respect to concurrent enqueues, so
//! each payload is relayed at most once: a failed relay loses its batch by
//! design rather than requeueing it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::channel::Channel;
use crate::status::{LinkStatus, StatusSender};
use crate::telemetry::{Event, TelemetryReporter};
use crate::transport::Transport;

/// Cadence of the relay flush task.
pub(crate) const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Payloads are joined with this literal separator before transmission.
pub(crate) const BATCH_SEPARATOR: &[u8] = b"&==&";

/// A flush is skipped below this many buffered payloads.
pub(crate) const MIN_BATCH: usize = 2;

/// Buffer of complete payloads awaiting relay.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: Mutex<Vec<Vec<u8>>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload. Empty payloads are dropped.
    pub fn enqueue(&self, payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(payload);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically take the whole buffer if it holds at least `min` payloads.
    pub(crate) fn take_batch(&self, min: usize) -> Option<Vec<Vec<u8>>> {
        let mut pending = self.pending.lock().ok()?;
        if pending.len() < min {
            return None;
        }
        Some(std::mem::take(&mut *pending))
    }
}

/// Join payloads with [`BATCH_SEPARATOR`].
pub(crate) fn join_payloads(payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut joined = Vec::with_capacity(
        payloads.iter().map(Vec::len).sum::<usize>()
            + BATCH_SEPARATOR.len() * payloads.len().saturating_sub(1),
    );
    for (index, payload) in payloads.iter().enumerate() {
        if index > 0 {
            joined.extend_from_slice(BATCH_SEPARATOR);
        }
        joined.extend_from_slice(payload);
    }
    joined
}

/// Periodically relays buffered payloads and routes the acknowledgement back
/// to the peripheral.
pub struct SyncRelay {
    queue: Arc<OutboundQueue>,
    backend: Arc<dyn Backend>,
    transport: Arc<dyn Transport>,
    reporter: TelemetryReporter,
    status: StatusSender,
}

impl SyncRelay {
    pub(crate) fn new(
        queue: Arc<OutboundQueue>,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn Transport>,
        reporter: TelemetryReporter,
        status: StatusSender,
    ) -> Self {
        Self { queue, backend, transport, reporter, status }
    }

    /// Spawn the flush timer task. Runs until cancelled.
    pub(crate) fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("relay flush task cancelled");
                        break;
                    }
                    _ = ticker.tick() => self.flush().await,
                }
            }
        })
    }

    /// Relay everything buffered, if the batch minimum is met.
    pub(crate) async fn flush(&self) {
        let Some(batch) = self.queue.take_batch(MIN_BATCH) else {
            return;
        };
        let joined = join_payloads(&batch);
        debug!("relaying batch of {} payloads ({} bytes)", batch.len(), joined.len());

        match self.backend.relay_device_messages(&joined).await {
            Ok(ack) => self.route_ack(&ack).await,
            Err(err) => {
                // The batch is gone; only the failure is recorded.
                warn!("relay failed, {} payloads lost: {err}", batch.len());
                self.reporter.record(Event::Failure(format!("failed to send msgs to API: {err}")));
                self.status.emit(LinkStatus::Failure(format!("message relay failed: {err}")));
            }
        }
    }

    async fn route_ack(&self, ack: &[u8]) {
        if let Err(err) = self.transport.write(Channel::StatusAck, ack, true).await {
            self.reporter.record(Event::FailedToWrite(err.to_string()));
        }
    }
}
