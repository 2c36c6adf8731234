//! Chunked firmware push protocol.
//!
//! One job at a time: fetch the full image from the update URL, write it to
//! the firmware channel in fixed-size chunks, and gate every chunk on the
//! transport's write confirmation with a bounded wait. A missing
//! confirmation aborts the job: there is no resume; a fresh update
//! notification restarts from chunk zero. Disconnection cancels the job
//! before the next write.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::channel::{Channel, END_MARKER};
use crate::error::{Result, SyncError};
use crate::status::{LinkStatus, StatusSender};
use crate::telemetry::{Event, TelemetryReporter};
use crate::transport::Transport;

/// Firmware images are pushed in chunks of this many bytes.
pub(crate) const CHUNK_SIZE: usize = 500;

/// Bounded wait for each chunk's write confirmation.
pub(crate) const ACK_TIMEOUT: Duration = Duration::from_secs(6);

/// A progress event is emitted every this many chunks.
const PROGRESS_EVERY: usize = 200;

/// Interpret a firmware-channel payload as an update URL.
///
/// Valid means: UTF-8, contains "http", and parses as a URL. Tested only
/// after the serial interpretation has been ruled out.
pub(crate) fn parse_update_url(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?;
    if !text.contains("http") {
        return None;
    }
    reqwest::Url::parse(text).ok()?;
    Some(text.to_string())
}

struct ActiveJob {
    id: u64,
    cancel: CancellationToken,
    ack_tx: mpsc::Sender<()>,
    awaiting_ack: Arc<AtomicBool>,
}

/// Drives firmware update jobs. Cheap to clone; clones share the single
/// job slot.
#[derive(Clone)]
pub struct FirmwareTransfer {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    transport: Arc<dyn Transport>,
    reporter: TelemetryReporter,
    status: StatusSender,
    active: Mutex<Option<ActiveJob>>,
    next_id: AtomicU64,
}

impl FirmwareTransfer {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn Transport>,
        reporter: TelemetryReporter,
        status: StatusSender,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                transport,
                reporter,
                status,
                active: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a job currently occupies the slot.
    pub fn has_update_in_progress(&self) -> bool {
        self.inner.active.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Begin a transfer from `url` to the peripheral identified by `target`.
    ///
    /// Returns `false` without side effects when a job is already active;
    /// at most one job exists system-wide.
    pub fn start_update(&self, url: String, target: String) -> bool {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let awaiting_ack = Arc::new(AtomicBool::new(false));
        // Capacity one: at most one unacknowledged chunk at any time.
        let (ack_tx, ack_rx) = mpsc::channel(1);

        {
            let Ok(mut slot) = self.inner.active.lock() else { return false };
            if slot.is_some() {
                debug!("update already in progress, ignoring start for {url}");
                return false;
            }
            *slot = Some(ActiveJob {
                id,
                cancel: cancel.clone(),
                ack_tx,
                awaiting_ack: Arc::clone(&awaiting_ack),
            });
        }

        info!("starting firmware update from {url}");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result =
                run_job(&inner, &url, &target, &cancel, ack_rx, &awaiting_ack).await;
            // Free the slot before reporting, but only if it is still ours.
            if let Ok(mut slot) = inner.active.lock() {
                if slot.as_ref().is_some_and(|job| job.id == id) {
                    *slot = None;
                }
            }
            match result {
                Ok(chunks) => {
                    inner.reporter.record(Event::FirmwareUpdateFinished { chunks });
                }
                Err(SyncError::Cancelled) => {
                    inner
                        .reporter
                        .record(Event::Failure("firmware update cancelled".into()));
                }
                Err(err) => {
                    warn!("firmware update failed: {err}");
                    inner.reporter.record(Event::Failure(format!("firmware update: {err}")));
                    inner.status.emit(LinkStatus::Failure(format!("firmware update: {err}")));
                }
            }
        });
        true
    }

    /// Route a firmware-channel write confirmation to the waiting job.
    ///
    /// Ignored unless a job is active and currently awaiting one; this
    /// drops late or duplicate confirmations after cancellation.
    pub fn signal_ack(&self) {
        if let Ok(slot) = self.inner.active.lock() {
            if let Some(job) = slot.as_ref() {
                if job.awaiting_ack.load(Ordering::SeqCst) {
                    let _ = job.ack_tx.try_send(());
                }
            }
        }
    }

    /// Cancel the active job, if any. Pending work stops before the next
    /// chunk write; the pending-ack flag is cleared.
    pub fn cancel_active(&self) {
        if let Ok(mut slot) = self.inner.active.lock() {
            if let Some(job) = slot.take() {
                info!("cancelling active firmware job");
                job.awaiting_ack.store(false, Ordering::SeqCst);
                job.cancel.cancel();
            }
        }
    }
}

async fn run_job(
    inner: &Inner,
    url: &str,
    target: &str,
    cancel: &CancellationToken,
    mut ack_rx: mpsc::Receiver<()>,
    awaiting_ack: &AtomicBool,
) -> Result<usize> {
    let image = tokio::select! {
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        image = inner.backend.fetch_firmware_image(url) => image?,
    };
    debug!("fetched firmware image: {} bytes", image.len());

    let total = image.len().div_ceil(CHUNK_SIZE);
    for (index, chunk) in image.chunks(CHUNK_SIZE).enumerate() {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Drop confirmations left over from a previous chunk before arming
        // the wait for this one.
        while ack_rx.try_recv().is_ok() {}
        awaiting_ack.store(true, Ordering::SeqCst);

        inner.transport.write(Channel::Firmware, chunk, true).await?;
        if index % PROGRESS_EVERY == 0 {
            inner.reporter.record(Event::FirmwareChunkWritten {
                index,
                len: chunk.len(),
                target: target.to_string(),
            });
        }

        let waited = tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            outcome = tokio::time::timeout(ACK_TIMEOUT, ack_rx.recv()) => match outcome {
                Ok(Some(())) => Ok(()),
                // Sender dropped: the job slot was torn down underneath us.
                Ok(None) => Err(SyncError::Cancelled),
                Err(_) => Err(SyncError::ack_timeout(index, ACK_TIMEOUT)),
            },
        };
        awaiting_ack.store(false, Ordering::SeqCst);
        waited?;
    }

    // All chunks confirmed; the end marker finalizes the image on the device.
    inner.transport.write(Channel::Firmware, &[END_MARKER], true).await?;
    info!("firmware update complete: {total} chunks");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::OnceLock;

    struct ImageBackend {
        image: Vec<u8>,
    }

    #[async_trait]
    impl Backend for ImageBackend {
        async fn send_telemetry_batch(
            &self,
            _events: &[crate::telemetry::EventRecord],
        ) -> Result<()> {
            Ok(())
        }

        async fn relay_device_messages(&self, _joined: &[u8]) -> Result<Vec<u8>> {
            unimplemented!("not used by firmware tests")
        }

        async fn fetch_firmware_image(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.image.clone())
        }

        async fn resolve_dynamic_endpoint(&self, _gist_url: &str) -> Result<String> {
            unimplemented!("not used by firmware tests")
        }
    }

    /// Transport that confirms every firmware write synchronously, calling
    /// back into the transfer the way the session's event dispatch would.
    #[derive(Default)]
    struct AckingTransport {
        writes: Mutex<Vec<Vec<u8>>>,
        transfer: OnceLock<FirmwareTransfer>,
        acks_enabled: AtomicBool,
    }

    #[async_trait]
    impl Transport for AckingTransport {
        async fn scan(&self, _service_filter: &str) -> Result<()> {
            Ok(())
        }
        async fn stop_scan(&self) -> Result<()> {
            Ok(())
        }
        async fn connect(&self, _peripheral: &str) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn discover_services(&self) -> Result<()> {
            Ok(())
        }
        async fn discover_characteristics(&self, _service: &str) -> Result<()> {
            Ok(())
        }
        async fn write(&self, channel: Channel, bytes: &[u8], with_ack: bool) -> Result<()> {
            assert_eq!(channel, Channel::Firmware);
            assert!(with_ack);
            self.writes.lock().unwrap().push(bytes.to_vec());
            if self.acks_enabled.load(Ordering::SeqCst) {
                if let Some(transfer) = self.transfer.get() {
                    transfer.signal_ack();
                }
            }
            Ok(())
        }
    }

    fn transfer_over(
        image: &[u8],
        acks: bool,
    ) -> (FirmwareTransfer, Arc<AckingTransport>, TelemetryReporter) {
        let backend = Arc::new(ImageBackend { image: image.to_vec() });
        let transport = Arc::new(AckingTransport::default());
        transport.acks_enabled.store(acks, Ordering::SeqCst);
        let reporter = TelemetryReporter::new();
        let status = StatusSender::new(reporter.clone());
        let transfer = FirmwareTransfer::new(
            backend,
            Arc::clone(&transport) as Arc<dyn Transport>,
            reporter.clone(),
            status,
        );
        transport.transfer.set(transfer.clone()).ok().unwrap();
        (transfer, transport, reporter)
    }

    async fn wait_until_idle(transfer: &FirmwareTransfer) {
        while transfer.has_update_in_progress() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn splits_image_into_ordered_chunks_with_trailing_marker() {
        let image: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
        let (transfer, transport, _) = transfer_over(&image, true);

        assert!(transfer.start_update("https://fw.example.com/v2.bin".into(), "dev-1".into()));
        wait_until_idle(&transfer).await;

        let writes = transport.writes.lock().unwrap();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0].len(), 500);
        assert_eq!(writes[1].len(), 500);
        assert_eq!(writes[2].len(), 200);
        assert_eq!(writes[3], vec![END_MARKER]);
        // Chunks are the image in order.
        let mut reassembled = Vec::new();
        for chunk in &writes[..3] {
            reassembled.extend_from_slice(chunk);
        }
        assert_eq!(reassembled, image);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_completion_with_chunk_count() {
        let (transfer, _, reporter) = transfer_over(&[7u8; 1100], true);
        assert!(transfer.start_update("https://fw.example.com/a.bin".into(), "dev-1".into()));
        wait_until_idle(&transfer).await;

        let drained = reporter.drain();
        assert!(drained.iter().any(|r| r.description == "finished FW update with 3 chunks"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_and_aborts() {
        let (transfer, transport, reporter) = transfer_over(&[1u8; 1200], false);
        assert!(transfer.start_update("https://fw.example.com/b.bin".into(), "dev-1".into()));
        wait_until_idle(&transfer).await;

        // First chunk written, then the 6s wait expired; nothing further.
        assert_eq!(transport.writes.lock().unwrap().len(), 1);
        assert!(!transfer.has_update_in_progress());
        let drained = reporter.drain();
        assert!(drained.iter().any(|r| r.description.contains("no write acknowledgement")));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_a_no_op_while_active() {
        let (transfer, transport, _) = transfer_over(&[2u8; 900], false);
        assert!(transfer.start_update("https://fw.example.com/one.bin".into(), "dev-1".into()));
        assert!(!transfer.start_update("https://fw.example.com/two.bin".into(), "dev-1".into()));
        wait_until_idle(&transfer).await;

        // Only the first job's chunk writes happened (it timed out after one).
        assert_eq!(transport.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_next_write() {
        let (transfer, transport, reporter) = transfer_over(&[3u8; 5000], false);
        assert!(transfer.start_update("https://fw.example.com/c.bin".into(), "dev-1".into()));

        // Let the job fetch and write its first chunk, then cancel while it
        // waits for the ack that will never come.
        tokio::time::sleep(Duration::from_secs(1)).await;
        transfer.cancel_active();
        wait_until_idle(&transfer).await;

        assert!(transport.writes.lock().unwrap().len() <= 1);
        assert!(!transfer.has_update_in_progress());
        let drained = reporter.drain();
        assert!(drained.iter().any(|r| r.description.contains("cancelled")));
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_after_cancellation_is_ignored() {
        let (transfer, _, _) = transfer_over(&[4u8; 600], false);
        assert!(transfer.start_update("https://fw.example.com/d.bin".into(), "dev-1".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        transfer.cancel_active();
        wait_until_idle(&transfer).await;

        // No job, no outstanding wait: must not panic or revive anything.
        transfer.signal_ack();
        assert!(!transfer.has_update_in_progress());
    }

    #[test]
    fn update_url_validation() {
        assert_eq!(
            parse_update_url(b"https://fw.example.com/image.bin").as_deref(),
            Some("https://fw.example.com/image.bin")
        );
        assert_eq!(parse_update_url(b"ftp://example.com/image.bin"), None);
        assert_eq!(parse_update_url(b"http only, not a url"), None);
        assert_eq!(parse_update_url(&[0xFF, 0xFE, 0x00]), None);
        assert_eq!(parse_update_url(b""), None);
    }
}
