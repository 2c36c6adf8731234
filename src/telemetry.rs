//! Structured event telemetry.
//!
//! Every component feeds events into one process-wide buffer; a background
//! task flushes the buffer to the reporting endpoint on a fixed cadence.
//! Recording never blocks the caller and never fails. If a flush attempt is
//! rejected by the backend, a synthetic failure event is fed back into the
//! buffer and the lost batch is not retried.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::channel::Channel;
use crate::status::LinkStatus;
use crate::transport::AdapterState;

/// Cadence of the report flush task.
pub(crate) const REPORT_INTERVAL: Duration = Duration::from_secs(120);

/// Severity attached to each reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// One telemetry event, immutable once recorded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventRecord {
    #[serde(rename = "eventDescription")]
    pub description: String,
    pub level: String,
    pub date: String,
}

impl EventRecord {
    fn new(event: &Event) -> Self {
        Self {
            description: event.describe(),
            level: event.level().as_str().to_string(),
            date: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Everything the engine reports about itself.
#[derive(Debug, Clone)]
pub enum Event {
    Initialized,
    WillStartScanning,
    NotPoweredOn,
    NewStatus(LinkStatus),
    NewAdapterState(AdapterState),
    StartingScan,
    DiscoveredPeripheral,
    ScanStopped,
    TryingToConnect,
    DeviceConnected(Option<String>),
    DeviceDisconnected,
    DiscoveringServices,
    ServiceDiscovered,
    DiscoveringCharacteristics { service: String },
    CharacteristicsDiscovered,
    NewValue(Channel),
    CharacteristicNotified(String),
    EngineStopped,
    BaseUrlUpdated(String),
    WrittenValue(String),
    FailedToWrite(String),
    ReceivedSerial { serial: String, peripheral: String },
    FirmwareChunkWritten { index: usize, len: usize, target: String },
    FirmwareUpdateFinished { chunks: usize },
    EmptyChannel(Channel),
    Failure(String),
}

impl Event {
    pub fn level(&self) -> LogLevel {
        match self {
            Event::Failure(_) | Event::FailedToWrite(_) => LogLevel::Error,
            Event::ScanStopped | Event::EngineStopped | Event::EmptyChannel(_) => LogLevel::Warn,
            Event::NewStatus(status) => status.level(),
            _ => LogLevel::Info,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Event::NewStatus(status) => format!("newStatus: {}", status.describe()),
            Event::NewAdapterState(state) => format!("newAdapterState: {state}"),
            Event::DeviceConnected(name) => {
                format!("deviceConnected: {}", name.as_deref().unwrap_or("Unknown"))
            }
            Event::DiscoveringCharacteristics { service } => {
                format!("discovering characteristics for service: {service}")
            }
            Event::NewValue(channel) => format!("new value for characteristic {channel}"),
            Event::CharacteristicNotified(uuid) => format!("received notify from {uuid}"),
            Event::BaseUrlUpdated(url) => format!("new baseUrl: {url}"),
            Event::WrittenValue(device) => format!("written value on {device}"),
            Event::FailedToWrite(reason) => format!("failed to write on chr: {reason}"),
            Event::ReceivedSerial { serial, peripheral } => {
                format!("peripheral {peripheral} informed serial {serial}")
            }
            Event::FirmwareChunkWritten { index, len, target } => {
                format!("writing FW chunk #{index} with {len} bytes on {target}")
            }
            Event::FirmwareUpdateFinished { chunks } => {
                format!("finished FW update with {chunks} chunks")
            }
            Event::EmptyChannel(channel) => format!("characteristic is empty: {channel}"),
            Event::Failure(reason) => format!("failure: {reason}"),
            other => format!("{other:?}"),
        }
    }
}

/// Buffered, periodically flushed event reporter.
///
/// Cheap to clone; all clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct TelemetryReporter {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    buffer: Mutex<Vec<EventRecord>>,
    debug: AtomicBool,
}

impl TelemetryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the report buffer and log it.
    pub fn record(&self, event: Event) {
        let record = EventRecord::new(&event);
        match event.level() {
            LogLevel::Info => info!(target: "gatelink::telemetry", "{}", record.description),
            LogLevel::Warn => warn!(target: "gatelink::telemetry", "{}", record.description),
            LogLevel::Error => error!(target: "gatelink::telemetry", "{}", record.description),
        }
        if let Ok(mut buffer) = self.inner.buffer.lock() {
            buffer.push(record);
        }
    }

    pub fn set_debug(&self, enabled: bool) {
        self.inner.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn debug_enabled(&self) -> bool {
        self.inner.debug.load(Ordering::Relaxed)
    }

    /// Atomically snapshot and clear the buffer.
    pub(crate) fn drain(&self) -> Vec<EventRecord> {
        self.inner.buffer.lock().map(|mut buffer| std::mem::take(&mut *buffer)).unwrap_or_default()
    }

    /// Spawn the periodic flush task. Runs until cancelled.
    ///
    /// Only spawned once a validated configuration exists, so a flush never
    /// races an unconfigured backend.
    pub(crate) fn spawn_flush(
        &self,
        backend: Arc<dyn Backend>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + REPORT_INTERVAL, REPORT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("telemetry flush task cancelled");
                        break;
                    }
                    _ = ticker.tick() => reporter.flush(backend.as_ref()).await,
                }
            }
        })
    }

    async fn flush(&self, backend: &dyn Backend) {
        let batch = self.drain();
        if batch.is_empty() {
            return;
        }
        debug!("flushing {} telemetry events", batch.len());
        if let Err(err) = backend.send_telemetry_batch(&batch).await {
            // The lost batch is not requeued; only the failure itself is kept.
            self.record(Event::Failure(format!("failed to send report: {err}")));
        }
    }
}
