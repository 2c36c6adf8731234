//! Async device-sync engine bridging a BLE-style link to an HTTP backend.
//!
//! GateLink keeps a peripheral connected, reassembles the messages it
//! notifies, relays them upstream in joined batches, routes server
//! acknowledgements back over the link, and drives chunked firmware
//! transfers with per-chunk write acknowledgement.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gatelink::{GateLink, Transport, TransportEvent};
//! use futures::StreamExt;
//!
//! # async fn run(transport: Arc<dyn Transport>, events: tokio::sync::mpsc::Receiver<TransportEvent>) -> Result<(), Box<dyn std::error::Error>> {
//! let link = GateLink::new(transport, events);
//! link.start("BASE64-CONFIG-TOKEN")?;
//!
//! let mut statuses = link.status_stream();
//! while let Some(status) = statuses.next().await {
//!     println!("link status: {status:?}");
//! }
//! # Ok(())
//! # }
//! ```

// Wire-facing building blocks
pub mod channel;
pub mod config;
mod error;
pub mod frame;
pub mod identity;
pub mod transport;

// Sync pipeline
pub mod backend;
pub mod backends;
pub mod firmware;
pub mod outbound;
mod session;
pub mod status;
pub mod telemetry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use crate::channel::{Channel, END_MARKER};
pub use crate::config::{LinkEnv, SharedEnv};
pub use crate::error::{Result, SyncError};
pub use crate::backend::Backend;
pub use crate::backends::http::HttpBackend;
pub use crate::firmware::FirmwareTransfer;
pub use crate::frame::{FrameBuffer, FrameOutcome};
pub use crate::identity::DeviceIdentity;
pub use crate::outbound::OutboundQueue;
pub use crate::status::LinkStatus;
pub use crate::telemetry::{Event, EventRecord, LogLevel, TelemetryReporter};
pub use crate::transport::{
    AdapterState, PeripheralInfo, Transport, TransportError, TransportEvent,
};

use crate::session::{LinkSession, ScanKick, spawn_scan_loop};
use crate::status::StatusSender;

/// The sync engine facade.
///
/// Owns the background tasks; dropping it does not stop them. Call
/// [`GateLink::stop`] first.
pub struct GateLink {
    transport: Arc<dyn Transport>,
    backend: Arc<dyn Backend>,
    reporter: TelemetryReporter,
    identity: Arc<DeviceIdentity>,
    status: StatusSender,
    connected: watch::Sender<bool>,
    queue: Arc<OutboundQueue>,
    firmware: FirmwareTransfer,
    env: SharedEnv,
    adapter: Arc<Mutex<AdapterState>>,
    stopped: Arc<AtomicBool>,
    // Consumed on first start; the dispatch, relay and telemetry tasks are
    // spawned exactly once and live until `shutdown` fires.
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    shutdown: CancellationToken,
    // Replaced on every start so at most one scan loop runs.
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl GateLink {
    /// Build an engine over the given transport, reporting to the HTTP
    /// backend named by the configuration token passed to [`GateLink::start`].
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::Receiver<TransportEvent>) -> Self {
        let env: SharedEnv = Arc::new(RwLock::new(None));
        let identity = Arc::new(DeviceIdentity::new());
        let reporter = TelemetryReporter::new();
        let backend = Arc::new(HttpBackend::new(
            Arc::clone(&env),
            Arc::clone(&identity),
            reporter.clone(),
        ));
        Self::assemble(transport, backend, env, identity, reporter, events)
    }

    /// Same as [`GateLink::new`] but over a caller-supplied backend.
    pub fn with_backend(
        transport: Arc<dyn Transport>,
        backend: Arc<dyn Backend>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let env: SharedEnv = Arc::new(RwLock::new(None));
        let identity = Arc::new(DeviceIdentity::new());
        let reporter = TelemetryReporter::new();
        Self::assemble(transport, backend, env, identity, reporter, events)
    }

    fn assemble(
        transport: Arc<dyn Transport>,
        backend: Arc<dyn Backend>,
        env: SharedEnv,
        identity: Arc<DeviceIdentity>,
        reporter: TelemetryReporter,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let status = StatusSender::new(reporter.clone());
        let (connected, _) = watch::channel(false);
        let firmware = FirmwareTransfer::new(
            Arc::clone(&backend),
            Arc::clone(&transport),
            reporter.clone(),
            status.clone(),
        );
        Self {
            transport,
            backend,
            reporter,
            identity,
            status,
            connected,
            queue: Arc::new(OutboundQueue::new()),
            firmware,
            env,
            adapter: Arc::new(Mutex::new(AdapterState::Unknown)),
            stopped: Arc::new(AtomicBool::new(false)),
            events: Mutex::new(Some(events)),
            shutdown: CancellationToken::new(),
            scan_cancel: Mutex::new(None),
        }
    }

    /// Validate the configuration token and start (or restart) the engine.
    ///
    /// The first call spawns the event dispatch, relay and telemetry tasks.
    /// Every call installs the decoded configuration and replaces the scan
    /// supervision loop, so a restart after [`GateLink::stop`] resumes
    /// scanning immediately.
    pub fn start(&self, token: &str) -> Result<()> {
        let env = LinkEnv::from_token(token)?;
        if let Ok(mut slot) = self.env.write() {
            *slot = Some(env);
        }
        self.stopped.store(false, Ordering::SeqCst);
        self.reporter.record(Event::Initialized);

        let scan = ScanKick {
            transport: Arc::clone(&self.transport),
            reporter: self.reporter.clone(),
            status: self.status.clone(),
            adapter: Arc::clone(&self.adapter),
            env: Arc::clone(&self.env),
        };

        if let Some(events) = self.events.lock().ok().and_then(|mut slot| slot.take()) {
            info!("starting sync engine");
            let session = LinkSession::new(
                Arc::clone(&self.transport),
                self.reporter.clone(),
                Arc::clone(&self.identity),
                self.status.clone(),
                self.connected.clone(),
                Arc::clone(&self.queue),
                self.firmware.clone(),
                scan.clone(),
                Arc::clone(&self.stopped),
            );
            session.spawn(events, self.shutdown.clone());

            outbound::SyncRelay::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.backend),
                Arc::clone(&self.transport),
                self.reporter.clone(),
                self.status.clone(),
            )
            .spawn(self.shutdown.clone());

            self.reporter.spawn_flush(Arc::clone(&self.backend), self.shutdown.clone());
        }

        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move { backend.refresh_endpoints().await });

        let cancel = self.shutdown.child_token();
        let previous = self
            .scan_cancel
            .lock()
            .map(|mut slot| slot.replace(cancel.clone()))
            .unwrap_or(None);
        if let Some(previous) = previous {
            previous.cancel();
        }
        spawn_scan_loop(scan, self.connected.subscribe(), cancel);
        Ok(())
    }

    /// Stop scanning, abort any firmware transfer and drop the connection.
    ///
    /// The engine can be restarted with [`GateLink::start`]; background
    /// relay and telemetry tasks stay alive but idle while stopped.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(cancel) = self.scan_cancel.lock().ok().and_then(|mut slot| slot.take()) {
            cancel.cancel();
        }
        self.firmware.cancel_active();
        let _ = self.transport.stop_scan().await;
        let _ = self.transport.disconnect().await;
        self.connected.send_replace(false);
        self.reporter.record(Event::EngineStopped);
        self.status.emit(LinkStatus::Stopped);
    }

    /// Stream of status changes. Slow consumers lose the oldest entries.
    pub fn status_stream(&self) -> impl Stream<Item = LinkStatus> + Send + Unpin + use<> {
        BroadcastStream::new(self.status.subscribe()).filter_map(|item| item.ok())
    }

    /// Stream of link-connected transitions, starting with the current value.
    pub fn connected_stream(&self) -> impl Stream<Item = bool> + Send + Unpin + use<> {
        WatchStream::new(self.connected.subscribe())
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Serial the peripheral last announced, or `"Unknown"`.
    pub fn serial(&self) -> String {
        self.identity.serial()
    }

    /// Identifier of this host installation, stable for the process.
    pub fn host_id(&self) -> &str {
        self.identity.host_id()
    }

    pub fn has_firmware_update_in_progress(&self) -> bool {
        self.firmware.has_update_in_progress()
    }

    /// When enabled, raw channel payloads are logged base64-encoded.
    pub fn set_debug(&self, enabled: bool) {
        self.reporter.set_debug(enabled);
    }
}
