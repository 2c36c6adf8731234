//! Connection state machine and transport event dispatch.
//!
//! One task owns the inbound transport event stream and, with it, all
//! reassembly state, so per-characteristic ordering is preserved by
//! construction. A second task supervises scanning: whenever the link is
//! down and configuration is present it kicks a scan, forever. Restarting
//! the engine replaces the supervision task, so at most one scan loop is
//! ever alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::config::SharedEnv;
use crate::firmware::{FirmwareTransfer, parse_update_url};
use crate::frame::{FrameBuffer, FrameOutcome};
use crate::identity::{DeviceIdentity, decode_serial};
use crate::outbound::OutboundQueue;
use crate::status::{LinkStatus, StatusSender};
use crate::telemetry::{Event, TelemetryReporter};
use crate::transport::{AdapterState, Transport, TransportEvent};

/// Cadence of the scan supervision loop.
pub(crate) const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Where the link currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
}

/// Everything a scan attempt needs; shared by the supervision loop and the
/// powered-on event path.
#[derive(Clone)]
pub(crate) struct ScanKick {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) reporter: TelemetryReporter,
    pub(crate) status: StatusSender,
    pub(crate) adapter: Arc<Mutex<AdapterState>>,
    pub(crate) env: SharedEnv,
}

impl ScanKick {
    /// Attempt to start a scan. Refuses quietly when the adapter is not
    /// powered on or no configuration is installed.
    pub(crate) async fn kick(&self) {
        self.reporter.record(Event::WillStartScanning);

        let adapter = self.adapter.lock().map(|state| *state).unwrap_or(AdapterState::Unknown);
        if adapter != AdapterState::PoweredOn {
            self.reporter.record(Event::NotPoweredOn);
            self.status.emit(LinkStatus::from(adapter));
            return;
        }

        let service = self
            .env
            .read()
            .ok()
            .and_then(|env| env.as_ref().map(|e| e.gw_server_uuid.clone()));
        let Some(service) = service else {
            self.status.emit(LinkStatus::Failure("no operating configuration".into()));
            return;
        };

        let _ = self.transport.stop_scan().await;
        self.reporter.record(Event::StartingScan);
        if let Err(err) = self.transport.scan(&service).await {
            self.status.emit(LinkStatus::Failure(format!("scan failed: {err}")));
        }
    }
}

/// Spawn the scan supervision loop. The first attempt happens immediately;
/// afterwards one attempt per [`SCAN_INTERVAL`] while disconnected.
pub(crate) fn spawn_scan_loop(
    kick: ScanKick,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("scan loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if !*connected.borrow() {
                        kick.kick().await;
                    }
                }
            }
        }
    })
}

/// Dispatches transport events into the sync pipeline.
pub(crate) struct LinkSession {
    transport: Arc<dyn Transport>,
    reporter: TelemetryReporter,
    identity: Arc<DeviceIdentity>,
    status: StatusSender,
    connected: watch::Sender<bool>,
    queue: Arc<OutboundQueue>,
    firmware: FirmwareTransfer,
    frames: FrameBuffer,
    scan: ScanKick,
    stopped: Arc<AtomicBool>,
    state: LinkState,
}

impl LinkSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        reporter: TelemetryReporter,
        identity: Arc<DeviceIdentity>,
        status: StatusSender,
        connected: watch::Sender<bool>,
        queue: Arc<OutboundQueue>,
        firmware: FirmwareTransfer,
        scan: ScanKick,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            reporter,
            identity,
            status,
            connected,
            queue,
            firmware,
            frames: FrameBuffer::new(),
            scan,
            stopped,
            state: LinkState::Disconnected,
        }
    }

    /// Spawn the dispatch task. Runs until cancelled or the transport event
    /// stream ends.
    pub(crate) fn spawn(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("link session started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("link session cancelled");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!("transport event stream ended");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::AdapterStateChanged(state) => {
                self.reporter.record(Event::NewAdapterState(state));
                if let Ok(mut slot) = self.scan.adapter.lock() {
                    *slot = state;
                }
                if state == AdapterState::PoweredOn {
                    self.scan.kick().await;
                    self.state = LinkState::Scanning;
                }
            }
            TransportEvent::Discovered(peripheral) => {
                self.reporter.record(Event::DiscoveredPeripheral);
                let _ = self.transport.stop_scan().await;
                self.reporter.record(Event::ScanStopped);
                self.identity.set_link_id(peripheral.id.clone());
                self.reporter.record(Event::TryingToConnect);
                self.state = LinkState::Connecting;
                if let Err(err) = self.transport.connect(&peripheral.id).await {
                    self.status.emit(LinkStatus::Failure(format!("connect failed: {err}")));
                }
            }
            TransportEvent::Connected { peripheral } => {
                self.reporter.record(Event::DeviceConnected(Some(peripheral)));
                self.status.emit(LinkStatus::Connected);
                self.connected.send_replace(true);
                self.reporter.record(Event::DiscoveringServices);
                self.state = LinkState::DiscoveringServices;
                if let Err(err) = self.transport.discover_services().await {
                    self.status.emit(LinkStatus::Failure(format!(
                        "service discovery failed: {err}"
                    )));
                }
            }
            TransportEvent::Disconnected => {
                self.connected.send_replace(false);
                self.firmware.cancel_active();
                self.state = LinkState::Scanning;
                if !self.stopped.load(Ordering::SeqCst) {
                    self.reporter.record(Event::DeviceDisconnected);
                    self.status.emit(LinkStatus::DisconnectedAndScanning);
                }
            }
            TransportEvent::ServicesFound(services) => {
                self.reporter.record(Event::ServiceDiscovered);
                if services.is_empty() {
                    self.status.emit(LinkStatus::Failure(
                        "no services found on connected device".into(),
                    ));
                    return;
                }
                self.state = LinkState::DiscoveringCharacteristics;
                for service in services {
                    self.reporter
                        .record(Event::DiscoveringCharacteristics { service: service.clone() });
                    if let Err(err) = self.transport.discover_characteristics(&service).await {
                        self.status.emit(LinkStatus::Failure(format!(
                            "error discovering characteristics: {err}"
                        )));
                    }
                }
            }
            TransportEvent::CharacteristicsFound { service, uuids } => {
                self.reporter.record(Event::CharacteristicsDiscovered);
                if uuids.is_empty() {
                    self.status.emit(LinkStatus::Failure(format!(
                        "no characteristics found for service {service}"
                    )));
                    return;
                }
                self.state = LinkState::Ready;
            }
            TransportEvent::ValueUpdated { uuid, result } => {
                self.handle_value(&uuid, result).await;
            }
            TransportEvent::WriteConfirmed { uuid, error } => match error {
                Some(err) => self.reporter.record(Event::FailedToWrite(err.to_string())),
                None => {
                    if Channel::from_uuid(&uuid) == Some(Channel::Firmware) {
                        self.firmware.signal_ack();
                    }
                    self.reporter.record(Event::WrittenValue(self.identity.link_id()));
                }
            },
            TransportEvent::NotifyStateChanged { uuid } => {
                self.reporter.record(Event::CharacteristicNotified(uuid));
            }
        }
    }

    async fn handle_value(
        &mut self,
        uuid: &str,
        result: std::result::Result<Vec<u8>, crate::transport::TransportError>,
    ) {
        let channel = Channel::from_uuid(uuid);
        let data = match result {
            Ok(data) => data,
            Err(err) => {
                if err.is_not_permitted() {
                    // Noise from unrelated characteristics.
                    return;
                }
                match channel {
                    Some(channel) => {
                        if let Some(failure) = self.frames.on_read_error(channel, &err) {
                            self.status.emit(LinkStatus::Failure(failure.to_string()));
                        }
                    }
                    None => self.status.emit(LinkStatus::Failure(format!(
                        "error updating value for characteristic {uuid}: {err}"
                    ))),
                }
                return;
            }
        };

        let Some(channel) = channel else {
            self.status.emit(LinkStatus::Failure(format!("unknown characteristic: {uuid}")));
            return;
        };
        self.reporter.record(Event::NewValue(channel));
        if self.reporter.debug_enabled() {
            debug!("received {} bytes for {channel}: {}", data.len(), BASE64.encode(&data));
        }

        if channel == Channel::Firmware {
            self.handle_firmware_payload(&data);
            return;
        }
        match self.frames.on_fragment(channel, &data) {
            FrameOutcome::Complete(message) => self.queue.enqueue(message),
            FrameOutcome::Buffered => {}
            FrameOutcome::EmptyMarker => self.reporter.record(Event::EmptyChannel(channel)),
        }
    }

    /// Disambiguate a firmware-channel notification: serial announcement,
    /// update URL, or garbage (reported, never silently dropped).
    fn handle_firmware_payload(&mut self, data: &[u8]) {
        if let Some(serial) = decode_serial(data) {
            self.identity.set_serial(serial.clone());
            self.reporter
                .record(Event::ReceivedSerial { serial, peripheral: self.identity.link_id() });
            return;
        }
        if let Some(url) = parse_update_url(data) {
            if !self.firmware.start_update(url, self.identity.link_id()) {
                debug!("firmware update already in progress, notification ignored");
            }
            return;
        }
        self.status.emit(LinkStatus::Failure("invalid URL for new FW".into()));
    }
}
