//! Shared doubles for driving the engine end to end: a scripted transport
//! that records every command and confirms writes through the event channel,
//! and a backend that captures everything sent upstream.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gatelink::{
    Backend, Channel, EventRecord, LinkEnv, Result, SyncError, Transport, TransportEvent,
};

pub fn config_token() -> String {
    LinkEnv {
        app_key: "key-000000000000".into(),
        default_dms: "https://dms.example.com/".into(),
        default_bt_api: "https://sync.example.com/".into(),
        gist_dms: "https://gist.example.com/dms".into(),
        gist_server: "https://gist.example.com/server".into(),
        gw_server_uuid: "31333333-2222-2222-1111-1111FFFFFFFF".into(),
    }
    .to_token()
}

/// Transport double. Every command is recorded; every write is confirmed by
/// feeding a `WriteConfirmed` event back through the same channel the radio
/// would use, so acknowledgement-gated flows run unmodified.
pub struct MockTransport {
    pub commands: Mutex<Vec<String>>,
    pub writes: Mutex<Vec<(Channel, Vec<u8>)>>,
    events: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn new() -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(64);
        let transport =
            Self { commands: Mutex::new(Vec::new()), writes: Mutex::new(Vec::new()), events };
        (transport, rx)
    }

    /// Simulate the radio notifying the engine.
    pub async fn emit(&self, event: TransportEvent) {
        self.events.send(event).await.expect("event channel closed");
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(Channel, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    fn record(&self, command: impl Into<String>) {
        self.commands.lock().unwrap().push(command.into());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, service_filter: &str) -> Result<()> {
        self.record(format!("scan:{service_filter}"));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record("stop_scan");
        Ok(())
    }

    async fn connect(&self, peripheral: &str) -> Result<()> {
        self.record(format!("connect:{peripheral}"));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect");
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.record("discover_services");
        Ok(())
    }

    async fn discover_characteristics(&self, service: &str) -> Result<()> {
        self.record(format!("discover_characteristics:{service}"));
        Ok(())
    }

    async fn write(&self, channel: Channel, bytes: &[u8], with_ack: bool) -> Result<()> {
        self.record(format!("write:{channel}:{}:{with_ack}", bytes.len()));
        self.writes.lock().unwrap().push((channel, bytes.to_vec()));
        let _ = self
            .events
            .send(TransportEvent::WriteConfirmed { uuid: channel.uuid().to_string(), error: None })
            .await;
        Ok(())
    }
}

/// Backend double capturing relayed message bodies, telemetry batches and
/// firmware image requests.
#[derive(Default)]
pub struct MockBackend {
    pub relayed: Mutex<Vec<Vec<u8>>>,
    pub telemetry: Mutex<Vec<Vec<EventRecord>>>,
    pub firmware_requests: Mutex<Vec<String>>,
    pub ack: Mutex<Vec<u8>>,
    pub firmware_image: Mutex<Vec<u8>>,
    pub fail_relay: Mutex<bool>,
}

impl MockBackend {
    pub fn relayed(&self) -> Vec<Vec<u8>> {
        self.relayed.lock().unwrap().clone()
    }

    pub fn telemetry_descriptions(&self) -> Vec<String> {
        self.telemetry
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|record| record.description.clone())
            .collect()
    }

    pub fn set_ack(&self, ack: &[u8]) {
        *self.ack.lock().unwrap() = ack.to_vec();
    }

    pub fn set_firmware_image(&self, image: Vec<u8>) {
        *self.firmware_image.lock().unwrap() = image;
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn send_telemetry_batch(&self, events: &[EventRecord]) -> Result<()> {
        self.telemetry.lock().unwrap().push(events.to_vec());
        Ok(())
    }

    async fn relay_device_messages(&self, joined: &[u8]) -> Result<Vec<u8>> {
        if *self.fail_relay.lock().unwrap() {
            return Err(SyncError::HttpStatus { status: 503 });
        }
        self.relayed.lock().unwrap().push(joined.to_vec());
        Ok(self.ack.lock().unwrap().clone())
    }

    async fn fetch_firmware_image(&self, url: &str) -> Result<Vec<u8>> {
        self.firmware_requests.lock().unwrap().push(url.to_string());
        Ok(self.firmware_image.lock().unwrap().clone())
    }

    async fn resolve_dynamic_endpoint(&self, _gist_url: &str) -> Result<String> {
        Err(SyncError::HttpStatus { status: 404 })
    }
}
