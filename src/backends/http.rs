//! HTTP backend implementation.
//!
//! Telemetry batches and relayed device messages go out as POSTs tagged with
//! device headers; firmware images come back from plain GETs. The two
//! operational endpoints are double-resolved: requests use a dynamic URL when
//! one has been learned from the gist indirection, falling back to the
//! configured defaults. Any relay or fetch failure triggers one refresh
//! attempt of both dynamic URLs. The failed request itself is never retried.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::SharedEnv;
use crate::error::{Result, SyncError};
use crate::identity::DeviceIdentity;
use crate::telemetry::{Event, EventRecord, TelemetryReporter};

/// Path of the telemetry report endpoint, relative to the DMS base URL.
const REPORT_PATH: &str = "btreport";

/// JSON envelope carrying the peripheral acknowledgement.
#[derive(Deserialize)]
struct AckEnvelope {
    #[serde(rename = "ACK")]
    ack: String,
}

/// Cloud endpoint over HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    env: SharedEnv,
    identity: Arc<DeviceIdentity>,
    reporter: TelemetryReporter,
    dynamic_dms: RwLock<Option<String>>,
    dynamic_sync: RwLock<Option<String>>,
}

impl HttpBackend {
    pub fn new(env: SharedEnv, identity: Arc<DeviceIdentity>, reporter: TelemetryReporter) -> Self {
        Self {
            client: reqwest::Client::new(),
            env,
            identity,
            reporter,
            dynamic_dms: RwLock::new(None),
            dynamic_sync: RwLock::new(None),
        }
    }

    fn app_key(&self) -> Result<String> {
        self.env
            .read()
            .ok()
            .and_then(|env| env.as_ref().map(|e| e.app_key.clone()))
            .ok_or(SyncError::InvalidAppKey)
    }

    fn configured(&self, pick: impl Fn(&crate::config::LinkEnv) -> String) -> Result<String> {
        self.env
            .read()
            .ok()
            .and_then(|env| env.as_ref().map(|e| pick(e)))
            .ok_or(SyncError::InvalidAppKey)
    }

    async fn dms_url(&self) -> Result<String> {
        if let Some(url) = self.dynamic_dms.read().await.clone() {
            return Ok(url);
        }
        self.configured(|env| env.default_dms.clone())
    }

    async fn sync_url(&self) -> Result<String> {
        if let Some(url) = self.dynamic_sync.read().await.clone() {
            return Ok(url);
        }
        self.configured(|env| env.default_bt_api.clone())
    }

    fn device_headers(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        Ok(request
            .header("serial", self.identity.serial())
            .header("btid", self.identity.link_id())
            .header("X-API-Key", self.app_key()?)
            .header("device", self.identity.host_id()))
    }

    async fn refresh_one(
        &self,
        gist: Result<String>,
        slot: &RwLock<Option<String>>,
    ) -> Result<()> {
        let gist = gist?;
        let url = self.resolve_dynamic_endpoint(&gist).await?;
        self.reporter.record(Event::BaseUrlUpdated(url.clone()));
        *slot.write().await = Some(url);
        Ok(())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send_telemetry_batch(&self, events: &[EventRecord]) -> Result<()> {
        let url = format!("{}{}", self.dms_url().await?, REPORT_PATH);
        debug!("posting {} events to {url}", events.len());
        let request = self.device_headers(self.client.post(&url))?.json(events);
        let outcome = async {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(SyncError::HttpStatus { status: response.status().as_u16() });
            }
            Ok(())
        }
        .await;
        if outcome.is_err() {
            self.refresh_endpoints().await;
        }
        outcome
    }

    async fn relay_device_messages(&self, joined: &[u8]) -> Result<Vec<u8>> {
        let url = self.sync_url().await?;
        debug!("relaying {} joined bytes to {url}", joined.len());
        let request = self.device_headers(self.client.post(&url))?.body(joined.to_vec());
        let outcome = async {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(SyncError::HttpStatus { status: response.status().as_u16() });
            }
            let body = response.bytes().await?;
            extract_ack(&body)
        }
        .await;
        if matches!(outcome, Err(SyncError::HttpStatus { .. }) | Err(SyncError::Request(_))) {
            self.refresh_endpoints().await;
        }
        outcome
    }

    async fn fetch_firmware_image(&self, url: &str) -> Result<Vec<u8>> {
        debug!("fetching firmware image from {url}");
        let request = self.device_headers(self.client.get(url))?;
        let outcome = async {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(SyncError::HttpStatus { status: response.status().as_u16() });
            }
            Ok(response.bytes().await?.to_vec())
        }
        .await;
        if outcome.is_err() {
            self.refresh_endpoints().await;
        }
        outcome
    }

    async fn resolve_dynamic_endpoint(&self, gist_url: &str) -> Result<String> {
        // Gist requests go out bare: the indirection host is not ours.
        let response = self.client.get(gist_url).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::HttpStatus { status: response.status().as_u16() });
        }
        let body = response.text().await?;
        let url = body.trim();
        if !url.starts_with("http") {
            return Err(SyncError::invalid_url(url));
        }
        Ok(url.to_string())
    }

    async fn refresh_endpoints(&self) {
        let dms_gist = self.configured(|env| env.gist_dms.clone());
        if let Err(err) = self.refresh_one(dms_gist, &self.dynamic_dms).await {
            warn!("could not refresh DMS endpoint: {err}");
            self.reporter.record(Event::Failure(format!("endpoint refresh failed: {err}")));
        }
        let sync_gist = self.configured(|env| env.gist_server.clone());
        if let Err(err) = self.refresh_one(sync_gist, &self.dynamic_sync).await {
            warn!("could not refresh sync endpoint: {err}");
            self.reporter.record(Event::Failure(format!("endpoint refresh failed: {err}")));
        }
    }
}

/// Pull the acknowledgement bytes out of a relay response.
///
/// The backend answers with a JSON object whose `ACK` field holds the bytes
/// base64-encoded. Anything else is a hard failure: the flush cycle that
/// produced it is lost.
fn extract_ack(body: &[u8]) -> Result<Vec<u8>> {
    let envelope: AckEnvelope =
        serde_json::from_slice(body).map_err(|_| SyncError::MalformedAck)?;
    BASE64.decode(envelope.ack).map_err(|_| SyncError::MalformedAck)
}
