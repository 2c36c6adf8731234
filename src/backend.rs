//! Backend capability consumed by the engine.
//!
//! Four operations cover everything the cloud side does: accept telemetry
//! batches, relay joined device messages (returning acknowledgement bytes for
//! the peripheral), serve firmware images, and resolve the dynamic endpoint
//! indirection. Production uses [`crate::backends::http::HttpBackend`]; tests
//! substitute doubles.

use async_trait::async_trait;

use crate::error::Result;
use crate::telemetry::EventRecord;

/// Request/response operations against the cloud endpoint.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Submit one batch of telemetry events.
    async fn send_telemetry_batch(&self, events: &[EventRecord]) -> Result<()>;

    /// Relay a joined message batch; returns the acknowledgement bytes to
    /// write back to the peripheral.
    async fn relay_device_messages(&self, joined: &[u8]) -> Result<Vec<u8>>;

    /// Download a firmware image.
    async fn fetch_firmware_image(&self, url: &str) -> Result<Vec<u8>>;

    /// Resolve a gist URL to the current endpoint it points at.
    async fn resolve_dynamic_endpoint(&self, gist_url: &str) -> Result<String>;

    /// Refresh dynamic base URLs ahead of use. Backends without the
    /// indirection ignore it.
    async fn refresh_endpoints(&self) {}
}
