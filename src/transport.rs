//! Wireless transport capability.
//!
//! The engine never talks to a radio directly: it consumes a [`Transport`]
//! trait object for commands and an inbound [`TransportEvent`] stream for
//! everything the link reports back. Production wires in a platform BLE
//! stack; tests wire in doubles.
//!
//! The transport contract the engine relies on: per-characteristic delivery
//! order is preserved, writes with `with_ack` produce exactly one
//! [`TransportEvent::WriteConfirmed`], and a read rejected with "not
//! permitted" is noise from unrelated characteristics, not a failure.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::channel::Channel;
use crate::error::Result;

/// Power/authorization state of the radio adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "poweredOff",
            AdapterState::PoweredOn => "poweredOn",
        };
        f.write_str(name)
    }
}

/// Error reported by the transport for a single read or write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The characteristic refused the read. Unrelated characteristics on the
    /// same service produce these routinely; they carry no information.
    #[error("read not permitted")]
    NotPermitted,

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, TransportError::NotPermitted)
    }
}

/// A peripheral observed during scanning.
#[derive(Debug, Clone)]
pub struct PeripheralInfo {
    pub id: String,
    pub name: Option<String>,
}

/// Inbound events delivered by the transport, in link order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    AdapterStateChanged(AdapterState),
    Discovered(PeripheralInfo),
    Connected { peripheral: String },
    Disconnected,
    ServicesFound(Vec<String>),
    CharacteristicsFound { service: String, uuids: Vec<String> },
    ValueUpdated { uuid: String, result: std::result::Result<Vec<u8>, TransportError> },
    WriteConfirmed { uuid: String, error: Option<TransportError> },
    NotifyStateChanged { uuid: String },
}

/// Command surface of the wireless link.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start scanning for peripherals advertising the given service UUID.
    async fn scan(&self, service_filter: &str) -> Result<()>;

    /// Stop an in-progress scan. A no-op when not scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a previously discovered peripheral.
    async fn connect(&self, peripheral: &str) -> Result<()>;

    /// Tear down the current connection, if any.
    async fn disconnect(&self) -> Result<()>;

    /// Enumerate services on the connected peripheral.
    async fn discover_services(&self) -> Result<()>;

    /// Enumerate characteristics of one service.
    async fn discover_characteristics(&self, service: &str) -> Result<()>;

    /// Write bytes to a channel. When `with_ack` is set the transport
    /// confirms the write with a `WriteConfirmed` event.
    async fn write(&self, channel: Channel, bytes: &[u8], with_ack: bool) -> Result<()>;
}
