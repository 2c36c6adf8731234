//! User-visible link status.
//!
//! The status stream is the single channel through which callers observe the
//! engine: transport events arrive asynchronously, so there is no
//! throw-to-caller path for them.

use tokio::sync::broadcast;

use crate::telemetry::{Event, LogLevel, TelemetryReporter};
use crate::transport::AdapterState;

/// Condition of the link as reported on the status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// The host denied radio access, or the adapter is unsupported.
    Unauthorized,
    /// The radio adapter is powered off.
    PoweredOff,
    /// A non-benign failure; the engine keeps scanning regardless.
    Failure(String),
    /// No peripheral connected; scanning continues on the supervision loop.
    DisconnectedAndScanning,
    /// A peripheral is connected and the sync pipeline is active.
    Connected,
    /// The engine was explicitly stopped.
    Stopped,
}

impl LinkStatus {
    pub(crate) fn level(&self) -> LogLevel {
        match self {
            LinkStatus::Unauthorized | LinkStatus::Failure(_) => LogLevel::Error,
            LinkStatus::PoweredOff | LinkStatus::Stopped => LogLevel::Warn,
            LinkStatus::DisconnectedAndScanning | LinkStatus::Connected => LogLevel::Info,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            LinkStatus::Failure(reason) => format!("failure: {reason}"),
            other => format!("{other:?}"),
        }
    }
}

impl From<AdapterState> for LinkStatus {
    /// Status to report when a scan attempt finds the adapter unusable.
    fn from(state: AdapterState) -> Self {
        match state {
            AdapterState::Unsupported | AdapterState::Unauthorized => LinkStatus::Unauthorized,
            AdapterState::PoweredOff => LinkStatus::PoweredOff,
            AdapterState::Unknown | AdapterState::Resetting | AdapterState::PoweredOn => {
                LinkStatus::DisconnectedAndScanning
            }
        }
    }
}

/// Fan-out point for status emissions.
///
/// Every emission is mirrored into telemetry before it reaches subscribers,
/// so the report stream always contains the statuses callers saw.
#[derive(Debug, Clone)]
pub(crate) struct StatusSender {
    tx: broadcast::Sender<LinkStatus>,
    reporter: TelemetryReporter,
}

impl StatusSender {
    pub(crate) fn new(reporter: TelemetryReporter) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx, reporter }
    }

    pub(crate) fn emit(&self, status: LinkStatus) {
        self.reporter.record(Event::NewStatus(status.clone()));
        // No subscribers is fine; statuses are fire-and-forget.
        let _ = self.tx.send(status);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LinkStatus> {
        self.tx.subscribe()
    }
}
