//! Error types for the synchronization engine.
//!
//! All failures surface as [`SyncError`]. The taxonomy distinguishes
//! transport-level noise (a "not permitted" read is handled before it ever
//! becomes a `SyncError`), transport failures that clear reassembly state,
//! backend HTTP failures that trigger an endpoint refresh, and the
//! firmware-specific acknowledgement timeout that aborts an in-flight job.
//!
//! Errors never halt the supervising loop: callers convert them into a
//! telemetry event plus a status-stream emission and keep scanning.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for synchronization operations.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Main error type for the synchronization engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("transport failure on {channel}: {reason}")]
    Transport { channel: String, reason: String },

    #[error("backend returned HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("relay acknowledgement missing or malformed")]
    MalformedAck,

    #[error("no write acknowledgement for chunk {chunk} within {timeout:?}")]
    AckTimeout { chunk: usize, timeout: Duration },

    #[error("firmware transfer cancelled")]
    Cancelled,

    #[error("operating configuration token is invalid")]
    InvalidAppKey,

    #[error("endpoint is not a usable URL: {url}")]
    InvalidUrl { url: String },
}

impl SyncError {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// "Retryable" means a later attempt with fresh input may succeed; it does
    /// not mean the engine retries the same request (it never does: failed
    /// relay batches are lost by design, and a timed-out firmware job needs a
    /// fresh update notification to restart).
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { .. } => true,
            SyncError::HttpStatus { .. } => true,
            SyncError::Request(_) => true,
            SyncError::AckTimeout { .. } => true,
            SyncError::Cancelled => true,
            SyncError::MalformedAck => false,
            SyncError::InvalidAppKey => false,
            SyncError::InvalidUrl { .. } => false,
        }
    }

    /// Helper constructor for transport failures.
    pub fn transport(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Transport { channel: channel.into(), reason: reason.into() }
    }

    /// Helper constructor for ack timeouts.
    pub fn ack_timeout(chunk: usize, timeout: Duration) -> Self {
        SyncError::AckTimeout { chunk, timeout }
    }

    /// Helper constructor for unusable endpoint URLs.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        SyncError::InvalidUrl { url: url.into() }
    }
}
