//! Process-wide device identity.
//!
//! The peripheral announces its serial number over the firmware channel; the
//! transport supplies a connection identifier when a peripheral is picked.
//! Both are learned at unpredictable points after startup and read by the
//! backend request builder on every call, so they live behind last-write-wins
//! locks. The host identifier is fixed for the process lifetime.

use std::sync::RwLock;

use uuid::Uuid;

/// Placeholder reported until the real value is learned.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Maximum digits a decoded serial may carry.
const MAX_SERIAL_DIGITS: usize = 16;

/// Width of the binary serial announcement.
const SERIAL_WIDTH: usize = 6;

/// Identity values attached to every backend request.
#[derive(Debug)]
pub struct DeviceIdentity {
    serial: RwLock<String>,
    link_id: RwLock<String>,
    host_id: String,
}

impl DeviceIdentity {
    pub fn new() -> Self {
        Self {
            serial: RwLock::new(UNKNOWN_IDENTITY.to_string()),
            link_id: RwLock::new(UNKNOWN_IDENTITY.to_string()),
            host_id: Uuid::new_v4().to_string(),
        }
    }

    /// Device serial number, or [`UNKNOWN_IDENTITY`] before it is learned.
    pub fn serial(&self) -> String {
        self.serial.read().map(|s| s.clone()).unwrap_or_else(|_| UNKNOWN_IDENTITY.to_string())
    }

    pub fn set_serial(&self, serial: impl Into<String>) {
        if let Ok(mut slot) = self.serial.write() {
            *slot = serial.into();
        }
    }

    /// Identifier of the peripheral the link last connected to.
    pub fn link_id(&self) -> String {
        self.link_id.read().map(|s| s.clone()).unwrap_or_else(|_| UNKNOWN_IDENTITY.to_string())
    }

    pub fn set_link_id(&self, id: impl Into<String>) {
        if let Ok(mut slot) = self.link_id.write() {
            *slot = id.into();
        }
    }

    /// Stable identifier of this host process.
    pub fn host_id(&self) -> &str {
        &self.host_id
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a firmware-channel payload as a device serial announcement.
///
/// Current firmware sends the serial as a fixed-width 6-byte identifier,
/// least significant byte last (reversed and zero-padded on the wire),
/// formatted here as a decimal string: `[0,0,0,0,0,1]` decodes to `"1"`.
/// Older firmware sends the serial as a plain ASCII digit string of up to
/// 16 characters; any other length falls through to that interpretation.
/// Returns `None` when the payload is neither, in which case it is next
/// tested as a firmware-update URL.
pub fn decode_serial(payload: &[u8]) -> Option<String> {
    if payload.len() == SERIAL_WIDTH {
        let mut raw = [0u8; 8];
        for (slot, byte) in raw.iter_mut().zip(payload.iter().rev()) {
            *slot = *byte;
        }
        let serial = u64::from_le_bytes(raw).to_string();
        // A 48-bit value always fits the digit bound; kept as validation.
        if serial.len() > MAX_SERIAL_DIGITS || !serial.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        return Some(serial);
    }

    let text = std::str::from_utf8(payload).ok()?;
    if text.is_empty() || text.len() > MAX_SERIAL_DIGITS {
        return None;
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(text.to_string())
}
