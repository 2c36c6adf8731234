//! Logical channel identifiers for the peripheral link.
//!
//! Each channel maps to one GATT characteristic on the device. The set is
//! closed: the device firmware and this engine agree on the UUIDs at build
//! time, and anything else observed on the link is noise.

use std::fmt;

/// Single zero byte that terminates a multi-fragment message on chunked
/// channels, and finalizes a firmware push.
pub const END_MARKER: u8 = 0x00;

/// Logical data channel multiplexed over the wireless link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Backend acknowledgements are written back to the device here.
    StatusAck,
    /// Unparsed device measurements.
    DataRaw,
    /// Device-parsed measurements.
    DataParsed,
    /// Second-generation parsed measurements.
    DataParsedV2,
    /// Human-readable device log lines.
    LogPrint,
    /// Binary device log packets.
    LogPacket,
    /// Serial announcements and firmware-update URLs inbound; firmware image
    /// chunks outbound.
    Firmware,
}

impl Channel {
    /// Every channel, in characteristic-UUID order.
    pub const ALL: [Channel; 7] = [
        Channel::StatusAck,
        Channel::DataRaw,
        Channel::DataParsed,
        Channel::DataParsedV2,
        Channel::LogPrint,
        Channel::LogPacket,
        Channel::Firmware,
    ];

    /// Characteristic UUID this channel is bound to.
    pub fn uuid(&self) -> &'static str {
        match self {
            Channel::StatusAck => "33333333-2222-2222-1111-1111FFFFFFFF",
            Channel::DataRaw => "35333333-2222-2222-1111-1111FFFFFFFF",
            Channel::DataParsed => "36333333-2222-2222-1111-1111FFFFFFFF",
            Channel::DataParsedV2 => "37333333-2222-2222-1111-1111FFFFFFFF",
            Channel::LogPrint => "38333333-2222-2222-1111-1111FFFFFFFF",
            Channel::LogPacket => "39333333-2222-2222-1111-1111FFFFFFFF",
            Channel::Firmware => "40333333-2222-2222-1111-1111FFFFFFFF",
        }
    }

    /// Map a characteristic UUID back to its channel, if it is one of ours.
    ///
    /// Comparison is case-insensitive; transports differ in how they render
    /// UUID strings.
    pub fn from_uuid(uuid: &str) -> Option<Channel> {
        Channel::ALL.iter().copied().find(|c| c.uuid().eq_ignore_ascii_case(uuid))
    }

    /// Channels that never participate in multi-fragment reassembly.
    ///
    /// Status acks are single-fragment by contract; firmware notifications
    /// are inspected directly (serial vs. update URL) and never buffered.
    pub fn bypasses_reassembly(&self) -> bool {
        matches!(self, Channel::StatusAck | Channel::Firmware)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::StatusAck => "statusAck",
            Channel::DataRaw => "dataRaw",
            Channel::DataParsed => "dataParsed",
            Channel::DataParsedV2 => "dataParsedV2",
            Channel::LogPrint => "logPrint",
            Channel::LogPacket => "logPacket",
            Channel::Firmware => "firmware",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_uuid(channel.uuid()), Some(channel));
        }
    }

    #[test]
    fn uuid_lookup_is_case_insensitive() {
        let lower = Channel::DataRaw.uuid().to_ascii_lowercase();
        assert_eq!(Channel::from_uuid(&lower), Some(Channel::DataRaw));
    }

    #[test]
    fn unknown_uuid_is_rejected() {
        assert_eq!(Channel::from_uuid("12345678-0000-0000-0000-000000000000"), None);
    }

    #[test]
    fn reassembly_bypass_set() {
        assert!(Channel::StatusAck.bypasses_reassembly());
        assert!(Channel::Firmware.bypasses_reassembly());
        assert!(!Channel::DataRaw.bypasses_reassembly());
        assert!(!Channel::LogPacket.bypasses_reassembly());
    }
}
