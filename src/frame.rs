//! Per-channel message reassembly.
//!
//! The link delivers application messages as a sequence of small notification
//! fragments terminated by a single-byte end marker. [`FrameBuffer`] owns one
//! accumulator per channel and yields the concatenated payload when the
//! marker arrives. Nothing closes a message but the marker; there is no size
//! threshold.

use std::collections::HashMap;

use tracing::trace;

use crate::channel::{Channel, END_MARKER};
use crate::error::SyncError;
use crate::transport::TransportError;

/// Outcome of feeding one fragment into the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A full message is ready; the channel's accumulator is now empty.
    Complete(Vec<u8>),
    /// Fragment absorbed; more are expected.
    Buffered,
    /// The end marker arrived on an idle channel. Logged, not fatal.
    EmptyMarker,
}

/// Reassembles multi-notification payloads, one accumulator per channel.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    accumulators: HashMap<Channel, Vec<u8>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received fragment.
    ///
    /// A lone `0x00` byte flushes the channel's accumulator as a complete
    /// message. `StatusAck` bypasses accumulation entirely: each fragment is
    /// already a complete message. Firmware-channel payloads must not be fed
    /// here; they are inspected by the firmware path and never buffered.
    pub fn on_fragment(&mut self, channel: Channel, bytes: &[u8]) -> FrameOutcome {
        debug_assert!(channel != Channel::Firmware, "firmware payloads are never reassembled");

        // Firmware excluded above, so this bypass is the status-ack channel.
        if channel.bypasses_reassembly() {
            return FrameOutcome::Complete(bytes.to_vec());
        }

        if bytes == [END_MARKER] {
            return match self.accumulators.remove(&channel) {
                Some(message) => {
                    trace!("completed {} byte message on {channel}", message.len());
                    FrameOutcome::Complete(message)
                }
                None => FrameOutcome::EmptyMarker,
            };
        }

        let accumulator = self.accumulators.entry(channel).or_default();
        accumulator.extend_from_slice(bytes);
        trace!("buffered {} bytes on {channel} ({} total)", bytes.len(), accumulator.len());
        FrameOutcome::Buffered
    }

    /// Handle a read error reported for a channel.
    ///
    /// "Not permitted" reads are noise from unrelated characteristics: they
    /// are dropped without touching any accumulator and return `None`. Any
    /// other error discards the channel's in-progress accumulator and returns
    /// the failure to surface.
    pub fn on_read_error(
        &mut self,
        channel: Channel,
        error: &TransportError,
    ) -> Option<SyncError> {
        if error.is_not_permitted() {
            return None;
        }
        self.accumulators.remove(&channel);
        Some(SyncError::transport(channel.to_string(), error.to_string()))
    }

    /// Bytes currently buffered for a channel. Zero when idle.
    pub fn pending_len(&self, channel: Channel) -> usize {
        self.accumulators.get(&channel).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MARKER: &[u8] = &[END_MARKER];

    #[test]
    fn reassembles_fragments_until_marker() {
        let mut frames = FrameBuffer::new();
        assert_eq!(frames.on_fragment(Channel::DataRaw, b"hel"), FrameOutcome::Buffered);
        assert_eq!(frames.on_fragment(Channel::DataRaw, b"lo "), FrameOutcome::Buffered);
        assert_eq!(frames.on_fragment(Channel::DataRaw, b"world"), FrameOutcome::Buffered);
        assert_eq!(
            frames.on_fragment(Channel::DataRaw, MARKER),
            FrameOutcome::Complete(b"hello world".to_vec())
        );
        assert_eq!(frames.pending_len(Channel::DataRaw), 0);
    }

    #[test]
    fn channels_accumulate_independently() {
        let mut frames = FrameBuffer::new();
        frames.on_fragment(Channel::DataParsed, b"aaa");
        frames.on_fragment(Channel::LogPacket, b"bbb");
        assert_eq!(
            frames.on_fragment(Channel::LogPacket, MARKER),
            FrameOutcome::Complete(b"bbb".to_vec())
        );
        // The other channel's accumulator is untouched.
        assert_eq!(frames.pending_len(Channel::DataParsed), 3);
    }

    #[test]
    fn marker_on_idle_channel_is_reported_empty() {
        let mut frames = FrameBuffer::new();
        assert_eq!(frames.on_fragment(Channel::LogPrint, MARKER), FrameOutcome::EmptyMarker);
        // Still idle; a following message is unaffected.
        frames.on_fragment(Channel::LogPrint, b"x");
        assert_eq!(
            frames.on_fragment(Channel::LogPrint, MARKER),
            FrameOutcome::Complete(b"x".to_vec())
        );
    }

    #[test]
    fn status_ack_bypasses_accumulation() {
        let mut frames = FrameBuffer::new();
        assert_eq!(
            frames.on_fragment(Channel::StatusAck, b"ok"),
            FrameOutcome::Complete(b"ok".to_vec())
        );
        // Even a bare zero byte is a complete single-fragment message here.
        assert_eq!(
            frames.on_fragment(Channel::StatusAck, MARKER),
            FrameOutcome::Complete(vec![END_MARKER])
        );
    }

    #[test]
    fn zero_byte_inside_larger_fragment_is_data() {
        let mut frames = FrameBuffer::new();
        frames.on_fragment(Channel::DataRaw, &[0x00, 0x01]);
        assert_eq!(
            frames.on_fragment(Channel::DataRaw, MARKER),
            FrameOutcome::Complete(vec![0x00, 0x01])
        );
    }

    #[test]
    fn not_permitted_error_is_dropped_silently() {
        let mut frames = FrameBuffer::new();
        frames.on_fragment(Channel::DataRaw, b"partial");
        assert!(frames.on_read_error(Channel::DataRaw, &TransportError::NotPermitted).is_none());
        // Accumulator untouched.
        assert_eq!(frames.pending_len(Channel::DataRaw), 7);
    }

    #[test]
    fn other_errors_clear_accumulator_and_surface() {
        let mut frames = FrameBuffer::new();
        frames.on_fragment(Channel::DataRaw, b"partial");
        let err = frames
            .on_read_error(Channel::DataRaw, &TransportError::Other("gatt failure".into()))
            .expect("failure surfaces");
        assert!(err.to_string().contains("dataRaw"));
        assert_eq!(frames.pending_len(Channel::DataRaw), 0);
    }

    proptest! {
        #[test]
        fn marker_terminated_sequences_emit_exactly_the_concatenation(
            fragments in prop::collection::vec(
                prop::collection::vec(1u8..=255, 1..24),
                0..12,
            )
        ) {
            let mut frames = FrameBuffer::new();
            let mut expected = Vec::new();
            for fragment in &fragments {
                expected.extend_from_slice(fragment);
                prop_assert_eq!(
                    frames.on_fragment(Channel::DataParsedV2, fragment),
                    FrameOutcome::Buffered
                );
            }
            let outcome = frames.on_fragment(Channel::DataParsedV2, MARKER);
            if fragments.is_empty() {
                prop_assert_eq!(outcome, FrameOutcome::EmptyMarker);
            } else {
                prop_assert_eq!(outcome, FrameOutcome::Complete(expected));
            }
            prop_assert_eq!(frames.pending_len(Channel::DataParsedV2), 0);
        }
    }
}
