//! H.264 payload format (RFC 6184), packetization mode 1.
//!
//! The source is expected to be a [`FuaFragmenter`](crate::framer::FuaFragmenter)
//! sized to the packet payload, so every frame fits one packet: either a
//! single NAL unit or one FU-A fragment.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::{FramePiece, OutPacketBuffer, PayloadFormat};
use crate::frame::{Frame, FrameSource, FrameTag};
use crate::framer::h264::{NAL_PPS, NAL_SPS};

#[derive(Debug, Default)]
pub struct H264PayloadFormat {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264PayloadFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with parameter sets known out of band.
    pub fn with_parameter_sets(sps: Vec<u8>, pps: Vec<u8>) -> Self {
        Self {
            sps: Some(sps),
            pps: Some(pps),
        }
    }

    pub fn sps(&self) -> Option<&[u8]> {
        self.sps.as_deref()
    }

    pub fn pps(&self) -> Option<&[u8]> {
        self.pps.as_deref()
    }

    fn capture_parameter_set(&mut self, nal: &[u8]) {
        let Some(&first) = nal.first() else {
            return;
        };
        let slot = match first & 0x1F {
            NAL_SPS => &mut self.sps,
            NAL_PPS => &mut self.pps,
            _ => return,
        };
        if slot.as_deref() != Some(nal) {
            tracing::debug!(nal_type = first & 0x1F, len = nal.len(), "H264 parameter set captured");
            *slot = Some(nal.to_vec());
        }
    }
}

impl PayloadFormat for H264PayloadFormat {
    fn media_type(&self) -> &'static str {
        "video"
    }

    fn encoding_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn fmtp(&self) -> Option<String> {
        let mut fmtp = String::from("packetization-mode=1");
        if let Some(sps) = self.sps.as_deref().filter(|s| s.len() >= 4) {
            fmtp.push_str(&format!(
                ";profile-level-id={:02x}{:02x}{:02x}",
                sps[1], sps[2], sps[3]
            ));
        }
        if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
            fmtp.push_str(&format!(
                ";sprop-parameter-sets={},{}",
                BASE64_STANDARD.encode(sps),
                BASE64_STANDARD.encode(pps)
            ));
        }
        Some(fmtp)
    }

    fn sdp_ready(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    fn frame_can_appear_after_packet_start(&self, _frame: &Frame) -> bool {
        false
    }

    fn do_special_frame_handling(
        &mut self,
        packet: &mut OutPacketBuffer,
        piece: &FramePiece<'_>,
        source: &dyn FrameSource,
    ) {
        let completes = matches!(
            piece.tag,
            FrameTag::NalFragment {
                completes_nal_unit: true
            } | FrameTag::NalUnit { .. }
        );
        if piece.fragmentation_offset == 0 && piece.num_remaining_bytes == 0 && completes {
            self.capture_parameter_set(piece.data);
        }

        let ends_access_unit = source
            .access_unit_boundary()
            .is_some_and(|b| b.current_nal_unit_ends_access_unit());
        if completes && piece.num_remaining_bytes == 0 && ends_access_unit {
            packet.set_marker();
        }
        packet.set_timestamp(piece.presentation_time);
    }
}
