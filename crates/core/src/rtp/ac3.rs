//! AC-3 payload format (RFC 4184).
//!
//! Every packet starts with a 2-byte payload header:
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    MBZ    | FT|       NF      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `FT` is 0 for one or more complete frames, 1 or 2 for the initial
//! fragment of a frame (depending on whether it holds at least 5/8 of the
//! frame), and 3 for later fragments. `NF` counts frames, or fragments of the
//! fragmented frame.

use super::{FramePiece, OutPacketBuffer, PayloadFormat};
use crate::frame::FrameSource;
use crate::framer::ac3::Ac3Header;

const DEFAULT_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Default)]
pub struct Ac3PayloadFormat {
    header: Option<Ac3Header>,
    total_fragments: u8,
}

impl Ac3PayloadFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header of the first syncframe seen.
    pub fn header(&self) -> Option<Ac3Header> {
        self.header
    }
}

impl PayloadFormat for Ac3PayloadFormat {
    fn media_type(&self) -> &'static str {
        "audio"
    }

    fn encoding_name(&self) -> &'static str {
        "AC3"
    }

    fn clock_rate(&self) -> u32 {
        self.header.map_or(DEFAULT_SAMPLE_RATE, |h| h.sample_rate)
    }

    fn sdp_ready(&self) -> bool {
        self.header.is_some()
    }

    fn special_header_size(&self, _fragmentation_offset: usize) -> usize {
        2
    }

    fn do_special_frame_handling(
        &mut self,
        packet: &mut OutPacketBuffer,
        piece: &FramePiece<'_>,
        _source: &dyn FrameSource,
    ) {
        if self.header.is_none() && piece.fragmentation_offset == 0 {
            self.header = Ac3Header::parse(piece.data);
            if let Some(h) = self.header {
                tracing::debug!(sample_rate = h.sample_rate, bit_rate_kbps = h.bit_rate_kbps, "AC-3 stream");
            }
        }

        let header = if piece.num_remaining_bytes == 0 && piece.fragmentation_offset == 0 {
            let frames = (packet.frames_in_packet() + 1).min(usize::from(u8::MAX));
            [0, frames as u8]
        } else if piece.fragmentation_offset > 0 {
            [3, self.total_fragments]
        } else {
            // An initial fragment fills its packet, so the fragment count is known now.
            let used = piece.data.len().max(1);
            let total = piece.frame_size();
            let five_eighths = total / 2 + total / 8;
            self.total_fragments = total.div_ceil(used).min(usize::from(u8::MAX)) as u8;
            let ft = if used >= five_eighths { 1 } else { 2 };
            [ft, self.total_fragments]
        };
        packet.set_special_header_bytes(&header);

        if piece.num_remaining_bytes == 0 {
            packet.set_marker();
        }
    }
}
