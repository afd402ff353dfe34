//! MPEG-1/2 video payload format (RFC 2250 §3).
//!
//! Every packet carries a 4-byte video-specific header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    MBZ  |T|         TR        | |N|S|B|E|  P  | | BFC | | FFC |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!                                  AN              FBV     FFV
//! ```

use super::{FramePiece, OutPacketBuffer, PayloadFormat};
use crate::frame::{Frame, FrameSource, FrameTag};
use crate::framer::mpeg_video::{PICTURE_START_CODE, SEQUENCE_HEADER_CODE, is_slice_start_code};

#[derive(Debug, Default, Clone, Copy)]
struct PictureState {
    temporal_reference: u32,
    picture_coding_type: u32,
    vector_code_bits: u32,
}

impl PictureState {
    /// Read the fields following a picture start code.
    fn from_picture_header(frame: &[u8]) -> Option<Self> {
        let next4 = u32::from_be_bytes(frame.get(4..8)?.try_into().ok()?);
        let byte8 = u32::from(frame.get(8).copied().unwrap_or(0));
        let temporal_reference = next4 >> 22;
        let picture_coding_type = (next4 >> 19) & 0x07;
        let (mut fbv, mut bfc, mut ffv, mut ffc) = (0, 0, 0, 0);
        if picture_coding_type == 3 {
            fbv = (byte8 & 0x40) >> 6;
            bfc = (byte8 & 0x38) >> 3;
        }
        if picture_coding_type == 2 || picture_coding_type == 3 {
            ffv = (next4 & 0x04) >> 2;
            ffc = ((next4 & 0x03) << 1) | ((byte8 & 0x80) >> 7);
        }
        Some(Self {
            temporal_reference,
            picture_coding_type,
            vector_code_bits: (fbv << 7) | (bfc << 4) | (ffv << 3) | ffc,
        })
    }
}

/// `MPV` payload format, static payload type 32.
#[derive(Debug, Default)]
pub struct MpegVideoPayloadFormat {
    picture: PictureState,
    sequence_header_present: bool,
    packet_begins_slice: bool,
    packet_ends_slice: bool,
    previous_frame_was_slice: bool,
}

impl MpegVideoPayloadFormat {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadFormat for MpegVideoPayloadFormat {
    fn media_type(&self) -> &'static str {
        "video"
    }

    fn encoding_name(&self) -> &'static str {
        "MPV"
    }

    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn default_payload_type(&self) -> u8 {
        32
    }

    fn special_header_size(&self, _fragmentation_offset: usize) -> usize {
        4
    }

    fn allow_fragmentation_after_start(&self) -> bool {
        true
    }

    /// Only another slice may follow a slice in the same packet, so picture
    /// and sequence headers always start a packet.
    fn frame_can_appear_after_packet_start(&self, frame: &Frame) -> bool {
        if !self.previous_frame_was_slice {
            return true;
        }
        frame
            .data
            .get(..4)
            .is_some_and(|code| is_slice_start_code(u32::from_be_bytes([code[0], code[1], code[2], code[3]])))
    }

    fn do_special_frame_handling(
        &mut self,
        packet: &mut OutPacketBuffer,
        piece: &FramePiece<'_>,
        _source: &dyn FrameSource,
    ) {
        if packet.is_first_frame_in_packet() {
            self.sequence_header_present = false;
            self.packet_begins_slice = false;
            self.packet_ends_slice = false;
        }

        let mut is_slice = true;
        if piece.fragmentation_offset == 0 {
            let Some(code) = piece.data.get(..4) else {
                return;
            };
            let code = u32::from_be_bytes([code[0], code[1], code[2], code[3]]);
            is_slice = false;
            if code == SEQUENCE_HEADER_CODE {
                self.sequence_header_present = true;
            } else if code == PICTURE_START_CODE {
                if let Some(state) = PictureState::from_picture_header(piece.data) {
                    self.picture = state;
                }
                // a picture header travels with its first slice
                is_slice = true;
            } else if is_slice_start_code(code) {
                is_slice = true;
            } else if code & 0xFFFF_FF00 != 0x0000_0100 {
                tracing::warn!(code = format_args!("{code:#010x}"), "unexpected first bytes in MPEG video frame");
            }
        }
        if is_slice {
            self.packet_begins_slice = piece.fragmentation_offset == 0;
            self.packet_ends_slice = piece.num_remaining_bytes == 0;
        }

        // Later frames in the packet may carry a newer picture header, so
        // the header is rewritten for every frame.
        let header = (self.picture.temporal_reference << 16)
            | (u32::from(self.sequence_header_present) << 13)
            | (u32::from(self.packet_begins_slice) << 12)
            | (u32::from(self.packet_ends_slice) << 11)
            | (self.picture.picture_coding_type << 8)
            | self.picture.vector_code_bits;
        packet.set_special_header_word(header);
        packet.set_timestamp(piece.presentation_time);

        if piece.num_remaining_bytes == 0
            && matches!(piece.tag, FrameTag::Picture { picture_end: true, .. })
        {
            packet.set_marker();
        }
        self.previous_frame_was_slice = is_slice;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::framer::Mpeg12VideoFramer;
    use crate::framer::mpeg_video::tests::{gop, picture, vsh};
    use crate::rtp::{MultiFramedSink, RTP_HEADER_SIZE};
    use crate::source::MemorySource;
    use std::time::Instant;

    fn packetize(data: Vec<u8>, max_packet_size: usize) -> Vec<Vec<u8>> {
        let framer = Mpeg12VideoFramer::new(MemorySource::new(data));
        let config = SinkConfig {
            max_packet_size,
            preferred_packet_size: max_packet_size,
            ..SinkConfig::default()
        };
        let mut sink = MultiFramedSink::new(
            framer,
            Box::new(MpegVideoPayloadFormat::new()),
            Vec::<Vec<u8>>::new(),
            &config,
        )
        .unwrap();
        let far = Instant::now() + std::time::Duration::from_secs(3600);
        while sink.poll(far).unwrap() != crate::rtp::SinkPoll::Finished {}
        sink.into_parts().1
    }

    fn special_header(packet: &[u8]) -> u32 {
        u32::from_be_bytes([packet[12], packet[13], packet[14], packet[15]])
    }

    #[test]
    fn picture_header_fields() {
        // P picture, temporal reference 5, full_pel 1, forward code 3
        let mut frame = vec![0, 0, 1, 0];
        let word: u32 = (5 << 22) | (2 << 19) | (0xFFFF << 3) | (1 << 2) | 0b01;
        frame.extend(word.to_be_bytes());
        frame.push(0x80);
        let state = PictureState::from_picture_header(&frame).unwrap();
        assert_eq!(state.temporal_reference, 5);
        assert_eq!(state.picture_coding_type, 2);
        assert_eq!(state.vector_code_bits, (1 << 3) | 0b011);
    }

    #[test]
    fn stream_packets_carry_picture_state() {
        let mut data = vsh(3);
        data.extend(gop(0, 0, 0, 0));
        data.extend(picture(0, 1, 100));
        data.extend(picture(1, 2, 100));
        data.extend(picture(2, 2, 100));
        let packets = packetize(data, 1400);

        let markers = packets.iter().filter(|p| p[1] & 0x80 != 0).count();
        assert_eq!(markers, 3);
        // first packet carries the sequence header and the I picture
        let first = special_header(&packets[0]);
        assert_ne!(first & (1 << 13), 0, "sequence header bit");
        assert_eq!((first >> 8) & 0x07, 1);
        let last = special_header(packets.last().unwrap());
        assert_eq!(last >> 16, 2);
        assert_eq!((last >> 8) & 0x07, 2);
        assert_ne!(last & (1 << 12), 0, "begins slice");
        assert_ne!(last & (1 << 11), 0, "ends slice");
    }

    fn slice(number: u8, len: usize) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, number];
        v.extend(std::iter::repeat_n(0x5A, len));
        v
    }

    /// Start codes in a packet's payload, in order.
    fn start_codes(packet: &[u8]) -> Vec<u8> {
        let payload = &packet[RTP_HEADER_SIZE + 4..];
        payload
            .windows(4)
            .filter(|w| w[..3] == [0x00, 0x00, 0x01])
            .map(|w| w[3])
            .collect()
    }

    #[test]
    fn slices_of_a_picture_share_a_packet() {
        let i_picture = [picture(0, 1, 20), slice(2, 20), slice(3, 20)].concat();
        let p_picture = [picture(1, 2, 20), slice(2, 20)].concat();
        let head = [vsh(3), gop(0, 0, 0, 0)].concat();
        let data = [head.clone(), i_picture.clone(), p_picture.clone()].concat();
        let packets = packetize(data, 1400);

        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0][RTP_HEADER_SIZE + 4..], &[head, i_picture].concat()[..]);
        assert_eq!(&packets[1][RTP_HEADER_SIZE + 4..], &p_picture[..]);

        let first = special_header(&packets[0]);
        assert_eq!(first >> 16, 0);
        assert_ne!(first & (1 << 13), 0, "sequence header bit");
        assert_ne!(first & (1 << 12), 0, "begins slice");
        assert_ne!(first & (1 << 11), 0, "ends slice");
        assert_eq!((first >> 8) & 0x07, 1);

        let second = special_header(&packets[1]);
        assert_eq!(second >> 16, 1);
        assert_eq!(second & (1 << 13), 0);
        assert_ne!(second & (1 << 12), 0, "begins slice");
        assert_ne!(second & (1 << 11), 0, "ends slice");
        assert_eq!((second >> 8) & 0x07, 2);

        assert!(packets.iter().all(|p| p[1] & 0x80 != 0));
    }

    #[test]
    fn picture_header_never_follows_a_slice() {
        let mut data = [vsh(3), gop(0, 0, 0, 0)].concat();
        for tr in 0..4 {
            data.extend(picture(tr, if tr == 0 { 1 } else { 2 }, 10));
            data.extend(slice(2, 10));
        }
        let packets = packetize(data, 1400);
        assert_eq!(packets.len(), 4);
        for packet in &packets {
            let codes = start_codes(packet);
            if let Some(first_slice) = codes.iter().position(|c| (0x01..=0xAF).contains(c)) {
                assert!(
                    codes[first_slice..].iter().all(|c| (0x01..=0xAF).contains(c)),
                    "non-slice unit after a slice: {codes:02X?}"
                );
            }
            assert!(packet.len() <= 1400);
        }
        // every packet after the first starts with a picture header
        for packet in &packets[1..] {
            assert_eq!(start_codes(packet)[0], 0x00);
        }
    }

    #[test]
    fn fragmented_slice_flags() {
        let mut data = vsh(3);
        data.extend(gop(0, 0, 0, 0));
        data.extend(picture(0, 1, 3000));
        let packets = packetize(data, 1000);
        assert!(packets.iter().all(|p| p.len() <= 1000));
        let slice_packets: Vec<u32> = packets
            .iter()
            .map(|p| special_header(p))
            .filter(|h| (h >> 8) & 0x07 == 1)
            .collect();
        assert!(slice_packets.len() >= 3);
        // middle fragments neither begin nor end a slice
        let middle = slice_packets[slice_packets.len() - 2];
        assert_eq!(middle & (0b11 << 11), 0);
        let last = *slice_packets.last().unwrap();
        assert_ne!(last & (1 << 11), 0);
        assert_eq!(packets.iter().filter(|p| p[1] & 0x80 != 0).count(), 1);
        let total: usize = packets.iter().map(|p| p.len() - RTP_HEADER_SIZE - 4).sum();
        assert!(total > 3000);
    }
}
