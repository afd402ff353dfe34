//! Payload formats that carry frames as they are, with no payload header.

use super::PayloadFormat;
use crate::framer::ts::TS_PACKET_SIZE;

/// `MP2T` payload format (RFC 2250 §2), static payload type 33.
///
/// Packets hold whole 188-byte Transport Stream packets. The marker bit is
/// never set.
#[derive(Debug, Default)]
pub struct TransportStreamPayloadFormat;

impl TransportStreamPayloadFormat {
    pub fn new() -> Self {
        Self
    }
}

impl PayloadFormat for TransportStreamPayloadFormat {
    fn media_type(&self) -> &'static str {
        "video"
    }

    fn encoding_name(&self) -> &'static str {
        "MP2T"
    }

    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn default_payload_type(&self) -> u8 {
        33
    }

    fn allow_fragmentation_after_start(&self) -> bool {
        true
    }

    fn allow_other_frames_after_last_fragment(&self) -> bool {
        true
    }

    fn fragment_granularity(&self) -> usize {
        TS_PACKET_SIZE
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::SinkConfig;
    use crate::framer::TsFramer;
    use crate::framer::ts::tests::paced_stream;
    use crate::rtp::{MultiFramedSink, RTP_HEADER_SIZE, SinkPoll};
    use crate::source::MemorySource;

    #[test]
    fn whole_ts_packets_per_rtp_packet() {
        let config = SinkConfig {
            ssrc: Some(9),
            initial_sequence: Some(0),
            ..SinkConfig::default()
        };
        let mut sink = MultiFramedSink::new(
            TsFramer::new(MemorySource::new(paced_stream(40))),
            Box::new(TransportStreamPayloadFormat::new()),
            Vec::<Vec<u8>>::new(),
            &config,
        )
        .unwrap();
        assert_eq!(sink.payload_type(), 33);
        let far = Instant::now() + Duration::from_secs(3600);
        while sink.poll(far).unwrap() != SinkPoll::Finished {}
        let packets = sink.into_parts().1;

        let mut total = 0;
        for packet in &packets {
            let payload = &packet[RTP_HEADER_SIZE..];
            assert_eq!(payload.len() % TS_PACKET_SIZE, 0);
            assert!(payload.len() <= 7 * TS_PACKET_SIZE);
            assert!(payload.chunks(TS_PACKET_SIZE).all(|p| p[0] == 0x47));
            assert_eq!(packet[1] & 0x80, 0);
            total += payload.len() / TS_PACKET_SIZE;
        }
        assert_eq!(total, 40);
    }
}
