//! End-to-end tests: elementary stream → framer → RTP sink → UDP, and
//! Transport Stream → index → trick play → RTP.

use std::collections::VecDeque;
use std::io::Cursor;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use streamer::index::write_index;
use streamer::rtp::{MpegVideoPayloadFormat, SinkPoll, TransportStreamPayloadFormat};
use streamer::sdp::{MediaDescription, SessionInfo, generate_sdp};
use streamer::trick::EsToTransportStream;
use streamer::{
    ByteSource, Codec, FramerConfig, Frame, FrameSource, FrameTag, IndexFile, MemorySource, MultiFramedSink,
    Pull, SinkConfig, TrickPlayer, UdpTransport, run_to_completion,
};

const TS_PACKET_SIZE: usize = 188;

fn vsh() -> Vec<u8> {
    // 352x288, 25 fps
    vec![0x00, 0x00, 0x01, 0xB3, 0x16, 0x01, 0x20, 0x13, 0xFF, 0xFF, 0xE0, 0x18]
}

fn gop(pictures: u8) -> Vec<u8> {
    let tc: u32 = (1 << 12) | u32::from(pictures);
    let word = (tc << 7) | (1 << 6);
    let mut v = vec![0x00, 0x00, 0x01, 0xB8];
    v.extend_from_slice(&word.to_be_bytes());
    v
}

fn picture(temporal_reference: u16, coding_type: u8, slice_len: usize) -> Vec<u8> {
    let mut v = vec![0x00, 0x00, 0x01, 0x00];
    v.push((temporal_reference >> 2) as u8);
    v.push((((temporal_reference & 0x3) as u8) << 6) | (coding_type << 3));
    v.extend_from_slice(&[0xFF, 0xF8, 0x00, 0x00, 0x01, 0x01]);
    v.extend(std::iter::repeat_n(0x5A, slice_len));
    v
}

/// `gops` groups of an I picture and four P pictures at 25 fps, as
/// (bytes, presentation time) chunks.
fn video_chunks(gops: u8) -> Vec<(Vec<u8>, f64)> {
    let mut chunks = Vec::new();
    for g in 0..gops {
        let t = f64::from(g) * 0.2;
        chunks.push(([vsh(), gop(g * 5), picture(0, 1, 900)].concat(), t));
        for p in 1..5u16 {
            chunks.push((picture(p, 2, 250), t + f64::from(p) * 0.04));
        }
    }
    chunks
}

struct Chunks(VecDeque<Frame>);

impl FrameSource for Chunks {
    fn next_frame(&mut self, _max_size: usize) -> streamer::Result<Pull> {
        Ok(self.0.pop_front().map_or(Pull::Closed, Pull::Frame))
    }
}

fn transport_stream(chunks: &[(Vec<u8>, f64)]) -> Vec<u8> {
    let frames = chunks
        .iter()
        .map(|(data, t)| Frame::new(data.clone(), Duration::from_secs_f64(*t), Duration::ZERO, FrameTag::Plain))
        .collect();
    let mut remux = EsToTransportStream::new(Chunks(frames));
    let mut ts = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match remux.read(&mut buf).unwrap() {
            streamer::source::ReadOutcome::Data(n) => ts.extend_from_slice(&buf[..n]),
            streamer::source::ReadOutcome::Pending => panic!("complete input should never pend"),
            streamer::source::ReadOutcome::Closed => return ts,
        }
    }
}

/// Video elementary stream carried on PID 0xE0, PES headers removed.
fn video_es(ts: &[u8]) -> Vec<u8> {
    let mut es = Vec::new();
    for p in ts.chunks(TS_PACKET_SIZE) {
        let pid = (u16::from(p[1] & 0x1F) << 8) | u16::from(p[2]);
        if pid != 0xE0 || p[3] & 0x10 == 0 {
            continue;
        }
        let mut at = if p[3] & 0x20 != 0 { 5 + usize::from(p[4]) } else { 4 };
        if p[1] & 0x40 != 0 {
            at += 9 + usize::from(p[at + 8]);
        }
        es.extend_from_slice(&p[at..]);
    }
    es
}

fn picture_coding_types(es: &[u8]) -> Vec<u8> {
    es.windows(6)
        .filter(|w| w[..4] == [0x00, 0x00, 0x01, 0x00])
        .map(|w| (w[5] >> 3) & 0x07)
        .collect()
}

#[test]
fn mpeg_video_over_udp() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let transport = UdpTransport::bind(receiver.local_addr().unwrap()).unwrap();

    let es: Vec<u8> = video_chunks(1).into_iter().flat_map(|(d, _)| d).collect();
    let config = SinkConfig {
        ssrc: Some(0x1234_5678),
        initial_sequence: Some(100),
        ..SinkConfig::default()
    };
    let framer = Codec::Mpeg12Video.framer(MemorySource::new(es), &FramerConfig::default());
    let mut sink =
        MultiFramedSink::new(framer, Box::new(MpegVideoPayloadFormat::new()), transport, &config).unwrap();
    let stats = run_to_completion(&mut sink).unwrap();
    assert!(stats.packets_sent >= 2);

    let mut buf = [0u8; 2048];
    let mut packets = Vec::new();
    for _ in 0..stats.packets_sent {
        let n = receiver.recv(&mut buf).unwrap();
        packets.push(buf[..n].to_vec());
    }
    for (i, p) in packets.iter().enumerate() {
        assert!(p.len() <= config.max_packet_size);
        assert_eq!(p[0] >> 6, 2);
        assert_eq!(p[1] & 0x7F, 32);
        assert_eq!(u16::from_be_bytes([p[2], p[3]]), 100 + i as u16);
        assert_eq!(&p[8..12], &0x1234_5678u32.to_be_bytes());
    }
    // the last packet ends a picture
    assert_ne!(packets.last().unwrap()[1] & 0x80, 0);
}

#[test]
fn indexed_transport_stream_fast_forward() {
    let ts = transport_stream(&video_chunks(4));
    let mut index_bytes = Vec::new();
    let summary = write_index(MemorySource::new(ts.clone()), &mut index_bytes).unwrap();
    assert!(summary.records > 0);
    assert_eq!(summary.packets, (ts.len() / TS_PACKET_SIZE) as u64);

    let mut index = IndexFile::new(Cursor::new(index_bytes)).unwrap();
    let duration = index.playing_duration().unwrap();
    assert!((duration - 0.76).abs() < 0.02, "duration {duration}");

    let mut player = TrickPlayer::new(MemorySource::new(ts), index).unwrap();
    player.set_next_scale(2).unwrap();
    player.play().unwrap();

    let config = SinkConfig {
        ssrc: Some(1),
        initial_sequence: Some(0),
        ..SinkConfig::default()
    };
    let mut sink = MultiFramedSink::new(
        player,
        Box::new(TransportStreamPayloadFormat::new()),
        Vec::<Vec<u8>>::new(),
        &config,
    )
    .unwrap();
    let far = Instant::now() + Duration::from_secs(3600);
    while sink.poll(far).unwrap() != SinkPoll::Finished {}
    let (_, packets) = sink.into_parts();

    let mut remuxed = Vec::new();
    for p in &packets {
        assert_eq!(p[1] & 0x7F, 33);
        let payload = &p[12..];
        assert_eq!(payload.len() % TS_PACKET_SIZE, 0);
        remuxed.extend_from_slice(payload);
    }
    let types = picture_coding_types(&video_es(&remuxed));
    assert!(types.len() >= 4, "pictures {types:?}");
    assert!(types.iter().all(|t| *t == 1), "only I pictures expected, got {types:?}");
}

#[test]
fn normal_play_range_is_bounded() {
    let ts = transport_stream(&video_chunks(4));
    let mut index_bytes = Vec::new();
    write_index(MemorySource::new(ts.clone()), &mut index_bytes).unwrap();
    let index = IndexFile::new(Cursor::new(index_bytes)).unwrap();

    let mut player = TrickPlayer::new(MemorySource::new(ts), index).unwrap();
    let packets = player.seek(0.25, Some(0.2)).unwrap();
    assert!(packets > 0);
    assert!(player.npt() <= 0.25);

    let mut delivered = 0;
    while let Pull::Frame(frame) = player.next_frame(7 * TS_PACKET_SIZE).unwrap() {
        delivered += frame.size() / TS_PACKET_SIZE;
    }
    assert_eq!(delivered as u64, packets);
}

#[test]
fn sdp_for_transport_stream() {
    let format = TransportStreamPayloadFormat::new();
    let media = MediaDescription::from_format(&format, 33);
    let sdp = generate_sdp(
        &media,
        &SessionInfo {
            duration: Some(0.76),
            ..SessionInfo::default()
        },
    );
    assert!(sdp.contains("m=video 0 RTP/AVP 33\r\n"));
    assert!(sdp.contains("a=rtpmap:33 MP2T/90000\r\n"));
    assert!(sdp.contains("a=range:npt=0-0.760\r\n"));
}
