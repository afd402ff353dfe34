use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use streamer::index::write_index;
use streamer::rtp::TransportStreamPayloadFormat;
use streamer::sdp::{DEFAULT_PROBE_PACKETS, SessionInfo, generate_sdp, probe_media_description};
use streamer::{
    Codec, FileSource, FrameSource, FramerConfig, IndexFile, MultiFramedSink, PayloadFormat, Pull,
    SinkConfig, StreamError, TrickPlayer, UdpTransport, run_to_completion,
};

#[derive(Parser)]
#[command(name = "rtp-stream", about = "Frame, index and stream MPEG media over RTP")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the frames a framer finds in a file
    Frames {
        input: PathBuf,
        /// Codec name (mpv, mp4v, h264, ac3, mpa, mp3-adu, dv, ts); guessed from the extension otherwise
        #[arg(long, short)]
        codec: Option<Codec>,
        /// Stop after this many frames
        #[arg(long, short = 'n')]
        limit: Option<u64>,
    },
    /// Build the index file of an MPEG-2 Transport Stream
    Index {
        input: PathBuf,
        /// Output path (defaults to the input with a .tsx extension)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Find the TS packet to start from for a play position
    Lookup {
        index: PathBuf,
        /// Normal play time in seconds
        npt: f64,
    },
    /// Print the SDP media description of a file
    Sdp {
        input: PathBuf,
        #[arg(long, short)]
        codec: Option<Codec>,
    },
    /// Packetize a file into RTP and send it over UDP
    Stream {
        input: PathBuf,
        /// Destination address (host:port)
        #[arg(long, short, default_value = "127.0.0.1:5004")]
        dest: SocketAddr,
        #[arg(long, short)]
        codec: Option<Codec>,
        /// Index file of a Transport Stream input, enables --seek and --scale
        #[arg(long, short)]
        index: Option<PathBuf>,
        /// Start position in seconds
        #[arg(long)]
        seek: Option<f64>,
        /// Play speed and direction (1 is normal play, negative plays backwards)
        #[arg(long, allow_negative_numbers = true)]
        scale: Option<i32>,
        /// Largest RTP packet, header included
        #[arg(long, default_value_t = 1456)]
        max_packet_size: usize,
    },
}

fn codec_for(input: &Path, codec: Option<Codec>) -> Result<Codec, StreamError> {
    codec
        .or_else(|| Codec::from_path(input))
        .ok_or_else(|| StreamError::UnsupportedCodec(format!("cannot tell the codec of {}", input.display())))
}

fn frames(input: &Path, codec: Option<Codec>, limit: Option<u64>) -> Result<(), StreamError> {
    let codec = codec_for(input, codec)?;
    let mut framer = codec.framer(FileSource::open(input)?, &FramerConfig::default());
    let buffer_size = {
        let mut config = SinkConfig::default();
        codec.adjust_sink_config(&mut config);
        config.buffer_size
    };
    let mut count = 0u64;
    while limit.is_none_or(|n| count < n) {
        match framer.next_frame(buffer_size)? {
            Pull::Frame(frame) => {
                println!(
                    "{count:6} {:>8} bytes  pts {:10.6}  dur {:8.6}  {:?}",
                    frame.size(),
                    frame.presentation_time.as_secs_f64(),
                    frame.duration.as_secs_f64(),
                    frame.tag,
                );
                if frame.truncated > 0 {
                    tracing::warn!(frame = count, lost = frame.truncated, "frame truncated");
                }
                count += 1;
            }
            Pull::Pending => std::thread::sleep(std::time::Duration::from_millis(10)),
            Pull::Closed => break,
        }
    }
    tracing::info!(frames = count, %codec, "done");
    Ok(())
}

fn index(input: &Path, output: Option<PathBuf>) -> Result<(), StreamError> {
    let output = output.unwrap_or_else(|| input.with_extension("tsx"));
    let writer = BufWriter::new(File::create(&output)?);
    let summary = write_index(FileSource::open(input)?, writer)?;
    println!(
        "{}: {} packets, {} records, {:.3} s",
        output.display(),
        summary.packets,
        summary.records,
        summary.duration
    );
    Ok(())
}

fn lookup(index: &Path, npt: f64) -> Result<(), StreamError> {
    let mut index = IndexFile::open(index)?;
    let position = index.lookup_packet_from_time(npt)?;
    println!(
        "npt {:.3} -> packet {} (record {}, starts at {:.3} s)",
        npt, position.packet_number, position.record, position.npt
    );
    Ok(())
}

fn sdp(input: &Path, codec: Option<Codec>) -> Result<(), StreamError> {
    let codec = codec_for(input, codec)?;
    let mut config = SinkConfig::default();
    codec.adjust_sink_config(&mut config);
    let source = codec.packetizer_input(FileSource::open(input)?, &FramerConfig::default(), &config);
    let media = probe_media_description(source, codec.payload_format(), &config, DEFAULT_PROBE_PACKETS)?;
    print!("{}", generate_sdp(&media, &SessionInfo::default()));
    Ok(())
}

struct StreamOptions {
    dest: SocketAddr,
    codec: Option<Codec>,
    index: Option<PathBuf>,
    seek: Option<f64>,
    scale: Option<i32>,
    max_packet_size: usize,
}

fn stream(input: &Path, options: StreamOptions) -> Result<(), StreamError> {
    let mut config = SinkConfig {
        max_packet_size: options.max_packet_size,
        ..SinkConfig::default()
    };

    let (source, format): (Box<dyn FrameSource>, Box<dyn PayloadFormat>) = match options.index {
        Some(index_path) => {
            let index = IndexFile::open(&index_path)?;
            let mut player = TrickPlayer::new(FileSource::open(input)?, index)?;
            if let Some(npt) = options.seek {
                let packets = player.seek(npt, None)?;
                tracing::info!(npt = player.npt(), packets, "seeked");
            }
            if let Some(scale) = options.scale {
                player.set_next_scale(scale)?;
            }
            player.play()?;
            (Box::new(player), Box::new(TransportStreamPayloadFormat::new()))
        }
        None => {
            if options.seek.is_some() || options.scale.is_some() {
                return Err(StreamError::InvalidConfig(
                    "--seek and --scale need an --index".to_string(),
                ));
            }
            let codec = codec_for(input, options.codec)?;
            codec.adjust_sink_config(&mut config);
            let source = codec.packetizer_input(FileSource::open(input)?, &FramerConfig::default(), &config);
            (source, codec.payload_format())
        }
    };

    let transport = UdpTransport::bind(options.dest)?;
    let mut sink = MultiFramedSink::new(source, format, transport, &config)?;
    tracing::info!(
        dest = %options.dest,
        payload_type = sink.payload_type(),
        ssrc = %format!("{:08X}", sink.ssrc()),
        "streaming"
    );
    let stats = run_to_completion(&mut sink)?;
    println!(
        "sent {} packets ({} payload bytes, {} frames)",
        stats.packets_sent, stats.octets_sent, stats.frames_packed
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let result = match args.command {
        Command::Frames { input, codec, limit } => frames(&input, codec, limit),
        Command::Index { input, output } => index(&input, output),
        Command::Lookup { index: path, npt } => lookup(&path, npt),
        Command::Sdp { input, codec } => sdp(&input, codec),
        Command::Stream {
            input,
            dest,
            codec,
            index,
            seek,
            scale,
            max_packet_size,
        } => stream(
            &input,
            StreamOptions {
                dest,
                codec,
                index,
                seek,
                scale,
                max_packet_size,
            },
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
