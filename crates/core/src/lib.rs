pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod framer;
pub mod index;
pub mod parser;
pub mod rtp;
pub mod sdp;
pub mod source;
pub mod transport;
pub mod trick;

pub use codec::Codec;
pub use config::{FramerConfig, SinkConfig};
pub use error::{Result, StreamError};
pub use frame::{Frame, FrameSource, FrameTag, Pull};
pub use index::IndexFile;
pub use rtp::{MultiFramedSink, PayloadFormat, run_to_completion};
pub use source::{ByteSource, FileSource, MemorySource};
pub use transport::{PacketTransport, UdpTransport};
pub use trick::TrickPlayer;
