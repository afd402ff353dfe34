//! Error types for the streaming pipeline.

/// Errors that can occur in the streaming pipeline.
///
/// "Not enough data yet" and "source closed" are not errors: they travel as
/// [`Pull::Pending`](crate::frame::Pull::Pending) and
/// [`Pull::Closed`](crate::frame::Pull::Closed). Variants here cover the
/// failures that callers must act on:
///
/// - **Input**: [`Io`](Self::Io), [`NotSeekable`](Self::NotSeekable),
///   [`LostSync`](Self::LostSync).
/// - **Index**: [`EmptyIndex`](Self::EmptyIndex),
///   [`IndexRecordOutOfRange`](Self::IndexRecordOutOfRange).
/// - **Configuration**: [`UnsupportedCodec`](Self::UnsupportedCodec),
///   [`InvalidConfig`](Self::InvalidConfig).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying file or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A seek was requested on a byte source that cannot seek.
    #[error("byte source is not seekable")]
    NotSeekable,

    /// No Transport Stream sync byte could be found near the expected position.
    #[error("transport stream sync byte not found near byte offset {offset}")]
    LostSync { offset: u64 },

    /// The index file has no complete records.
    #[error("index file contains no records")]
    EmptyIndex,

    /// A record beyond the end of the index file was requested.
    #[error("index record {record} out of range ({count} records)")]
    IndexRecordOutOfRange { record: u64, count: u64 },

    /// No framer or payload format exists for the named codec.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A configuration value is unusable (e.g. a packet size smaller than the RTP header).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
