//! Byte sources feeding the stream parsers.
//!
//! A [`ByteSource`] hands out raw bytes on request. A read may complete with
//! data, report that nothing is available *yet* ([`ReadOutcome::Pending`]),
//! or report that the source has closed for good ([`ReadOutcome::Closed`]).
//! Pending is the suspension point of the pipeline: the caller gives control
//! back to its driver and asks again later.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, StreamError};

/// Result of a single [`ByteSource::read`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes were written to the front of the buffer.
    Data(usize),
    /// No bytes are available right now; retry later.
    Pending,
    /// The source has no more data and never will.
    Closed,
}

/// Supplier of raw stream bytes.
pub trait ByteSource {
    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Reposition to an absolute byte offset.
    ///
    /// Sources that cannot seek return [`StreamError::NotSeekable`].
    fn seek_to_byte(&mut self, _offset: u64) -> Result<()> {
        Err(StreamError::NotSeekable)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        (**self).read(buf)
    }

    fn seek_to_byte(&mut self, offset: u64) -> Result<()> {
        (**self).seek_to_byte(offset)
    }
}

/// Seekable file-backed source.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    closed: bool,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        tracing::debug!(path = %path.display(), "file source opened");
        Ok(Self {
            file,
            closed: false,
        })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if self.closed {
            return Ok(ReadOutcome::Closed);
        }
        match self.file.read(buf)? {
            0 => {
                self.closed = true;
                Ok(ReadOutcome::Closed)
            }
            n => Ok(ReadOutcome::Data(n)),
        }
    }

    fn seek_to_byte(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.closed = false;
        Ok(())
    }
}

/// In-memory source.
///
/// [`MemorySource::new`] serves a complete buffer and then closes.
/// [`MemorySource::live`] starts empty: bytes arrive in chunks through
/// [`push`](MemorySource::push), reads return [`ReadOutcome::Pending`] while
/// no chunk is queued, and the source closes only after [`close`](MemorySource::close).
/// Each read returns at most one chunk, so chunk boundaries are preserved.
#[derive(Debug, Default)]
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
    chunks: VecDeque<usize>,
    live: bool,
    closed: bool,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            chunks: VecDeque::new(),
            live: false,
            closed: true,
        }
    }

    pub fn live() -> Self {
        Self {
            live: true,
            ..Self::default()
        }
    }

    /// Queue another chunk of bytes (live sources only).
    pub fn push(&mut self, bytes: &[u8]) {
        debug_assert!(self.live, "push on a non-live memory source");
        if bytes.is_empty() {
            return;
        }
        self.data.extend_from_slice(bytes);
        self.chunks.push_back(bytes.len());
    }

    /// Mark the end of a live stream.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let available = if self.live {
            match self.chunks.front_mut() {
                Some(chunk) => {
                    let n = (*chunk).min(buf.len());
                    *chunk -= n;
                    if *chunk == 0 {
                        self.chunks.pop_front();
                    }
                    n
                }
                None if self.closed => return Ok(ReadOutcome::Closed),
                None => return Ok(ReadOutcome::Pending),
            }
        } else {
            let n = (self.data.len() - self.pos).min(buf.len());
            if n == 0 {
                return Ok(ReadOutcome::Closed);
            }
            n
        };
        buf[..available].copy_from_slice(&self.data[self.pos..self.pos + available]);
        self.pos += available;
        Ok(ReadOutcome::Data(available))
    }

    fn seek_to_byte(&mut self, offset: u64) -> Result<()> {
        if self.live {
            return Err(StreamError::NotSeekable);
        }
        self.pos = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        Ok(())
    }
}
