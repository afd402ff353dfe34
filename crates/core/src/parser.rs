//! Cursor-based incremental parsing over a [`ByteSource`].
//!
//! [`StreamParser`] keeps a growable window of bytes read from its source,
//! a committed read position and a single checkpoint slot. Framers call
//! [`save_parser_state`](StreamParser::save_parser_state) at the start of
//! every syntactic unit. When the source runs dry mid-unit the parser rewinds
//! to the checkpoint and reports [`Interrupt::Pending`]; the framer returns
//! "no frame yet" and re-parses the whole unit once more bytes arrive.
//!
//! ```text
//!  bank: [ discarded | ....... kept ....... | unread ]
//!                     ^mark      ^cur        ^bank.len()
//! ```

use crate::error::StreamError;
use crate::frame::FrameBuffer;
use crate::source::{ByteSource, ReadOutcome};

const READ_CHUNK: usize = 16 * 1024;

/// Why a parse step could not complete.
#[derive(Debug)]
pub enum Interrupt {
    /// Not enough input yet; the cursor has been rewound to the checkpoint.
    Pending,
    /// The source closed. The cursor is left where parsing stopped.
    Closed,
    /// The source failed.
    Failed(StreamError),
}

impl From<StreamError> for Interrupt {
    fn from(e: StreamError) -> Self {
        Interrupt::Failed(e)
    }
}

pub type Parse<T> = std::result::Result<T, Interrupt>;

/// Incremental byte parser with one checkpoint.
#[derive(Debug)]
pub struct StreamParser<S> {
    source: S,
    bank: Vec<u8>,
    cur: usize,
    mark: Option<usize>,
    /// Absolute stream offset of `bank[0]`.
    base: u64,
    closed: bool,
}

impl<S: ByteSource> StreamParser<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            bank: Vec::with_capacity(READ_CHUNK),
            cur: 0,
            mark: None,
            base: 0,
            closed: false,
        }
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Absolute offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.base + self.cur as u64
    }

    /// True once the source has closed and every buffered byte was consumed.
    pub fn at_end(&self) -> bool {
        self.closed && self.cur >= self.bank.len()
    }

    /// Record the current position as the single checkpoint, replacing any earlier one.
    pub fn save_parser_state(&mut self) {
        self.mark = Some(self.cur);
    }

    /// Rewind to the checkpoint and invalidate it.
    pub fn restore_saved_parser_state(&mut self) {
        let mark = self.mark.take();
        debug_assert!(mark.is_some(), "restore without a saved parser state");
        if let Some(mark) = mark {
            self.cur = mark;
        }
    }

    /// Discard all buffered input after a discontinuity.
    ///
    /// The next byte read from the source is treated as following the
    /// last byte the source delivered.
    pub fn flush_input(&mut self) {
        self.base += self.bank.len() as u64;
        self.bank.clear();
        self.cur = 0;
        self.mark = None;
        self.closed = false;
    }

    /// Seek the source and drop buffered input.
    pub fn seek_to_byte(&mut self, offset: u64) -> crate::Result<()> {
        self.source.seek_to_byte(offset)?;
        self.bank.clear();
        self.cur = 0;
        self.mark = None;
        self.base = offset;
        self.closed = false;
        Ok(())
    }

    fn interrupt(&mut self, interrupt: Interrupt) -> Interrupt {
        if matches!(interrupt, Interrupt::Pending) {
            if let Some(mark) = self.mark.take() {
                self.cur = mark;
            }
        }
        interrupt
    }

    fn compact(&mut self) {
        let keep_from = self.mark.map_or(self.cur, |m| m.min(self.cur));
        if keep_from == 0 {
            return;
        }
        self.bank.drain(..keep_from);
        self.base += keep_from as u64;
        self.cur -= keep_from;
        if let Some(mark) = self.mark.as_mut() {
            *mark -= keep_from;
        }
    }

    fn ensure(&mut self, n: usize) -> Parse<()> {
        while self.bank.len() - self.cur < n {
            if self.closed {
                return Err(self.interrupt(Interrupt::Closed));
            }
            self.compact();
            let old = self.bank.len();
            self.bank.resize(old + READ_CHUNK.max(n), 0);
            match self.source.read(&mut self.bank[old..]) {
                Ok(ReadOutcome::Data(k)) if k > 0 => self.bank.truncate(old + k),
                Ok(ReadOutcome::Data(_)) | Ok(ReadOutcome::Pending) => {
                    self.bank.truncate(old);
                    return Err(self.interrupt(Interrupt::Pending));
                }
                Ok(ReadOutcome::Closed) => {
                    self.bank.truncate(old);
                    self.closed = true;
                }
                Err(e) => {
                    self.bank.truncate(old);
                    return Err(Interrupt::Failed(e));
                }
            }
        }
        Ok(())
    }

    pub fn get_1_byte(&mut self) -> Parse<u8> {
        self.ensure(1)?;
        let b = self.bank[self.cur];
        self.cur += 1;
        Ok(b)
    }

    pub fn get_2_bytes(&mut self) -> Parse<u16> {
        self.ensure(2)?;
        let v = u16::from_be_bytes([self.bank[self.cur], self.bank[self.cur + 1]]);
        self.cur += 2;
        Ok(v)
    }

    pub fn get_4_bytes(&mut self) -> Parse<u32> {
        let v = self.test_4_bytes()?;
        self.cur += 4;
        Ok(v)
    }

    pub fn test_1_byte(&mut self) -> Parse<u8> {
        self.ensure(1)?;
        Ok(self.bank[self.cur])
    }

    /// Peek the next four bytes (big-endian) without consuming them.
    pub fn test_4_bytes(&mut self) -> Parse<u32> {
        self.ensure(4)?;
        let b = &self.bank[self.cur..self.cur + 4];
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Peek `n` bytes without consuming them.
    pub fn test_bytes(&mut self, n: usize) -> Parse<&[u8]> {
        self.ensure(n)?;
        Ok(&self.bank[self.cur..self.cur + n])
    }

    pub fn get_bytes(&mut self, n: usize) -> Parse<&[u8]> {
        self.ensure(n)?;
        let start = self.cur;
        self.cur += n;
        Ok(&self.bank[start..start + n])
    }

    pub fn skip_bytes(&mut self, n: usize) -> Parse<()> {
        self.ensure(n)?;
        self.cur += n;
        Ok(())
    }

    /// Consume whatever is buffered, without reading from the source.
    pub fn take_buffered(&mut self) -> &[u8] {
        let start = self.cur;
        self.cur = self.bank.len();
        &self.bank[start..]
    }

    /// Copy bytes into `out` up to (not including) the next `00 00 01` prefix
    /// and return the four-byte start code found there, unconsumed.
    ///
    /// On closure the unparsed tail is appended to `out` before returning
    /// [`Interrupt::Closed`], so the caller can deliver it as a final unit.
    pub fn save_to_next_start_code(&mut self, out: &mut FrameBuffer) -> Parse<u32> {
        loop {
            match self.test_4_bytes() {
                Ok(code) if code & 0xFFFF_FF00 == 0x0000_0100 => return Ok(code),
                Ok(code) => {
                    // The next start code cannot begin before the first zero byte.
                    let skip = if code & 0x00FF_0000 != 0 && code & 0x0000_FF00 != 0 {
                        if code & 0xFF != 0 { 4 } else { 3 }
                    } else {
                        1
                    };
                    let bytes = &self.bank[self.cur..self.cur + skip];
                    out.save_bytes(bytes);
                    self.cur += skip;
                }
                Err(Interrupt::Closed) => {
                    let tail = self.take_buffered().to_vec();
                    out.save_bytes(&tail);
                    return Err(Interrupt::Closed);
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Like [`save_to_next_start_code`](Self::save_to_next_start_code) but discards the bytes.
    pub fn skip_to_next_start_code(&mut self) -> Parse<u32> {
        loop {
            match self.test_4_bytes() {
                Ok(code) if code & 0xFFFF_FF00 == 0x0000_0100 => return Ok(code),
                Ok(_) => self.cur += 1,
                Err(Interrupt::Closed) => {
                    self.take_buffered();
                    return Err(Interrupt::Closed);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// MSB-first bit reader over a byte slice, used for header fields.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    pub fn bits_remaining(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.bit_pos)
    }

    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    /// Read `n <= 32` bits.
    pub fn read_bits(&mut self, n: u32) -> Option<u32> {
        debug_assert!(n <= 32);
        if n as usize > self.bits_remaining() {
            return None;
        }
        let mut v: u32 = 0;
        for _ in 0..n {
            let byte = self.data[self.bit_pos / 8];
            let bit = (byte >> (7 - (self.bit_pos % 8))) & 1;
            v = (v << 1) | u32::from(bit);
            self.bit_pos += 1;
        }
        Some(v)
    }

    pub fn read_bit(&mut self) -> Option<bool> {
        self.read_bits(1).map(|b| b == 1)
    }

    pub fn skip_bits(&mut self, n: usize) -> Option<()> {
        if n > self.bits_remaining() {
            return None;
        }
        self.bit_pos += n;
        Some(())
    }

    /// Unsigned Exp-Golomb code (H.264 §9.1).
    pub fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Some((1u32 << leading_zeros) - 1 + suffix)
    }
}

/// MSB-first bit writer for building synthetic headers in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    bits: usize,
}

#[cfg(test)]
impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, n: u32, value: u32) -> &mut Self {
        for i in (0..n).rev() {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if (value >> i) & 1 == 1 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
        }
        self
    }

    /// MPEG-4 `next_start_code()` stuffing: a zero bit, then ones to the byte boundary.
    pub fn stuff(&mut self) -> &mut Self {
        self.put(1, 0);
        while self.bits % 8 != 0 {
            self.put(1, 1);
        }
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
