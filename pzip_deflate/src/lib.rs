//! Streaming DEFLATE (RFC 1951) encoder.
//!
//! The encoder works in 64 KiB windows. Each window is run through an LZ77
//! match finder that fills a token buffer, then one of three block shapes is
//! emitted: stored, huffman-only (no distance codes), or a token block.
//! Output reaches the sink only in large slabs (>= 256 KiB) or on `finish`,
//! so many encoders can share one serialized file writer cheaply.

use std::io::{self, Write};

mod huffman;
mod matchfind;


use huffman::HuffmanBitWriter;
use matchfind::MatchFinder;

pub(crate) const MAX_STORE_BLOCK_SIZE: usize = 65535;
pub(crate) const BASE_MATCH_LENGTH: u32 = 3;
pub(crate) const MAX_MATCH_LENGTH: usize = 258;
pub(crate) const MAX_MATCH_OFFSET: i32 = 1 << 15;

pub(crate) const END_BLOCK_MARKER: usize = 256;
pub(crate) const LENGTH_CODES_START: usize = 257;
pub(crate) const LITERAL_COUNT: usize = 286;
pub(crate) const OFFSET_CODE_COUNT: usize = 30;

pub(crate) const LENGTH_SHIFT: u32 = 22;
pub(crate) const OFFSET_MASK: u32 = (1 << LENGTH_SHIFT) - 1;
pub(crate) const MATCH_TYPE: u32 = 1 << 30;

/// Output is handed to the sink only once this many bytes have accumulated.
const OUTPUT_FLUSH_THRESHOLD: usize = 256 * 1024;

/// Length code for a match length minus 3; values are 1-based, the bit
/// writer subtracts one before indexing the length-symbol alphabet.
#[rustfmt::skip]
pub(crate) const LENGTH_CODES: [u8; 256] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 9, 10, 10, 11, 11, 12, 12,
    13, 13, 13, 13, 14, 14, 14, 14, 15, 15, 15, 15, 16, 16, 16, 16,
    17, 17, 17, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 18, 18,
    19, 19, 19, 19, 19, 19, 19, 19, 20, 20, 20, 20, 20, 20, 20, 20,
    21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21,
    22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22, 22,
    23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23,
    24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24,
    25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25,
    25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25,
    26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26,
    26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26,
    27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27,
    27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27,
    28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 29,
];

#[rustfmt::skip]
pub(crate) const OFFSET_CODES: [u32; 256] = [
    0, 1, 2, 3, 4, 4, 5, 5, 6, 6, 6, 6, 7, 7, 7, 7,
    8, 8, 8, 8, 8, 8, 8, 8, 9, 9, 9, 9, 9, 9, 9, 9,
    10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10,
    11, 11, 11, 11, 11, 11, 11, 11, 11, 11, 11, 11, 11, 11, 11, 11,
    12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
    13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13,
    13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13, 13,
    14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14,
    14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14,
    14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14,
    14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14, 14,
    15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15,
    15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15,
    15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15,
    15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15,
];

/// Offset codes for raw offsets >= 256, indexed by `(offset >> 7) & 0xFF`.
#[rustfmt::skip]
pub(crate) const OFFSET_CODES_14: [u32; 256] = [
    14, 15, 16, 17, 18, 18, 19, 19, 20, 20, 20, 20, 21, 21, 21, 21,
    22, 22, 22, 22, 22, 22, 22, 22, 23, 23, 23, 23, 23, 23, 23, 23,
    24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24, 24,
    25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25, 25,
    26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26,
    26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26, 26,
    27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27,
    27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27, 27,
    28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29,
    29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29,
    29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29,
    29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29, 29,
];

#[inline]
pub(crate) fn offset_code(off: u32) -> u32 {
    if off < 256 {
        OFFSET_CODES[off as usize]
    } else {
        OFFSET_CODES_14[((off >> 7) & 0xFF) as usize]
    }
}

/// Compression level 0-9. Levels 1-3 use the single-hash match finder,
/// levels 4 and up the dual-hash one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub fn new(level: u32) -> Self {
        Self(level.clamp(0, 9))
    }

    pub fn best_speed() -> Self {
        Self(1)
    }

    pub fn level(self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::best_speed()
    }
}

/// Token buffer for one block: literals are the raw byte value, matches pack
/// `MATCH_TYPE | (length - 3) << 22 | offset_code << 16 | raw_offset`.
pub(crate) struct Tokens {
    pub(crate) tokens: Box<[u32]>,
    pub(crate) n: usize,
    pub(crate) lit_hist: [u16; 256],
    pub(crate) extra_hist: [u16; 32],
    pub(crate) off_hist: [u16; 32],
}

impl Tokens {
    pub(crate) fn new() -> Self {
        Self {
            tokens: vec![0u32; MAX_STORE_BLOCK_SIZE + 1].into_boxed_slice(),
            n: 0,
            lit_hist: [0; 256],
            extra_hist: [0; 32],
            off_hist: [0; 32],
        }
    }

    pub(crate) fn reset(&mut self) {
        self.n = 0;
        self.lit_hist = [0; 256];
        self.extra_hist = [0; 32];
        self.off_hist = [0; 32];
    }

    #[inline]
    pub(crate) fn add_literal(&mut self, lit: u8) {
        self.tokens[self.n] = lit as u32;
        self.lit_hist[lit as usize] += 1;
        self.n += 1;
    }

    /// Adds a match of any length, splitting into chunks of at most 258
    /// bytes. `xoffset` is the raw offset, i.e. distance minus one.
    #[inline]
    pub(crate) fn add_match_long(&mut self, xlength: i32, xoffset: u32) {
        let oc = offset_code(xoffset);
        let xoffset = xoffset | (oc << 16);
        let mut remaining = xlength;
        while remaining > 0 {
            let mut xl = remaining;
            if xl > 258 {
                // Leave at least 3 bytes for the next chunk.
                xl = if xl > 258 + 3 { 258 } else { 258 - 3 };
            }
            remaining -= xl;
            let xl = (xl - BASE_MATCH_LENGTH as i32) as u32;
            self.extra_hist[LENGTH_CODES[xl as usize] as usize] += 1;
            self.off_hist[(oc & 31) as usize] += 1;
            self.tokens[self.n] = MATCH_TYPE | (xl << LENGTH_SHIFT) | xoffset;
            self.n += 1;
        }
    }

    #[inline]
    pub(crate) fn add_eob(&mut self) {
        self.tokens[self.n] = END_BLOCK_MARKER as u32;
        self.n += 1;
    }
}

/// Streaming DEFLATE encoder over any byte sink.
///
/// Mirrors the shape of `flate2::write::DeflateEncoder`: write the input
/// through the `Write` impl, then call [`FlateWriter::finish`] to emit the
/// final block and recover the sink.
pub struct FlateWriter<W: Write> {
    sink: W,
    window: Vec<u8>,
    window_end: usize,
    finder: MatchFinder,
    tokens: Tokens,
    writer: HuffmanBitWriter,
}

impl<W: Write> FlateWriter<W> {
    pub fn new(sink: W, level: CompressionLevel) -> Self {
        let mut writer = HuffmanBitWriter::new();
        writer.set_log_new_table_penalty(match level.level() {
            0..=3 => 8,
            4..=6 => 7,
            _ => 6,
        });
        Self {
            sink,
            window: vec![0u8; MAX_STORE_BLOCK_SIZE],
            window_end: 0,
            finder: MatchFinder::new(level),
            tokens: Tokens::new(),
            writer,
        }
    }

    fn fill_window(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.window.len() - self.window_end);
        self.window[self.window_end..self.window_end + n].copy_from_slice(&data[..n]);
        self.window_end += n;
        n
    }

    /// Emits the current window as one block. Windows under 128 bytes skip
    /// the match finder: they are stored (<= 32 bytes) or huffman-only.
    fn emit_block(&mut self, eof: bool) -> io::Result<()> {
        let len = self.window_end;
        if len < 128 {
            if len == 0 {
                if eof {
                    self.writer.write_stored_header(0, true);
                }
            } else if len <= 32 {
                self.writer.write_stored_header(len, eof);
                self.writer.write_bytes(&self.window[..len]);
            } else {
                self.writer.write_block_huff(eof, &self.window[..len], eof);
            }
            self.tokens.reset();
            self.window_end = 0;
            self.finder.reset();
            return self.flush_output();
        }

        self.tokens.reset();
        self.finder.encode(&mut self.tokens, &self.window[..len]);

        if self.tokens.n == 0 {
            // No matches at all: store the block as is.
            self.writer.write_stored_header(len, eof);
            self.writer.write_bytes(&self.window[..len]);
        } else if self.tokens.n > len - (len >> 4) {
            // LZ removed less than 1/16th of the input.
            self.writer.write_block_huff(eof, &self.window[..len], eof);
        } else {
            self.writer
                .write_block_dynamic(&mut self.tokens, eof, &self.window[..len]);
        }

        self.tokens.reset();
        self.window_end = 0;
        self.flush_output()
    }

    fn flush_output(&mut self) -> io::Result<()> {
        if self.writer.output.len() >= OUTPUT_FLUSH_THRESHOLD {
            self.sink.write_all(&self.writer.output)?;
            self.writer.output.clear();
        }
        Ok(())
    }

    fn force_flush(&mut self) -> io::Result<()> {
        if !self.writer.output.is_empty() {
            self.sink.write_all(&self.writer.output)?;
            self.writer.output.clear();
        }
        Ok(())
    }

    /// Emits the final block (stored empty block for empty input), flushes
    /// all pending bits and returns the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.emit_block(true)?;
        self.writer.flush_bits();
        self.force_flush()?;
        Ok(self.sink)
    }
}

impl<W: Write> Write for FlateWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            if self.window_end == self.window.len() {
                self.emit_block(false)?;
            }
            let n = self.fill_window(rest);
            rest = &rest[n..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Only completed output bytes are pushed; the bit accumulator and
        // the current window stay intact.
        self.force_flush()?;
        self.sink.flush()
    }
}

/// One-shot compression of a byte slice into a raw DEFLATE stream.
pub fn deflate_compress(input: &[u8], level: CompressionLevel) -> io::Result<Vec<u8>> {
    let mut writer = FlateWriter::new(Vec::new(), level);
    writer.write_all(input)?;
    writer.finish()
}
