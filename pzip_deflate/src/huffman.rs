//! Canonical Huffman coding and the DEFLATE bit writer.
//!
//! The bit writer accumulates into a u64 and spills 48 bits at a time into
//! a small staging array, which in turn is appended to the output vector
//! once it passes 246 bytes. Huffman-only blocks may share one dynamic
//! header across consecutive blocks; `last_header` tracks the open block.

use std::sync::OnceLock;

use crate::{
    Tokens, END_BLOCK_MARKER, LENGTH_CODES, LENGTH_CODES_START, LENGTH_SHIFT, LITERAL_COUNT,
    MAX_STORE_BLOCK_SIZE, OFFSET_CODE_COUNT, OFFSET_MASK,
};

const BUFFER_FLUSH_SIZE: usize = 246;
const STAGING_SIZE: usize = 256 + 8;

#[rustfmt::skip]
const LENGTH_EXTRA_BITS: [u8; 32] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2,
    3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0, 0, 0, 0,
];

#[rustfmt::skip]
const LENGTH_BASE: [u8; 32] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28,
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 255, 0, 0, 0,
];

#[rustfmt::skip]
const OFFSET_EXTRA_BITS: [u8; 32] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6,
    7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13, 14, 14,
];

#[rustfmt::skip]
const OFFSET_BASE: [u32; 32] = [
    0x000000, 0x000001, 0x000002, 0x000003, 0x000004,
    0x000006, 0x000008, 0x00000c, 0x000010, 0x000018,
    0x000020, 0x000030, 0x000040, 0x000060, 0x000080,
    0x0000c0, 0x000100, 0x000180, 0x000200, 0x000300,
    0x000400, 0x000600, 0x000800, 0x000c00, 0x001000,
    0x001800, 0x002000, 0x003000, 0x004000, 0x006000,
    0x008000, 0x00c000,
];

// Extra-bit count in the low byte, raw-offset base in the rest.
const OFFSET_COMBINED: [u32; 32] = build_offset_combined();

const fn build_offset_combined() -> [u32; 32] {
    let mut out = [0u32; 32];
    let mut i = 0;
    while i < 32 {
        if OFFSET_EXTRA_BITS[i] != 0 && OFFSET_BASE[i] <= 0x6000 {
            out[i] = OFFSET_EXTRA_BITS[i] as u32 | (OFFSET_BASE[i] << 8);
        }
        i += 1;
    }
    out
}

/// RFC 1951 order in which code-length code lengths are transmitted.
const CODEGEN_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

pub(crate) fn reverse_bits(mut number: u16, bit_len: u8) -> u16 {
    let mut result = 0u16;
    for _ in 0..bit_len {
        result = (result << 1) | (number & 1);
        number >>= 1;
    }
    result
}

/// A Huffman code: bit-reversed code in the high bits, length in the low 8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Hcode(u32);

impl Hcode {
    fn new(code: u16, len: u8) -> Self {
        Self(len as u32 | ((code as u32) << 8))
    }

    fn set(&mut self, code: u16, len: u8) {
        self.0 = len as u32 | ((code as u32) << 8);
    }

    #[inline]
    pub(crate) fn len(self) -> u32 {
        self.0 & 0xFF
    }

    #[inline]
    fn code64(self) -> u64 {
        (self.0 >> 8) as u64
    }
}

#[derive(Clone, Copy)]
struct LiteralNode {
    literal: u16,
    freq: u16,
}

pub(crate) struct HuffmanEncoder {
    pub(crate) codes: Vec<Hcode>,
    bit_count: [i32; 17],
}

impl HuffmanEncoder {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            codes: vec![Hcode::default(); size.next_power_of_two()],
            bit_count: [0; 17],
        }
    }

    /// Builds canonical codes for all symbols with non-zero frequency,
    /// keeping every code within `max_bits`.
    pub(crate) fn generate(&mut self, freq: &[u16], max_bits: i32) {
        let mut list = Vec::with_capacity(freq.len() + 1);
        for (i, &f) in freq.iter().enumerate() {
            if f != 0 {
                list.push(LiteralNode {
                    literal: i as u16,
                    freq: f,
                });
            } else {
                self.codes[i] = Hcode::default();
            }
        }

        if list.len() <= 2 {
            for (i, node) in list.iter().enumerate() {
                self.codes[node.literal as usize].set(i as u16, 1);
            }
            return;
        }

        list.sort_by_key(|node| node.freq);
        self.bit_counts(&list, max_bits);
        self.assign_encoding_and_size(&list);
    }

    /// Budgeted bit-length assignment: walk from most to least frequent,
    /// giving each symbol the shortest length the remaining budget allows.
    fn bit_counts(&mut self, list: &[LiteralNode], mut max_bits: i32) {
        let n = list.len() as i32;
        if max_bits > n - 1 {
            max_bits = n - 1;
        }

        self.bit_count = [0; 17];
        let mut bits_remaining: i32 = 1 << max_bits;

        for _ in 0..n {
            let mut bits = 1;
            let mut needed = 1;
            while bits < max_bits && needed <= bits_remaining / 2 {
                bits += 1;
                needed <<= 1;
            }
            self.bit_count[bits as usize] += 1;
            bits_remaining -= 1 << (max_bits - bits);
        }
    }

    fn assign_encoding_and_size(&mut self, list: &[LiteralNode]) {
        let mut code: u16 = 0;
        let mut list_idx = list.len() as i32 - 1;

        for bits in 1..=15u8 {
            if list_idx < 0 {
                break;
            }
            code <<= 1;
            let cnt = self.bit_count[bits as usize];

            let mut symbols = Vec::with_capacity(cnt as usize);
            for _ in 0..cnt {
                if list_idx < 0 {
                    break;
                }
                symbols.push(list[list_idx as usize].literal);
                list_idx -= 1;
            }
            symbols.sort_unstable();

            for sym in symbols {
                self.codes[sym as usize].set(reverse_bits(code, bits), bits);
                code += 1;
            }
        }
    }

    /// Bits this encoding spends on the given frequencies.
    pub(crate) fn bit_length(&self, freq: &[u16]) -> i32 {
        let mut total = 0i32;
        for (i, &f) in freq.iter().enumerate() {
            if i >= self.codes.len() {
                break;
            }
            if f != 0 {
                total += f as i32 * self.codes[i].len() as i32;
            }
        }
        total
    }

    /// Like `bit_length` but refuses reuse when a needed symbol has no
    /// code in this table.
    fn bit_length_reuse(&self, freq: &[u16]) -> i32 {
        let mut total = 0i32;
        for (i, &f) in freq.iter().enumerate() {
            if i >= self.codes.len() {
                break;
            }
            if f != 0 {
                let len = self.codes[i].len();
                if len == 0 {
                    return i32::MAX;
                }
                total += f as i32 * len as i32;
            }
        }
        total
    }
}

pub(crate) fn fixed_literal_encoding() -> &'static HuffmanEncoder {
    static FIXED: OnceLock<HuffmanEncoder> = OnceLock::new();
    FIXED.get_or_init(|| {
        let mut h = HuffmanEncoder::new(LITERAL_COUNT);
        for ch in 0..LITERAL_COUNT {
            let (bits, size) = match ch {
                0..=143 => (ch + 48, 8u8),
                144..=255 => (ch + 400 - 144, 9),
                256..=279 => (ch - 256, 7),
                _ => (ch + 192 - 280, 8),
            };
            h.codes[ch] = Hcode::new(reverse_bits(bits as u16, size), size);
        }
        h
    })
}

pub(crate) fn fixed_offset_encoding() -> &'static HuffmanEncoder {
    static FIXED: OnceLock<HuffmanEncoder> = OnceLock::new();
    FIXED.get_or_init(|| {
        let mut h = HuffmanEncoder::new(OFFSET_CODE_COUNT);
        for ch in 0..OFFSET_CODE_COUNT {
            h.codes[ch] = Hcode::new(reverse_bits(ch as u16, 5), 5);
        }
        h
    })
}

/// Distance table for huffman-only blocks: a single one-bit code, the only
/// shape strict inflaters accept for an incomplete distance alphabet.
fn huff_only_offset_encoding() -> &'static HuffmanEncoder {
    static HUFF: OnceLock<HuffmanEncoder> = OnceLock::new();
    HUFF.get_or_init(|| {
        let mut h = HuffmanEncoder::new(OFFSET_CODE_COUNT);
        let mut freq = [0u16; OFFSET_CODE_COUNT];
        freq[0] = 1;
        h.generate(&freq, 15);
        h
    })
}

pub(crate) struct HuffmanBitWriter {
    pub(crate) output: Vec<u8>,
    bits: u64,
    nbits: u32,
    nbytes: usize,
    bytes: [u8; STAGING_SIZE],
    // Bits spent on the currently open huffman-only header, 0 if closed.
    last_header: i32,
    last_huffman: bool,
    log_new_table_penalty: u32,
    literal_freq: [u16; LENGTH_CODES_START + 32],
    offset_freq: [u16; 32],
    codegen_freq: [u16; 19],
    codegen: [u8; LITERAL_COUNT + OFFSET_CODE_COUNT + 1],
    literal_encoding: HuffmanEncoder,
    offset_encoding: HuffmanEncoder,
    tmp_lit_encoding: HuffmanEncoder,
    codegen_encoding: HuffmanEncoder,
}

impl HuffmanBitWriter {
    pub(crate) fn new() -> Self {
        Self {
            output: Vec::with_capacity(256 * 1024),
            bits: 0,
            nbits: 0,
            nbytes: 0,
            bytes: [0; STAGING_SIZE],
            last_header: 0,
            last_huffman: false,
            log_new_table_penalty: 7,
            literal_freq: [0; LENGTH_CODES_START + 32],
            offset_freq: [0; 32],
            codegen_freq: [0; 19],
            codegen: [0; LITERAL_COUNT + OFFSET_CODE_COUNT + 1],
            literal_encoding: HuffmanEncoder::new(LITERAL_COUNT),
            offset_encoding: HuffmanEncoder::new(OFFSET_CODE_COUNT),
            tmp_lit_encoding: HuffmanEncoder::new(LITERAL_COUNT),
            codegen_encoding: HuffmanEncoder::new(19),
        }
    }

    pub(crate) fn set_log_new_table_penalty(&mut self, penalty: u32) {
        self.log_new_table_penalty = penalty;
    }

    #[inline]
    fn write_out_bits(&mut self) {
        self.bytes[self.nbytes..self.nbytes + 8].copy_from_slice(&self.bits.to_le_bytes());
        self.bits >>= 48;
        self.nbits -= 48;
        self.nbytes += 6;

        if self.nbytes >= BUFFER_FLUSH_SIZE {
            self.output.extend_from_slice(&self.bytes[..self.nbytes]);
            self.nbytes = 0;
        }
    }

    #[inline]
    fn write_bits(&mut self, b: u32, nb: u32) {
        self.bits |= (b as u64) << (self.nbits & 63);
        self.nbits += nb;
        if self.nbits >= 48 {
            self.write_out_bits();
        }
    }

    #[inline]
    fn write_code(&mut self, c: Hcode) {
        self.bits |= c.code64() << (self.nbits & 63);
        self.nbits += c.len();
        if self.nbits >= 48 {
            self.write_out_bits();
        }
    }

    /// Flushes the accumulator down to the byte boundary and drains the
    /// staging array into the output.
    pub(crate) fn flush_bits(&mut self) {
        if self.last_header > 0 {
            let eob = self.literal_encoding.codes[END_BLOCK_MARKER];
            self.write_code(eob);
            self.last_header = 0;
        }

        let mut n = self.nbytes;
        while self.nbits != 0 {
            self.bytes[n] = self.bits as u8;
            n += 1;
            self.bits >>= 8;
            self.nbits = self.nbits.saturating_sub(8);
        }
        self.bits = 0;

        if n > 0 {
            self.output.extend_from_slice(&self.bytes[..n]);
        }
        self.nbytes = 0;
    }

    /// Appends raw bytes; callers must be byte-aligned (stored header).
    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        let mut n = self.nbytes;
        while self.nbits != 0 {
            self.bytes[n] = self.bits as u8;
            n += 1;
            self.bits >>= 8;
            self.nbits = self.nbits.saturating_sub(8);
        }
        if n != 0 {
            self.output.extend_from_slice(&self.bytes[..n]);
        }
        self.nbytes = 0;
        self.output.extend_from_slice(bytes);
    }

    pub(crate) fn write_stored_header(&mut self, length: usize, is_eof: bool) {
        if self.last_header > 0 {
            let eob = self.literal_encoding.codes[END_BLOCK_MARKER];
            self.write_code(eob);
            self.last_header = 0;
        }

        if length == 0 && is_eof {
            // A final empty fixed block costs one EOB, two bytes total.
            self.write_fixed_header(true);
            self.write_bits(0, 7);
            self.flush_bits();
            return;
        }

        self.write_bits(if is_eof { 1 } else { 0 }, 3);
        self.flush_bits();
        self.write_bits(length as u32, 16);
        self.write_bits(!(length as u32) & 0xFFFF, 16);
    }

    pub(crate) fn write_fixed_header(&mut self, is_eof: bool) {
        if self.last_header > 0 {
            let eob = self.literal_encoding.codes[END_BLOCK_MARKER];
            self.write_code(eob);
            self.last_header = 0;
        }
        self.write_bits(if is_eof { 3 } else { 2 }, 3);
    }

    fn index_tokens(&mut self, t: &Tokens, always_eob: bool) {
        self.literal_freq[..256].copy_from_slice(&t.lit_hist);
        self.literal_freq[256..256 + 32].copy_from_slice(&t.extra_hist);
        self.offset_freq = t.off_hist;
        if t.n != 0 && always_eob {
            self.literal_freq[END_BLOCK_MARKER] = 1;
        }
    }

    fn generate(&mut self) {
        self.literal_encoding
            .generate(&self.literal_freq[..LITERAL_COUNT], 15);
        self.offset_encoding
            .generate(&self.offset_freq[..OFFSET_CODE_COUNT], 15);
    }

    fn extra_bit_size(&self) -> i32 {
        let mut total = 0i32;
        for i in 0..LITERAL_COUNT - 257 {
            total += self.literal_freq[257 + i] as i32 * LENGTH_EXTRA_BITS[i & 31] as i32;
        }
        for i in 0..OFFSET_CODE_COUNT {
            total += self.offset_freq[i] as i32 * OFFSET_EXTRA_BITS[i & 31] as i32;
        }
        total
    }

    fn fixed_size(&self, extra_bits: i32) -> i32 {
        3 + fixed_literal_encoding().bit_length(&self.literal_freq[..LITERAL_COUNT])
            + fixed_offset_encoding().bit_length(&self.offset_freq[..OFFSET_CODE_COUNT])
            + extra_bits
    }

    fn stored_size(&self, len: usize) -> (bool, i32) {
        let storable = len <= MAX_STORE_BLOCK_SIZE;
        if storable {
            (true, (len as i32 + 5) * 8)
        } else {
            (false, 0)
        }
    }

    pub(crate) fn write_tokens(&mut self, tokens: &[u32], le_codes: &[Hcode], oe_codes: &[Hcode]) {
        if tokens.is_empty() {
            return;
        }

        let mut n = tokens.len();
        let defer_eob = tokens[n - 1] == END_BLOCK_MARKER as u32;
        if defer_eob {
            n -= 1;
        }

        for &t in &tokens[..n] {
            if t < 256 {
                self.write_code(le_codes[t as usize]);
                continue;
            }

            let length = (t >> LENGTH_SHIFT) & 0xFF;
            let length_code = (LENGTH_CODES[length as usize] - 1) as usize;

            self.write_code(le_codes[LENGTH_CODES_START + length_code]);

            if length_code >= 8 {
                let extra_bits = LENGTH_EXTRA_BITS[length_code] as u32;
                let extra = length as i32 - LENGTH_BASE[length_code] as i32;
                self.write_bits(extra as u32, extra_bits);
            }

            let offset = t & OFFSET_MASK;
            let off_code = ((offset >> 16) & 31) as usize;
            let raw = offset & 0xFFFF;

            self.write_code(oe_codes[off_code]);

            if off_code >= 4 {
                let comb = OFFSET_COMBINED[off_code];
                self.write_bits((raw.wrapping_sub(comb >> 8)) & 0xFFFF, comb & 0xFF);
            }
        }

        if defer_eob {
            self.write_code(le_codes[END_BLOCK_MARKER]);
        }
    }

    /// Token block. The dynamic tables are computed for the size estimate
    /// but the block itself is written with the fixed tables; a stored
    /// block wins when it is no larger.
    pub(crate) fn write_block_dynamic(&mut self, tokens: &mut Tokens, eof: bool, input: &[u8]) {
        tokens.add_eob();

        if self.last_header > 0 {
            let eob = self.literal_encoding.codes[END_BLOCK_MARKER];
            self.write_code(eob);
            self.last_header = 0;
        }

        self.index_tokens(tokens, true);

        let (storable, ssize) = self.stored_size(input.len());
        let extra_bits = if storable { self.extra_bit_size() } else { 0 };

        self.generate();
        let size = self.fixed_size(extra_bits);

        if storable && ssize <= size {
            self.write_stored_header(input.len(), eof);
            self.write_bytes(input);
            return;
        }

        self.write_fixed_header(eof);
        self.write_tokens(
            &tokens.tokens[..tokens.n],
            &fixed_literal_encoding().codes,
            &fixed_offset_encoding().codes,
        );
    }

    fn histogram(&mut self, input: &[u8]) {
        for &b in input {
            self.literal_freq[b as usize] += 1;
        }
    }

    fn num_codegens(&self) -> usize {
        let mut n = 19;
        while n > 4 && self.codegen_freq[CODEGEN_ORDER[n - 1]] == 0 {
            n -= 1;
        }
        n
    }

    fn header_size(&self) -> (i32, usize) {
        let num_codegens = self.num_codegens();
        let size = 3
            + 5
            + 5
            + 4
            + (3 * num_codegens as i32)
            + self.codegen_encoding.bit_length(&self.codegen_freq)
            + self.codegen_freq[16] as i32 * 2
            + self.codegen_freq[17] as i32 * 3
            + self.codegen_freq[18] as i32 * 7;
        (size, num_codegens)
    }

    /// Records the code length of every transmitted symbol; lengths are
    /// emitted individually, without run-length codes.
    fn generate_codegen(&mut self, num_literals: usize, num_offsets: usize) {
        self.codegen_freq = [0; 19];

        let mut n = 0;
        for i in 0..num_literals {
            let bits = self.literal_encoding.codes[i].len() as u8;
            self.codegen[n] = bits;
            n += 1;
            self.codegen_freq[bits as usize] += 1;
        }
        for i in 0..num_offsets {
            let bits = huff_only_offset_encoding().codes[i].len() as u8;
            self.codegen[n] = bits;
            n += 1;
            self.codegen_freq[bits as usize] += 1;
        }
    }

    fn write_dynamic_header(
        &mut self,
        num_literals: usize,
        num_offsets: usize,
        num_codegens: usize,
        is_eof: bool,
    ) {
        self.write_bits(if is_eof { 5 } else { 4 }, 3);

        self.write_bits((num_literals - 257) as u32, 5);
        self.write_bits((num_offsets - 1) as u32, 5);
        self.write_bits((num_codegens - 4) as u32, 4);

        for i in 0..num_codegens {
            let len = self.codegen_encoding.codes[CODEGEN_ORDER[i]].len();
            self.write_bits(len, 3);
        }

        for i in 0..num_literals + num_offsets {
            let code = self.codegen_encoding.codes[self.codegen[i] as usize];
            self.write_code(code);
        }
    }

    /// Huffman-only block: literal codes, no distance alphabet beyond the
    /// single mandatory entry. When `sync` and `eof` are both false the
    /// header stays open and the next block may reuse the table.
    pub(crate) fn write_block_huff(&mut self, eof: bool, input: &[u8], sync: bool) {
        self.literal_freq = [0; LENGTH_CODES_START + 32];
        if !self.last_huffman {
            self.offset_freq = [0; 32];
        }

        const NUM_LITERALS: usize = END_BLOCK_MARKER + 1;
        const NUM_OFFSETS: usize = 1;
        const GUESS_HEADER_SIZE_BITS: i32 = 70 * 8;

        self.histogram(input);

        let (storable, ssize) = self.stored_size(input.len());

        // Near-uniform byte distribution will not compress; store it.
        if storable && input.len() > 1024 {
            let mut abs_val = 0.0f64;
            let avg = input.len() as f64 / 256.0;
            let max_val = (input.len() * 2) as f64;

            for i in 0..256 {
                let diff = self.literal_freq[i] as f64 - avg;
                abs_val += diff * diff;
                if abs_val > max_val {
                    break;
                }
            }

            if abs_val < max_val {
                self.write_stored_header(input.len(), eof);
                self.write_bytes(input);
                return;
            }
        }

        self.literal_freq[END_BLOCK_MARKER] = 1;
        self.tmp_lit_encoding
            .generate(&self.literal_freq[..NUM_LITERALS], 15);
        let mut est_bits = self
            .tmp_lit_encoding
            .bit_length(&self.literal_freq[..NUM_LITERALS]);

        est_bits += self.last_header;
        if self.last_header == 0 {
            est_bits += GUESS_HEADER_SIZE_BITS;
        }
        est_bits += est_bits >> self.log_new_table_penalty;

        if storable && ssize <= est_bits {
            self.write_stored_header(input.len(), eof);
            self.write_bytes(input);
            return;
        }

        if self.last_header > 0 {
            // Reuse the open table only when it can code every symbol of
            // this block and a fresh table would not be cheaper.
            let reuse_size = self
                .literal_encoding
                .bit_length_reuse(&self.literal_freq[..NUM_LITERALS]);

            if est_bits < reuse_size {
                let eob = self.literal_encoding.codes[END_BLOCK_MARKER];
                self.write_code(eob);
                self.last_header = 0;
            }
        }

        if self.last_header == 0 {
            std::mem::swap(&mut self.literal_encoding, &mut self.tmp_lit_encoding);

            self.generate_codegen(NUM_LITERALS, NUM_OFFSETS);
            self.codegen_encoding.generate(&self.codegen_freq, 7);
            let num_codegens = self.num_codegens();

            self.write_dynamic_header(NUM_LITERALS, NUM_OFFSETS, num_codegens, eof);
            self.last_huffman = true;
            self.last_header = self.header_size().0;
        }

        for &b in input {
            let code = self.literal_encoding.codes[b as usize];
            self.write_code(code);
        }

        if eof || sync {
            let eob = self.literal_encoding.codes[END_BLOCK_MARKER];
            self.write_code(eob);
            self.last_header = 0;
            self.last_huffman = false;
        }
    }
}
