//! LZ77 match finders.
//!
//! Two interchangeable strategies behind a closed enum: a single-hash
//! finder for levels 1-3 (fastest) and a dual-hash finder for levels 4+
//! that probes a long-match table first. Both share a sliding history
//! window with a rebasable `cur` origin so table entries stay valid across
//! window compactions.

use crate::{CompressionLevel, Tokens, MAX_MATCH_LENGTH, MAX_MATCH_OFFSET, MAX_STORE_BLOCK_SIZE};

const TABLE_BITS: u32 = 15;
const TABLE_SIZE: usize = 1 << TABLE_BITS;
const TABLE_SHIFT: u32 = 32 - TABLE_BITS;

const ALLOC_HISTORY: usize = MAX_STORE_BLOCK_SIZE * 5;

const PRIME_4_BYTES: u32 = 2_654_435_761;
const PRIME_5_BYTES: u64 = 889_523_592_379;
const PRIME_7_BYTES: u64 = 58_295_818_150_454_627;

const INPUT_MARGIN: i32 = 11;
const MIN_NON_LITERAL_BLOCK_SIZE: usize = 13;

// Rebase the table origin well before i32 positions can overflow.
const BUFFER_RESET: i32 =
    i32::MAX - ALLOC_HISTORY as i32 - MAX_STORE_BLOCK_SIZE as i32 - 1;

#[inline]
fn load32(b: &[u8], i: i32) -> u32 {
    let i = i as usize;
    let mut v = [0u8; 4];
    v.copy_from_slice(&b[i..i + 4]);
    u32::from_le_bytes(v)
}

#[inline]
fn load64(b: &[u8], i: i32) -> u64 {
    let i = i as usize;
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[i..i + 8]);
    u64::from_le_bytes(v)
}

#[inline]
fn hash4(u: u32) -> usize {
    (u.wrapping_mul(PRIME_4_BYTES) >> TABLE_SHIFT) as usize
}

#[inline]
fn hash5(u: u64) -> usize {
    (((u << 24).wrapping_mul(PRIME_5_BYTES)) >> (64 - TABLE_BITS)) as usize
}

#[inline]
fn hash7(u: u64) -> usize {
    (((u << 8).wrapping_mul(PRIME_7_BYTES)) >> (64 - TABLE_BITS)) as usize
}

/// Forward match extension with 8-byte XOR compares.
#[inline]
fn match_len(a: &[u8], b: &[u8], max_len: usize) -> i32 {
    let mut n = 0usize;
    while n + 8 <= max_len {
        let diff = load64(a, n as i32) ^ load64(b, n as i32);
        if diff != 0 {
            return (n + (diff.trailing_zeros() / 8) as usize) as i32;
        }
        n += 8;
    }
    while n < max_len && a[n] == b[n] {
        n += 1;
    }
    n as i32
}

/// Sliding input history. Positions handed to the hash tables are
/// `index + cur`, which survives compaction by rebasing `cur`.
struct History {
    hist: Vec<u8>,
    cur: i32,
}

impl History {
    fn new() -> Self {
        Self {
            hist: Vec::with_capacity(ALLOC_HISTORY),
            cur: MAX_STORE_BLOCK_SIZE as i32,
        }
    }

    fn add_block(&mut self, src: &[u8]) -> i32 {
        if self.hist.len() + src.len() > self.hist.capacity() {
            if self.hist.capacity() == 0 {
                self.hist.reserve(ALLOC_HISTORY);
            } else {
                // Keep the last 32 KiB so existing offsets stay reachable.
                let offset = self.hist.len() as i32 - MAX_MATCH_OFFSET;
                if offset > 0 {
                    self.hist.copy_within(offset as usize.., 0);
                    self.hist.truncate(MAX_MATCH_OFFSET as usize);
                    self.cur += offset;
                }
            }
        }
        let s = self.hist.len() as i32;
        self.hist.extend_from_slice(src);
        s
    }

    fn reset(&mut self) {
        if self.hist.capacity() < ALLOC_HISTORY {
            self.hist.reserve(ALLOC_HISTORY);
        }
        self.cur += MAX_MATCH_OFFSET + self.hist.len() as i32;
        self.hist.clear();
    }
}

fn rebase_table(table: &mut [i32], cur: i32, hist_len: i32) {
    let min_off = cur + hist_len - MAX_MATCH_OFFSET;
    for e in table.iter_mut() {
        *e = if *e <= min_off {
            0
        } else {
            *e - cur + MAX_MATCH_OFFSET
        };
    }
}

/// Level 1-3 finder: one 2^15-entry table keyed by a 5-byte hash.
pub(crate) struct FastEncL1 {
    gen: History,
    table: Box<[i32]>,
}

impl FastEncL1 {
    fn new() -> Self {
        Self {
            gen: History::new(),
            table: vec![0i32; TABLE_SIZE].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.gen.reset();
        self.table.fill(0);
    }

    fn encode(&mut self, dst: &mut Tokens, src: &[u8]) {
        const SKIP_LOG: i32 = 5;
        const DO_EVERY: i32 = 2;

        if self.gen.cur >= BUFFER_RESET {
            if self.gen.hist.is_empty() {
                self.table.fill(0);
                self.gen.cur = MAX_MATCH_OFFSET;
            } else {
                rebase_table(&mut self.table, self.gen.cur, self.gen.hist.len() as i32);
                self.gen.cur = MAX_MATCH_OFFSET;
            }
        }

        let start = self.gen.add_block(src);

        if src.len() < MIN_NON_LITERAL_BLOCK_SIZE {
            dst.n = src.len();
            return;
        }

        let cur = self.gen.cur;
        let data: &[u8] = &self.gen.hist;
        let hist_len = data.len() as i32;

        let mut s = start;
        let mut next_emit = s;
        let s_limit = hist_len - INPUT_MARGIN;

        let mut cv = load64(data, s);

        'outer: loop {
            let mut next_s;
            let mut t;

            // Probe until a 4-byte candidate within range is found.
            loop {
                let next_hash = hash5(cv);
                let candidate = self.table[next_hash];
                next_s = s + DO_EVERY + (s - next_emit) / (1 << SKIP_LOG);

                if next_s > s_limit {
                    break 'outer;
                }

                let now = load64(data, next_s);
                self.table[next_hash] = s + cur;
                let next_hash2 = hash5(now);
                t = candidate - cur;

                if s - t < MAX_MATCH_OFFSET && cv as u32 == load32(data, t) {
                    self.table[next_hash2] = next_s + cur;
                    break;
                }

                // One more probe at the skipped-to position.
                cv = now;
                s = next_s;
                next_s += 1;
                let candidate = self.table[next_hash2];
                let now = now >> 8;
                self.table[next_hash2] = s + cur;

                t = candidate - cur;
                if s - t < MAX_MATCH_OFFSET && cv as u32 == load32(data, t) {
                    self.table[hash5(now)] = next_s + cur;
                    break;
                }
                cv = now;
                s = next_s;
            }

            // Extend, emit, and keep going while the next position also
            // continues a match.
            loop {
                let max_len = ((hist_len - s - 4) as usize).min(MAX_MATCH_LENGTH - 4);
                let mut l = match_len(
                    &data[(s + 4) as usize..],
                    &data[(t + 4) as usize..],
                    max_len,
                ) + 4;

                while t > 0 && s > next_emit && data[(t - 1) as usize] == data[(s - 1) as usize] {
                    s -= 1;
                    t -= 1;
                    l += 1;
                }

                for i in next_emit..s {
                    dst.add_literal(data[i as usize]);
                }

                dst.add_match_long(l, (s - t - 1) as u32);
                s += l;
                next_emit = s;

                if next_s >= s {
                    s = next_s + 1;
                }

                if s >= s_limit {
                    if s + 8 < hist_len {
                        let cv2 = load64(data, s);
                        self.table[hash5(cv2)] = s + cur;
                    }
                    break 'outer;
                }

                let x = load64(data, s - 2);
                let o = cur + s - 2;
                self.table[hash5(x)] = o;
                let x = x >> 16;
                let candidate = self.table[hash5(x)];
                self.table[hash5(x)] = o + 2;

                t = candidate - cur;
                if s - t > MAX_MATCH_OFFSET || x as u32 != load32(data, t) {
                    cv = x >> 8;
                    s += 1;
                    break;
                }
            }
        }

        if next_emit < hist_len {
            // With no tokens at all the caller stores the block raw.
            if dst.n == 0 {
                return;
            }
            for i in next_emit..hist_len {
                dst.add_literal(data[i as usize]);
            }
        }
    }
}

/// Level 4+ finder: a short table keyed by hash4 and a long table keyed by
/// hash7; long candidates win, and a short hit is double-checked against a
/// long candidate one byte ahead.
pub(crate) struct FastEncL4 {
    gen: History,
    table: Box<[i32]>,
    b_table: Box<[i32]>,
}

impl FastEncL4 {
    fn new() -> Self {
        Self {
            gen: History::new(),
            table: vec![0i32; TABLE_SIZE].into_boxed_slice(),
            b_table: vec![0i32; TABLE_SIZE].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.gen.reset();
        self.table.fill(0);
        self.b_table.fill(0);
    }

    fn encode(&mut self, dst: &mut Tokens, src: &[u8]) {
        const SKIP_LOG: i32 = 6;
        const DO_EVERY: i32 = 1;

        if self.gen.cur >= BUFFER_RESET {
            if self.gen.hist.is_empty() {
                self.table.fill(0);
                self.b_table.fill(0);
                self.gen.cur = MAX_MATCH_OFFSET;
            } else {
                rebase_table(&mut self.table, self.gen.cur, self.gen.hist.len() as i32);
                rebase_table(&mut self.b_table, self.gen.cur, self.gen.hist.len() as i32);
                self.gen.cur = MAX_MATCH_OFFSET;
            }
        }

        let start = self.gen.add_block(src);

        if src.len() < MIN_NON_LITERAL_BLOCK_SIZE {
            dst.n = src.len();
            return;
        }

        let cur = self.gen.cur;
        let data: &[u8] = &self.gen.hist;
        let hist_len = data.len() as i32;

        let mut s = start;
        let mut next_emit = s;
        let s_limit = hist_len - INPUT_MARGIN;

        let mut cv = load64(data, s);

        'outer: loop {
            let mut next_s = s;
            let mut t;

            loop {
                let next_hash_s = hash4(cv as u32);
                let next_hash_l = hash7(cv);

                s = next_s;
                next_s = s + DO_EVERY + (s - next_emit) / (1 << SKIP_LOG);
                if next_s > s_limit {
                    break 'outer;
                }

                let s_candidate = self.table[next_hash_s];
                let l_candidate = self.b_table[next_hash_l];
                let next = load64(data, next_s);
                let entry = s + cur;
                self.table[next_hash_s] = entry;
                self.b_table[next_hash_l] = entry;

                t = l_candidate - cur;
                if s - t < MAX_MATCH_OFFSET && cv as u32 == load32(data, t) {
                    break;
                }

                t = s_candidate - cur;
                if s - t < MAX_MATCH_OFFSET && cv as u32 == load32(data, t) {
                    // A short match: prefer a long match starting one byte
                    // later when it runs further.
                    let l_cand2 = self.b_table[hash7(next)];
                    let l_off = l_cand2 - cur;
                    if next_s - l_off < MAX_MATCH_OFFSET && load32(data, l_off) == next as u32 {
                        let max1 = ((hist_len - s - 4) as usize).min(MAX_MATCH_LENGTH - 4);
                        let max2 = ((hist_len - next_s - 4) as usize).min(MAX_MATCH_LENGTH - 4);
                        let l1 = match_len(
                            &data[(s + 4) as usize..],
                            &data[(t + 4) as usize..],
                            max1,
                        );
                        let l2 = match_len(
                            &data[(next_s + 4) as usize..],
                            &data[(next_s - l_off + 4) as usize..],
                            max2,
                        );
                        if l2 > l1 {
                            s = next_s;
                            t = l_off;
                        }
                    }
                    break;
                }
                cv = next;
            }

            {
                let max_len = ((hist_len - s - 4) as usize).min(MAX_MATCH_LENGTH - 4);
                let mut l = match_len(
                    &data[(s + 4) as usize..],
                    &data[(t + 4) as usize..],
                    max_len,
                ) + 4;

                while t > 0 && s > next_emit && data[(t - 1) as usize] == data[(s - 1) as usize] {
                    s -= 1;
                    t -= 1;
                    l += 1;
                }

                for i in next_emit..s {
                    dst.add_literal(data[i as usize]);
                }

                dst.add_match_long(l, (s - t - 1) as u32);
                s += l;
                next_emit = s;

                if next_s >= s {
                    s = next_s + 1;
                }

                if s >= s_limit {
                    if s + 8 < hist_len {
                        let cv2 = load64(data, s);
                        self.table[hash4(cv2 as u32)] = s + cur;
                        self.b_table[hash7(cv2)] = s + cur;
                    }
                    break 'outer;
                }

                // Index every third position inside the skipped span.
                let mut i = next_s;
                if i < s - 1 {
                    loop {
                        let cv2 = load64(data, i);
                        let te = i + cur;
                        self.b_table[hash7(cv2)] = te;
                        self.b_table[hash7(cv2 >> 8)] = te + 1;
                        self.table[hash4((cv2 >> 8) as u32)] = te + 1;
                        i += 3;
                        if i >= s - 1 {
                            break;
                        }
                    }
                }

                let x = load64(data, s - 1);
                let o = cur + s - 1;
                self.table[hash4(x as u32)] = o;
                self.b_table[hash7(x)] = o;
                cv = x >> 8;
            }
        }

        if next_emit < hist_len {
            if dst.n == 0 {
                return;
            }
            for i in next_emit..hist_len {
                dst.add_literal(data[i as usize]);
            }
        }
    }
}

/// The two match-finder strategies are a closed set; a block-level dispatch
/// is all that is needed.
pub(crate) enum MatchFinder {
    L1(FastEncL1),
    L4(FastEncL4),
}

impl MatchFinder {
    pub(crate) fn new(level: CompressionLevel) -> Self {
        if level.level() <= 3 {
            Self::L1(FastEncL1::new())
        } else {
            Self::L4(FastEncL4::new())
        }
    }

    pub(crate) fn encode(&mut self, dst: &mut Tokens, src: &[u8]) {
        match self {
            Self::L1(enc) => enc.encode(dst, src),
            Self::L4(enc) => enc.encode(dst, src),
        }
    }

    pub(crate) fn reset(&mut self) {
        match self {
            Self::L1(enc) => enc.reset(),
            Self::L4(enc) => enc.reset(),
        }
    }
}
