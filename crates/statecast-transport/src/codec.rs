//! Bit-stream codec: a carry-less range coder and an MSB-first bit packer
//! behind one construction-time selected surface.
//!
//! The range coder is the Subbotin carry-less variant scaled to 64 bits:
//! a byte is emitted as soon as the top bytes of `low` and `low + range`
//! agree, and when the range underflows the emission threshold without
//! agreement it is truncated to the next alignment boundary instead of
//! letting a carry propagate into already-emitted bytes. Encoder and decoder
//! renormalize in lockstep, so the decoder consumes exactly the bytes the
//! encoder produced; reads past the end of input yield zero bytes and the
//! trailing integrity checks catch genuine truncation.

use bytes::{BufMut, BytesMut};

use crate::config::StreamFormat;

/// Upper bound on the cumulative frequency total of any coded distribution.
pub const MAX_PROBABILITY_TOTAL: u64 = 1 << 32;

/// Top bytes settled: emit. One byte below 2^64.
const TOP: u64 = 1 << 56;
/// Renormalization floor. Must stay at or above `MAX_PROBABILITY_TOTAL` so
/// `range / total` never rounds to zero.
const BOT: u64 = 1 << 40;

fn fold_crc(crc: u8, total: u64, low: u64, width: u64) -> u8 {
    crc.wrapping_mul(5).wrapping_add((total ^ low ^ width) as u8)
}

/// ─── Range encoder ──────────────────────────────────────────────────────

pub struct RangeEncoder {
    low: u64,
    range: u64,
    out: BytesMut,
    crc: u8,
}

impl RangeEncoder {
    pub fn new() -> Self {
        Self {
            low: 0,
            range: u64::MAX,
            out: BytesMut::with_capacity(256),
            crc: 0,
        }
    }

    /// Narrow the interval to the symbol occupying `[low, low + width)` out
    /// of `total`. Contract: `width != 0`, `low + width <= total`,
    /// `total <= MAX_PROBABILITY_TOTAL`. Violations are programming errors.
    pub fn encode(&mut self, total: u64, low: u64, width: u64) {
        debug_assert!(width != 0);
        debug_assert!(low + width <= total);
        debug_assert!(total <= MAX_PROBABILITY_TOTAL);
        let r = self.range / total;
        self.low = self.low.wrapping_add(r * low);
        if low + width < total {
            self.range = r * width;
        } else {
            // Top symbol absorbs the division remainder.
            self.range -= r * low;
        }
        self.normalize();
        self.crc = fold_crc(self.crc, total, low, width);
    }

    /// `encode` over a power-of-two total.
    pub fn encode_shift(&mut self, bits: u32, low: u64, width: u64) {
        self.encode(1u64 << bits, low, width);
    }

    /// Write `bits` raw bits of `value`.
    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits >= 1 && bits <= 32);
        debug_assert!(bits == 32 || u64::from(value) < (1u64 << bits));
        self.encode_shift(bits, u64::from(value), 1);
    }

    fn normalize(&mut self) {
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) < TOP {
                // Top byte settled.
            } else if self.range < BOT {
                // Underflow without agreement: truncate the range up to the
                // next alignment boundary so no carry can reach emitted bytes.
                self.range = self.low.wrapping_neg() & (BOT - 1);
            } else {
                break;
            }
            self.out.put_u8((self.low >> 56) as u8);
            self.low <<= 8;
            self.range <<= 8;
        }
    }

    /// Bytes emitted so far plus the worst-case tail. Used for packet
    /// budget accounting while a packet is still being assembled.
    pub fn approx_len(&self) -> usize {
        self.out.len() + 8
    }

    pub fn crc8(&self) -> u8 {
        self.crc
    }

    /// Drain the remaining state of `low` and return the finished stream.
    pub fn finish(mut self) -> BytesMut {
        for _ in 0..8 {
            self.out.put_u8((self.low >> 56) as u8);
            self.low <<= 8;
        }
        self.out
    }
}

impl Default for RangeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// ─── Range decoder ──────────────────────────────────────────────────────

pub struct RangeDecoder<'a> {
    input: &'a [u8],
    pos: usize,
    low: u64,
    range: u64,
    code: u64,
    /// `range / total` carried from `decode` to the mandatory `update`.
    r: u64,
    crc: u8,
}

impl<'a> RangeDecoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        let mut dec = Self {
            input,
            pos: 0,
            low: 0,
            range: u64::MAX,
            code: 0,
            r: 0,
            crc: 0,
        };
        for _ in 0..8 {
            dec.code = (dec.code << 8) | u64::from(dec.next_byte());
        }
        dec
    }

    fn next_byte(&mut self) -> u8 {
        // Past-end reads decode as zero; truncation is caught by the
        // end-of-stream integrity checks, not here.
        let b = self.input.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }

    /// Locate the coded value within `[0, total)`. Must be followed by
    /// exactly one `update` with the chosen symbol's interval.
    pub fn decode(&mut self, total: u64) -> u64 {
        debug_assert!(total >= 1 && total <= MAX_PROBABILITY_TOTAL);
        debug_assert!(self.r == 0, "decode called twice without update");
        self.r = self.range / total;
        let v = self.code.wrapping_sub(self.low) / self.r;
        v.min(total - 1)
    }

    pub fn update(&mut self, total: u64, low: u64, width: u64) {
        debug_assert!(self.r != 0, "update without a preceding decode");
        let r = self.r;
        self.r = 0;
        self.low = self.low.wrapping_add(r * low);
        if low + width < total {
            self.range = r * width;
        } else {
            self.range -= r * low;
        }
        self.normalize();
        self.crc = fold_crc(self.crc, total, low, width);
    }

    pub fn read_bits(&mut self, bits: u32) -> u32 {
        debug_assert!(bits >= 1 && bits <= 32);
        let total = 1u64 << bits;
        let v = self.decode(total);
        self.update(total, v, 1);
        v as u32
    }

    fn normalize(&mut self) {
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) < TOP {
            } else if self.range < BOT {
                self.range = self.low.wrapping_neg() & (BOT - 1);
            } else {
                break;
            }
            self.code = (self.code << 8) | u64::from(self.next_byte());
            self.low <<= 8;
            self.range <<= 8;
        }
    }

    pub fn crc8(&self) -> u8 {
        self.crc
    }
}

/// ─── Bit packer ─────────────────────────────────────────────────────────

/// MSB-first bit writer.
pub struct BitWriter {
    buf: BytesMut,
    cur: u8,
    nbits: u32,
    crc: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            cur: 0,
            nbits: 0,
            crc: 0,
        }
    }

    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits >= 1 && bits <= 32);
        debug_assert!(bits == 32 || u64::from(value) < (1u64 << bits));
        let mut left = bits;
        while left > 0 {
            let take = (8 - self.nbits).min(left);
            let chunk = ((value >> (left - take)) as u8) & ((1u16 << take) - 1) as u8;
            self.cur = ((u16::from(self.cur) << take) | u16::from(chunk)) as u8;
            self.nbits += take;
            left -= take;
            if self.nbits == 8 {
                self.buf.put_u8(self.cur);
                self.cur = 0;
                self.nbits = 0;
            }
        }
        self.crc = fold_crc(self.crc, 1u64 << (bits & 31), u64::from(value), 1);
    }

    pub fn approx_len(&self) -> usize {
        self.buf.len() + 1
    }

    pub fn crc8(&self) -> u8 {
        self.crc
    }

    pub fn finish(mut self) -> BytesMut {
        if self.nbits > 0 {
            self.buf.put_u8(self.cur << (8 - self.nbits));
        }
        self.buf
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// MSB-first bit reader with a sticky failure flag. Reading past the end
/// fails the stream; every later read returns zero.
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
    cur: u8,
    nbits: u32,
    failed: bool,
    crc: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            cur: 0,
            nbits: 0,
            failed: false,
            crc: 0,
        }
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn read_bits(&mut self, bits: u32) -> u32 {
        debug_assert!(bits >= 1 && bits <= 32);
        if self.failed {
            return 0;
        }
        let remaining = (self.buf.len() - self.pos) as u64 * 8 + u64::from(self.nbits);
        if u64::from(bits) > remaining {
            self.failed = true;
            return 0;
        }
        let mut value = 0u32;
        let mut left = bits;
        while left > 0 {
            if self.nbits == 0 {
                self.cur = self.buf[self.pos];
                self.pos += 1;
                self.nbits = 8;
            }
            let take = self.nbits.min(left);
            let chunk = (self.cur >> (self.nbits - take)) & ((1u16 << take) - 1) as u8;
            value = (value << take) | u32::from(chunk);
            self.nbits -= take;
            left -= take;
        }
        self.crc = fold_crc(self.crc, 1u64 << (bits & 31), u64::from(value), 1);
        value
    }

    pub fn crc8(&self) -> u8 {
        self.crc
    }
}

/// ─── Stream surfaces ────────────────────────────────────────────────────

/// Packet-assembly side of the codec. The variant is chosen once per
/// connection from `Config::format` and never mixed.
pub enum OutputStream {
    Arithmetic(RangeEncoder),
    BitPacked(BitWriter),
}

impl OutputStream {
    pub fn new(format: StreamFormat) -> Self {
        match format {
            StreamFormat::Arithmetic => Self::Arithmetic(RangeEncoder::new()),
            StreamFormat::BitPacked => Self::BitPacked(BitWriter::new()),
        }
    }

    pub fn write_bits(&mut self, value: u32, bits: u32) {
        match self {
            Self::Arithmetic(enc) => enc.write_bits(value, bits),
            Self::BitPacked(w) => w.write_bits(value, bits),
        }
    }

    pub fn approx_len(&self) -> usize {
        match self {
            Self::Arithmetic(enc) => enc.approx_len(),
            Self::BitPacked(w) => w.approx_len(),
        }
    }

    pub fn crc8(&self) -> u8 {
        match self {
            Self::Arithmetic(enc) => enc.crc8(),
            Self::BitPacked(w) => w.crc8(),
        }
    }

    pub fn finish(self) -> BytesMut {
        match self {
            Self::Arithmetic(enc) => enc.finish(),
            Self::BitPacked(w) => w.finish(),
        }
    }
}

/// Packet-decode side of the codec.
pub enum InputStream<'a> {
    Arithmetic(RangeDecoder<'a>),
    BitPacked(BitReader<'a>),
}

impl<'a> InputStream<'a> {
    pub fn new(format: StreamFormat, input: &'a [u8]) -> Self {
        match format {
            StreamFormat::Arithmetic => Self::Arithmetic(RangeDecoder::new(input)),
            StreamFormat::BitPacked => Self::BitPacked(BitReader::new(input)),
        }
    }

    pub fn read_bits(&mut self, bits: u32) -> u32 {
        match self {
            Self::Arithmetic(dec) => dec.read_bits(bits),
            Self::BitPacked(r) => r.read_bits(bits),
        }
    }

    /// Only the bit-packed flavor can fail structurally; the range decoder
    /// reads zeros past the end and relies on the trailing checks.
    pub fn failed(&self) -> bool {
        match self {
            Self::Arithmetic(_) => false,
            Self::BitPacked(r) => r.failed(),
        }
    }

    pub fn crc8(&self) -> u8 {
        match self {
            Self::Arithmetic(dec) => dec.crc8(),
            Self::BitPacked(r) => r.crc8(),
        }
    }
}
