//! Packet framing: header obfuscation tables, the rolling packet hash and
//! the sequence-tag parser.
//!
//! Byte 0 of every packet is a fixed permutation of the frame id
//! (`sync_flag << 7 | basis_tag`), byte 1 a second permutation of the low
//! bits of the current sequence number. The permutations are multiplicative
//! byte bijections built at compile time together with their inverses, so a
//! casual observer sees neither small integers nor a counting pattern.

use crate::config::Config;

const fn perm_table(mul: u8, add: u8) -> [u8; 256] {
    // mul must be odd for the map to be a bijection on Z/256.
    let mut t = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        t[i] = (i as u8).wrapping_mul(mul).wrapping_add(add);
        i += 1;
    }
    t
}

const fn invert(t: &[u8; 256]) -> [u8; 256] {
    let mut inv = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        inv[t[i] as usize] = i as u8;
        i += 1;
    }
    inv
}

pub const HEADER_FROM_ID: [u8; 256] = perm_table(167, 0x2B);
pub const ID_FROM_HEADER: [u8; 256] = invert(&HEADER_FROM_ID);
pub const SEQ_BYTES: [u8; 256] = perm_table(59, 0x91);
pub const UNSEQ_BYTES: [u8; 256] = invert(&SEQ_BYTES);

const SYNC_FLAG: u8 = 0x80;

/// Smallest packet the parser will even look at.
pub fn min_packet_size(crc8: bool) -> usize {
    7 + usize::from(crc8)
}

/// 8-bit rolling hash folded over the packet body. Trivial to compute, hard
/// to satisfy by accident after random corruption.
pub fn quick_hash(bytes: &[u8]) -> u8 {
    let mut h = 0u8;
    for &b in bytes {
        h = h.wrapping_mul(5).wrapping_add(b);
    }
    h
}

pub fn encode_header(basis_tag: u32, in_sync: bool) -> u8 {
    debug_assert!(basis_tag < 128);
    let id = basis_tag as u8 | if in_sync { SYNC_FLAG } else { 0 };
    HEADER_FROM_ID[id as usize]
}

pub fn encode_seq_byte(seq: u32, diameter: u32) -> u8 {
    SEQ_BYTES[(seq & (diameter - 1)) as usize]
}

/// Outcome of sequence-tag reconstruction against the receiver's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceParse {
    Parsed {
        current: u32,
        basis: u32,
        in_sync: bool,
    },
    /// At or behind a sequence already consumed. Benign duplicate.
    Stale,
    /// Beyond the send window; the peer could not legally have sent it.
    TooFar,
    /// Tags that decode to nothing a well-behaved peer would produce.
    Malformed,
}

/// Reconstruct the absolute current and basis sequence numbers from the two
/// obfuscated header bytes, relative to `input_seq` (the next sequence the
/// receiver expects). The tag is `sequence_bits` wide; anything within the
/// radius of the cursor is mapped back unambiguously.
pub fn parse_sequence(b0: u8, b1: u8, input_seq: u32, cfg: &Config) -> SequenceParse {
    let id = ID_FROM_HEADER[b0 as usize];
    let in_sync = id & SYNC_FLAG != 0;
    let basis_tag = u32::from(id & !SYNC_FLAG);
    if basis_tag >= cfg.window {
        return SequenceParse::Malformed;
    }

    let diameter = i64::from(cfg.diameter());
    let radius = i64::from(cfg.radius());
    let tag = i64::from(UNSEQ_BYTES[b1 as usize]) & (diameter - 1);
    let cursor = i64::from(input_seq);

    let mut current = (cursor & !(diameter - 1)) | tag;
    if current < cursor - radius {
        current += diameter;
    } else if current > cursor + radius {
        current -= diameter;
    }

    if current < cursor {
        return SequenceParse::Stale;
    }
    if current > cursor + i64::from(cfg.window) {
        return SequenceParse::TooFar;
    }
    let basis = current - i64::from(basis_tag) - 1;
    if basis < 0 {
        return SequenceParse::Malformed;
    }
    SequenceParse::Parsed {
        current: current as u32,
        basis: basis as u32,
        in_sync,
    }
}
