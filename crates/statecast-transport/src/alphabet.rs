//! Adaptive frequency alphabet for the range coder.
//!
//! Counts start at one per symbol and bump after every coded symbol, on the
//! encoder and the decoder alike, so two alphabets cloned from the same
//! basis stay bit-identical for the rest of their lives. In bit-packed mode
//! the alphabet degenerates to the symbol's fixed-width index.

use crate::codec::{InputStream, OutputStream};

/// Halve counts once the running total reaches this. Keeps `total` far
/// below the coder's probability ceiling while letting statistics adapt.
const RESCALE_TOTAL: u32 = 1 << 14;

/// How much a coded symbol's count grows.
const BUMP: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alphabet {
    counts: Vec<u32>,
    total: u32,
    index_bits: u32,
}

impl Alphabet {
    pub fn new(symbols: usize) -> Self {
        debug_assert!(symbols >= 2);
        let index_bits = (symbols as u32).next_power_of_two().trailing_zeros().max(1);
        Self {
            counts: vec![1; symbols],
            total: symbols as u32,
            index_bits,
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Reuse this allocation as a copy of `basis`.
    pub fn copy_from(&mut self, basis: &Alphabet) {
        self.counts.clear();
        self.counts.extend_from_slice(&basis.counts);
        self.total = basis.total;
        self.index_bits = basis.index_bits;
    }

    fn bump(&mut self, symbol: usize) {
        self.counts[symbol] += BUMP;
        self.total += BUMP;
        if self.total >= RESCALE_TOTAL {
            self.total = 0;
            for c in &mut self.counts {
                *c = (*c >> 1) | 1;
                self.total += *c;
            }
        }
    }

    fn interval(&self, symbol: usize) -> (u64, u64) {
        let low: u32 = self.counts[..symbol].iter().sum();
        (u64::from(low), u64::from(self.counts[symbol]))
    }

    pub fn write_symbol(&mut self, out: &mut OutputStream, symbol: usize) {
        debug_assert!(symbol < self.counts.len());
        match out {
            OutputStream::Arithmetic(enc) => {
                let (low, width) = self.interval(symbol);
                enc.encode(u64::from(self.total), low, width);
                self.bump(symbol);
            }
            OutputStream::BitPacked(w) => {
                w.write_bits(symbol as u32, self.index_bits);
            }
        }
    }

    pub fn read_symbol(&mut self, inp: &mut InputStream<'_>) -> usize {
        match inp {
            InputStream::Arithmetic(dec) => {
                let target = dec.decode(u64::from(self.total));
                let mut low = 0u64;
                let mut symbol = self.counts.len() - 1;
                for (i, &c) in self.counts.iter().enumerate() {
                    let next = low + u64::from(c);
                    if target < next {
                        symbol = i;
                        break;
                    }
                    low = next;
                }
                dec.update(u64::from(self.total), low, u64::from(self.counts[symbol]));
                self.bump(symbol);
                symbol
            }
            InputStream::BitPacked(r) => {
                let v = r.read_bits(self.index_bits) as usize;
                v.min(self.counts.len() - 1)
            }
        }
    }
}
