//! Message-id compression.
//!
//! Two paths, matching the codec flavor. Arithmetic streams code the id as
//! one adaptive-alphabet symbol over every registered id. Bit-packed streams
//! use escape-coded tiers driven by two hot tables: ids listed in the
//! current table's low/medium/high tier cost a few bits, everything else
//! escapes out to a full-width id. Certain ids flip the current table for
//! the rest of the stream; the switch rule runs identically on write and
//! read so both sides track the same table.

use crate::alphabet::Alphabet;
use crate::codec::{InputStream, OutputStream};
use crate::error::ConfigError;

/// Registered message identifier. Id 0 is reserved for the end-of-stream
/// marker; applications start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u16);

pub const END_OF_STREAM: MessageId = MessageId(0);

/// Which hot table the stream is currently coding against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HotTable {
    #[default]
    Normal,
    UpdateObject,
}

/// Field widths of the three escape tiers. Each tier holds
/// `(1 << bits) - 1` ids; the all-ones value escapes to the next tier.
const TIER_BITS: [u32; 3] = [2, 2, 4];

#[derive(Debug, Clone, Default)]
struct TableSpec {
    tiers: [Vec<MessageId>; 3],
}

impl TableSpec {
    fn find(&self, id: MessageId) -> Option<(usize, u32)> {
        for (tier, ids) in self.tiers.iter().enumerate() {
            if let Some(pos) = ids.iter().position(|&x| x == id) {
                return Some((tier, pos as u32));
            }
        }
        None
    }
}

/// The registry of everything the two peers may say to each other. Both
/// sides must construct it identically; it never changes after connect.
#[derive(Debug, Clone)]
pub struct MessageDirectory {
    count: u16,
    wide_bits: u32,
    normal: TableSpec,
    update: TableSpec,
    switches: Vec<(MessageId, HotTable)>,
}

impl MessageDirectory {
    /// `id_count` covers ids `0..id_count`, including the reserved
    /// end-of-stream id 0.
    pub fn new(id_count: u16) -> Result<Self, ConfigError> {
        if id_count < 2 {
            return Err(ConfigError::EmptyDirectory);
        }
        let wide_bits = u32::from(id_count)
            .next_power_of_two()
            .trailing_zeros()
            .max(1);
        Ok(Self {
            count: id_count,
            wide_bits,
            normal: TableSpec::default(),
            update: TableSpec::default(),
            switches: Vec::new(),
        })
    }

    /// Pin `ids` into a tier of a hot table. Overflowing ids beyond the
    /// tier's field capacity are ignored.
    pub fn with_hot(mut self, table: HotTable, tier: usize, ids: &[MessageId]) -> Self {
        debug_assert!(tier < 3);
        let cap = (1usize << TIER_BITS[tier]) - 1;
        let spec = match table {
            HotTable::Normal => &mut self.normal,
            HotTable::UpdateObject => &mut self.update,
        };
        spec.tiers[tier] = ids.iter().copied().take(cap).collect();
        self
    }

    /// Coding `on` switches the stream's current table to `to` for the
    /// messages that follow it.
    pub fn with_table_switch(mut self, on: MessageId, to: HotTable) -> Self {
        self.switches.push((on, to));
        self
    }

    pub fn id_count(&self) -> u16 {
        self.count
    }

    pub fn contains(&self, id: MessageId) -> bool {
        id.0 < self.count
    }

    fn spec(&self, table: HotTable) -> &TableSpec {
        match table {
            HotTable::Normal => &self.normal,
            HotTable::UpdateObject => &self.update,
        }
    }

    fn apply_switch(&self, id: MessageId, current: &mut HotTable) {
        if let Some(&(_, to)) = self.switches.iter().find(|&&(on, _)| on == id) {
            *current = to;
        }
    }

    pub fn write_id(
        &self,
        out: &mut OutputStream,
        alphabet: &mut Alphabet,
        current: &mut HotTable,
        id: MessageId,
    ) {
        debug_assert!(self.contains(id));
        match &*out {
            OutputStream::Arithmetic(_) => {
                alphabet.write_symbol(out, id.0 as usize);
            }
            OutputStream::BitPacked(_) => {
                match self.spec(*current).find(id) {
                    Some((tier, pos)) => {
                        for t in 0..tier {
                            out.write_bits((1 << TIER_BITS[t]) - 1, TIER_BITS[t]);
                        }
                        out.write_bits(pos, TIER_BITS[tier]);
                    }
                    None => {
                        for bits in TIER_BITS {
                            out.write_bits((1 << bits) - 1, bits);
                        }
                        out.write_bits(u32::from(id.0), self.wide_bits);
                    }
                }
                self.apply_switch(id, current);
            }
        }
    }

    /// `None` means the stream decoded to an id no peer would send:
    /// a tier slot past the table or a wide id past the registry.
    pub fn read_id(
        &self,
        inp: &mut InputStream<'_>,
        alphabet: &mut Alphabet,
        current: &mut HotTable,
    ) -> Option<MessageId> {
        match &*inp {
            InputStream::Arithmetic(_) => {
                let sym = alphabet.read_symbol(inp);
                Some(MessageId(sym as u16))
            }
            InputStream::BitPacked(_) => {
                let mut id = None;
                for (tier, bits) in TIER_BITS.into_iter().enumerate() {
                    let v = inp.read_bits(bits);
                    if v != (1 << bits) - 1 {
                        let ids = &self.spec(*current).tiers[tier];
                        id = Some(*ids.get(v as usize)?);
                        break;
                    }
                }
                let id = match id {
                    Some(id) => id,
                    None => {
                        let wide = inp.read_bits(self.wide_bits);
                        if wide >= u32::from(self.count) {
                            return None;
                        }
                        MessageId(wide as u16)
                    }
                };
                self.apply_switch(id, current);
                Some(id)
            }
        }
    }
}
