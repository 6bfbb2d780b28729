//! Per-sequence endpoint state and its pool.
//!
//! Every packet is coded against a snapshot of the adaptive statistics as
//! they stood after some acknowledged packet (the basis). A `BigState` is
//! that snapshot: both alphabets, the hot-table cursor, the cipher
//! keystream position and the peer's last timestamp. Snapshots are never
//! shared between slots; cloning copies into a pooled buffer so the steady
//! state allocates nothing.

use std::fmt;

use crate::alphabet::Alphabet;
use crate::config::CipherConfig;
use crate::msgid::{HotTable, MessageDirectory};

/// Symbols of the ack alphabet: nack, ack, end-return-needed, end-plain.
pub const ACK_SYMBOLS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct BigState {
    pub ack_alphabet: Alphabet,
    pub msg_alphabet: Alphabet,
    pub current_table: HotTable,
    pub cipher: PacketCipher,
    pub time_fraction: u32,
}

impl BigState {
    fn new(directory: &MessageDirectory, cipher: PacketCipher) -> Self {
        Self {
            ack_alphabet: Alphabet::new(ACK_SYMBOLS),
            msg_alphabet: Alphabet::new(usize::from(directory.id_count())),
            current_table: HotTable::Normal,
            cipher,
            time_fraction: 0,
        }
    }

    /// Overwrite this buffer with a snapshot of `basis`, reusing the
    /// allocations already held.
    pub fn copy_from(&mut self, basis: &BigState) {
        self.ack_alphabet.copy_from(&basis.ack_alphabet);
        self.msg_alphabet.copy_from(&basis.msg_alphabet);
        self.current_table = basis.current_table;
        self.cipher = basis.cipher.clone();
        self.time_fraction = basis.time_fraction;
    }
}

/// Recycler for `BigState` buffers. Freed snapshots go back here and are
/// reused for the next clone instead of reallocating the count vectors.
#[derive(Debug, Default)]
pub struct BigStatePool {
    free: Vec<BigState>,
}

impl BigStatePool {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// The slot-0 state both peers agree on before any packet has flowed.
    pub fn create_initial(
        &mut self,
        directory: &MessageDirectory,
        cipher: &CipherConfig,
    ) -> BigState {
        BigState::new(directory, PacketCipher::from_config(cipher))
    }

    pub fn clone_state(&mut self, basis: &BigState) -> BigState {
        match self.free.pop() {
            Some(mut st) => {
                st.copy_from(basis);
                st
            }
            None => basis.clone(),
        }
    }

    pub fn release(&mut self, state: BigState) {
        self.free.push(state);
    }

    /// Called from the endpoint's housekeeping; sheds half of the cached
    /// buffers so a burst of in-flight packets does not pin memory forever.
    pub fn perform_regular_cleanup(&mut self) {
        let keep = self.free.len() / 2;
        self.free.truncate(keep);
    }

    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

/// ─── Payload obfuscation ────────────────────────────────────────────────

#[derive(Clone, PartialEq)]
pub enum PacketCipher {
    Null,
    XorStream(StreamCipher),
}

impl PacketCipher {
    pub fn from_config(cfg: &CipherConfig) -> Self {
        match cfg {
            CipherConfig::Null => Self::Null,
            CipherConfig::XorStream { key } => Self::XorStream(StreamCipher::new(key)),
        }
    }

    /// XOR the keystream over `buf` in place. Encrypt and decrypt are the
    /// same operation; both sides advance their keystream in lockstep
    /// because the cipher state clones with the basis snapshot.
    pub fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Null => {}
            Self::XorStream(c) => c.apply(buf),
        }
    }
}

impl fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("PacketCipher::Null"),
            Self::XorStream(_) => f.write_str("PacketCipher::XorStream(..)"),
        }
    }
}

/// RC4-style byte keystream. Obfuscation against packet inspection, not
/// cryptographic protection; pick the key per connection.
#[derive(Clone, PartialEq)]
pub struct StreamCipher {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl StreamCipher {
    pub fn new(key: &[u8]) -> Self {
        debug_assert!(!key.is_empty());
        let mut s = [0u8; 256];
        for (idx, v) in s.iter_mut().enumerate() {
            *v = idx as u8;
        }
        let mut j = 0u8;
        for i in 0..256usize {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, usize::from(j));
        }
        Self { s, i: 0, j: 0 }
    }

    fn next(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[usize::from(self.i)]);
        self.s.swap(usize::from(self.i), usize::from(self.j));
        let k = self.s[usize::from(self.i)].wrapping_add(self.s[usize::from(self.j)]);
        self.s[usize::from(k)]
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        for b in buf {
            *b ^= self.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OutputStream;
    use crate::config::StreamFormat;
    use crate::msgid::MessageId;

    fn directory() -> MessageDirectory {
        MessageDirectory::new(16).unwrap()
    }

    #[test]
    fn clone_snapshots_do_not_share_statistics() {
        let dir = directory();
        let mut pool = BigStatePool::new();
        let basis = pool.create_initial(&dir, &CipherConfig::Null);
        let mut cloned = pool.clone_state(&basis);
        assert_eq!(cloned, basis);

        // Mutating the clone must leave the basis untouched.
        let mut out = OutputStream::new(StreamFormat::Arithmetic);
        let mut table = cloned.current_table;
        dir.write_id(&mut out, &mut cloned.msg_alphabet, &mut table, MessageId(5));
        assert_ne!(cloned.msg_alphabet, basis.msg_alphabet);
    }

    #[test]
    fn pool_recycles_released_buffers() {
        let dir = directory();
        let mut pool = BigStatePool::new();
        let basis = pool.create_initial(&dir, &CipherConfig::Null);
        let a = pool.clone_state(&basis);
        pool.release(a);
        assert_eq!(pool.pooled(), 1);
        let _b = pool.clone_state(&basis);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn cleanup_sheds_pooled_buffers() {
        let dir = directory();
        let mut pool = BigStatePool::new();
        let basis = pool.create_initial(&dir, &CipherConfig::Null);
        for _ in 0..8 {
            let st = pool.clone_state(&basis);
            pool.release(st);
            let st = basis.clone();
            pool.release(st);
        }
        let before = pool.pooled();
        pool.perform_regular_cleanup();
        assert_eq!(pool.pooled(), before / 2);
    }

    #[test]
    fn stream_cipher_is_symmetric_and_stateful() {
        let key = [9u8; 16];
        let mut enc = StreamCipher::new(&key);
        let mut dec = StreamCipher::new(&key);

        let mut first = *b"state update one";
        let plain_first = first;
        enc.apply(&mut first);
        let cipher_first = first;
        assert_ne!(first, plain_first);
        dec.apply(&mut first);
        assert_eq!(first, plain_first);

        // Keystream advances: the same plaintext encrypts differently later.
        let mut again = plain_first;
        enc.apply(&mut again);
        assert_ne!(again, cipher_first);
    }

    #[test]
    fn cipher_state_clones_with_the_snapshot() {
        let dir = directory();
        let mut pool = BigStatePool::new();
        let mut basis = pool.create_initial(&dir, &CipherConfig::XorStream { key: [3; 16] });
        let mut buf = [0u8; 32];
        basis.cipher.apply(&mut buf);

        let mut a = pool.clone_state(&basis);
        let mut b = pool.clone_state(&basis);
        let mut x = [0x55u8; 8];
        let mut y = [0x55u8; 8];
        a.cipher.apply(&mut x);
        b.cipher.apply(&mut y);
        assert_eq!(x, y);
    }
}
