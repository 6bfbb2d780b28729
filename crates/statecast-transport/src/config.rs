//! Endpoint configuration.
//!
//! Sequence width, window size, reorder tolerance and stream flavor are
//! runtime knobs, validated once when the endpoint is built. Both peers
//! must run identical settings; nothing here is negotiated on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which concrete codec a connection runs. Both peers must agree; the
/// format is fixed for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    /// Adaptive range coding. Smallest packets, costs a few divides.
    Arithmetic,
    /// Fixed-width bit packing with escape-coded message ids.
    BitPacked,
}

/// Payload obfuscation applied to bytes `[2..end)` of every packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherConfig {
    Null,
    /// Keystream cipher seeded from the connection key. The keystream
    /// position travels with the basis snapshot, keeping both peers aligned.
    XorStream { key: [u8; 16] },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Width of the on-wire sequence tag. Diameter is `1 << sequence_bits`.
    pub sequence_bits: u32,
    /// Maximum packets in flight. Power of two, `2..=128`, and at most the
    /// sequence radius so wraparound reconstruction stays unambiguous.
    pub window: u32,
    /// How long an out-of-order arrival waits in the reorder buffer before
    /// the gap is treated as loss.
    pub incoming_timeout: Duration,
    /// Disable to drop out-of-order arrivals immediately instead of queueing.
    pub reorder_buffering: bool,
    /// Hard cap on messages decoded from one packet.
    pub max_messages_per_packet: u32,
    /// Minimum gap between verbatim resends of the cached assembly buffer.
    pub resend_holdoff: Duration,
    pub format: StreamFormat,
    /// Fold and verify the running stream hash just before end-of-stream.
    pub crc8: bool,
    pub cipher: CipherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sequence_bits: 8,
            window: 64,
            incoming_timeout: Duration::from_millis(33),
            reorder_buffering: true,
            max_messages_per_packet: 1 << 16,
            resend_holdoff: Duration::from_millis(500),
            format: StreamFormat::Arithmetic,
            crc8: false,
            cipher: CipherConfig::Null,
        }
    }
}

impl Config {
    /// Sequence space size.
    pub fn diameter(&self) -> u32 {
        1 << self.sequence_bits
    }

    /// Half the sequence space; the wraparound reconstruction horizon.
    pub fn radius(&self) -> u32 {
        self.diameter() / 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.window.is_power_of_two() || self.window < 2 || self.window > 128 {
            return Err(ConfigError::BadWindow(self.window));
        }
        if self.sequence_bits < 2 || self.sequence_bits > 8 {
            return Err(ConfigError::BadSequenceBits(self.sequence_bits));
        }
        if self.window > self.radius() {
            return Err(ConfigError::WindowExceedsRadius {
                window: self.window,
                radius: self.radius(),
            });
        }
        Ok(())
    }
}
