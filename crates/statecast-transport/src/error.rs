//! Error taxonomy.
//!
//! The engine distinguishes two classes of trouble. Recoverable conditions
//! (stale duplicates, packets beyond the reorder horizon, arrivals that
//! reference an already-freed basis) are logged and dropped without surfacing
//! an error. Fatal conditions poison the connection: the fault is recorded,
//! every later entry point becomes a no-op, and the owner reads the fault
//! off the endpoint to tear the connection down.

use thiserror::Error;

/// Fatal protocol fault. Once raised the connection is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol error: {reason}")]
pub struct ProtocolError {
    pub reason: &'static str,
}

impl ProtocolError {
    pub fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

/// Configuration rejected at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("window must be a power of two in 2..=128, got {0}")]
    BadWindow(u32),
    #[error("sequence_bits must be in 2..=8, got {0}")]
    BadSequenceBits(u32),
    #[error("window {window} does not fit the sequence radius {radius}")]
    WindowExceedsRadius { window: u32, radius: u32 },
    #[error("message directory must register at least one id beyond END_OF_STREAM")]
    EmptyDirectory,
}
