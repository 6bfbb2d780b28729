//! Endpoint counters, exposed as a plain snapshot.

use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Malformed, stale, far-future or basis-incompatible arrivals.
    pub packets_dropped: u64,
    /// Verbatim resends of the cached assembly buffer.
    pub packets_resent: u64,
    /// Out-of-order arrivals parked in the reorder buffer.
    pub packets_queued: u64,
    /// Parked packets replayed once their turn came.
    pub reorder_replayed: u64,
    /// Parked packets processed by timeout, nacking the gap.
    pub reorder_timeouts: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub acks_sent: u64,
    pub nacks_synthesized: u64,
    pub urgent_acks: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
