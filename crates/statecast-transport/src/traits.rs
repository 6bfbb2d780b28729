//! Collaborator seams. The engine owns sequencing and coding only;
//! message storage, dispatch, datagram IO and rate policy are supplied by
//! the surrounding system through these traits, passed per call as an
//! `EndpointIo` bundle so the engine never holds them across calls.

use std::time::Instant;

use crate::codec::InputStream;
use crate::endpoint::PacketWriter;
use crate::msgid::MessageId;

/// Opaque ticket the queue uses to recognize its own messages when the
/// packet that carried them is acked or nacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendableHandle(pub u64);

/// Outcome of a packet-fill pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillResult {
    Ok,
    /// Nothing useful to write right now; try again next update.
    Delay,
    /// The queue is wedged; the connection cannot continue.
    Fail,
}

/// The outgoing message store. Ordering, priorities and payload encoding
/// beyond the message id are entirely the queue's business.
pub trait MessageQueue {
    /// Write as many messages as fit the writer's budget.
    fn build_packet(&mut self, writer: &mut PacketWriter<'_>, budget: usize) -> FillResult;

    /// The packet carrying `handles` was acknowledged (`ok`) or reported
    /// lost. With `force_clear` the connection is going away and the queue
    /// must drop all bookkeeping for them.
    fn ack_messages(&mut self, handles: &[SendableHandle], seq: u32, ok: bool, force_clear: bool);

    fn is_empty(&self) -> bool;

    /// True when nothing urgent is waiting; lets the link go quiet.
    fn is_idle(&self) -> bool {
        self.is_empty()
    }
}

/// Decode context handed to the sink with every message.
#[derive(Debug, Clone, Copy)]
pub struct MessageEnv {
    pub current_seq: u32,
    pub basis_seq: u32,
    /// The sender's clock fraction from the packet header.
    pub time_fraction: u32,
    pub in_sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Accepted {
        /// The message pins the connection state until its packet is acked.
        blocks_state_change: bool,
    },
    /// The sink could not make sense of the message. Fatal: the stream
    /// position after a failed decode is undefined.
    Rejected,
}

/// The incoming message consumer. `dispatch` must read the message's
/// payload from the stream exactly as the sender wrote it.
pub trait MessageSink {
    fn dispatch(
        &mut self,
        id: MessageId,
        stream: &mut InputStream<'_>,
        env: &MessageEnv,
    ) -> DispatchResult;
}

/// Fire-and-forget datagram output.
pub trait Transport {
    fn send(&mut self, packet: &[u8]);
}

/// Bandwidth policy. The engine asks before each send and reports every
/// send, delivery and arrival so the policy can adapt.
pub trait RateControl {
    fn max_packet_size(&self) -> usize;

    /// Target size for the next packet; zero suppresses the send.
    /// `age_ms` is the time since the last send, `idle` whether anything
    /// urgent is pending.
    fn ideal_packet_size(&mut self, age_ms: u32, idle: bool, max: usize) -> usize;

    fn sent_packet(&mut self, _now: Instant, _seq: u32, _bytes: usize) {}
    fn acked_packet(&mut self, _now: Instant, _seq: u32, _ok: bool) {}
    fn got_packet(&mut self, _now: Instant, _bytes: usize) {}
}

/// Per-call collaborator bundle.
pub struct EndpointIo<'a> {
    pub queue: &'a mut dyn MessageQueue,
    pub sink: &'a mut dyn MessageSink,
    pub transport: &'a mut dyn Transport,
    pub rate: &'a mut dyn RateControl,
}
