//! The sequencing engine.
//!
//! One `Endpoint` owns one end of a connection: it assembles outgoing
//! packets against the last acknowledged basis snapshot, decodes incoming
//! packets against the peer's claimed basis, keeps the ack/nack deque both
//! sides replay until confirmed, and turns every protocol violation into a
//! single recorded fault after which the engine is inert.
//!
//! Sequence bookkeeping:
//!
//! - `output_seq`  last packet we sent
//! - `input_ack`   last of our packets the peer acknowledged (our basis)
//! - `input_seq`   next peer packet we expect to process
//! - `front_ack`   index of the oldest unconfirmed entry in the ack deque
//!
//! Ack entries are indexed by the peer packet they answer, one entry per
//! sequence with synthetic urgent nacks filling receive gaps, so the k-th
//! entry ever decoded on either side always refers to packet k.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, SeedableRng};
use slab::Slab;
use tracing::{debug, error, warn};

use crate::bigstate::{BigState, BigStatePool};
use crate::codec::{InputStream, OutputStream};
use crate::config::Config;
use crate::error::{ConfigError, ProtocolError};
use crate::frame::{self, SequenceParse};
use crate::msgid::{MessageDirectory, MessageId, END_OF_STREAM};
use crate::stats::EndpointStats;
use crate::traits::{DispatchResult, EndpointIo, FillResult, MessageEnv, SendableHandle};

const ACK_NACK: usize = 0;
const ACK_ACK: usize = 1;
const ACK_END_RETURN_NEEDED: usize = 2;
const ACK_END_PLAIN: usize = 3;

/// Headroom subtracted from the packet budget before message fill, covering
/// acks, signing, timestamp and the end-of-stream trailer.
const PACKET_RESERVED_BYTES: usize = 32;

/// A backoff older than this raises `BackoffTooLong` every update.
const BACKOFF_WARN_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    SendingPacket { seq: u32 },
    /// The last state-blocking message in flight was resolved.
    NoBlockingMessages,
    BackoffTooLong,
}

#[derive(Debug, Clone, Copy)]
struct AckData {
    ok: bool,
    urgent: bool,
    had_data: bool,
}

struct SentElem {
    handle: SendableHandle,
    next: Option<usize>,
}

#[derive(Default)]
struct OutputState {
    big: Option<BigState>,
    /// Ack entries written through this packet since connection start.
    acks_written: u32,
    head_sent: Option<usize>,
    state_blockers: u32,
}

struct InputState {
    big: Option<BigState>,
    /// Ack entries decoded through this packet since connection start.
    acks_read: u32,
    valid_seq: u32,
}

impl Default for InputState {
    fn default() -> Self {
        Self {
            big: None,
            acks_read: 0,
            valid_seq: u32::MAX,
        }
    }
}

struct PendingPacket {
    bytes: Vec<u8>,
    arrived: Instant,
}

/// Per-message attributes supplied by the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageFlags {
    /// Urgent messages keep the peer's ack loop from idling.
    pub urgent: bool,
    /// Pins the connection state until the carrying packet resolves.
    pub blocks_state_change: bool,
    /// Forces the packet onto the synchronous decode path.
    pub needs_sync_decode: bool,
}

/// Budgeted view of the packet under assembly, handed to the message queue.
pub struct PacketWriter<'a> {
    stream: &'a mut OutputStream,
    big: &'a mut BigState,
    directory: &'a MessageDirectory,
    budget: usize,
    max_messages: u32,
    messages: u32,
    handles: Vec<SendableHandle>,
    urgent: bool,
    needs_sync: bool,
    blockers: u32,
}

impl PacketWriter<'_> {
    pub fn has_room(&self) -> bool {
        self.stream.approx_len() < self.budget && self.messages < self.max_messages
    }

    /// Open a message. Returns false, writing nothing, when the packet is
    /// full or the id is not sendable; the queue keeps the message for a
    /// later packet.
    pub fn begin_message(
        &mut self,
        id: MessageId,
        handle: SendableHandle,
        flags: MessageFlags,
    ) -> bool {
        if !self.has_room() || id == END_OF_STREAM || !self.directory.contains(id) {
            return false;
        }
        self.directory.write_id(
            self.stream,
            &mut self.big.msg_alphabet,
            &mut self.big.current_table,
            id,
        );
        self.handles.push(handle);
        self.messages += 1;
        self.urgent |= flags.urgent;
        self.needs_sync |= flags.needs_sync_decode;
        if flags.blocks_state_change {
            self.blockers += 1;
        }
        true
    }

    /// Append payload bits to the message opened last.
    pub fn write_bits(&mut self, value: u32, bits: u32) {
        self.stream.write_bits(value, bits);
    }
}

/// Per-update send policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct UpdateParams {
    /// The owner is tearing the connection down; push out what remains.
    pub disconnecting: bool,
    /// Allow user messages. Acks and keepalives always may flow.
    pub allow_user_send: bool,
    /// Send even if the rate policy would rather wait.
    pub force: bool,
    /// Keep sending until the queue drains.
    pub flush: bool,
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self {
            disconnecting: false,
            allow_user_send: true,
            force: false,
            flush: false,
        }
    }
}

pub struct Endpoint {
    cfg: Config,
    directory: MessageDirectory,
    state: ConnectionState,
    fault: Option<ProtocolError>,

    output_seq: u32,
    input_seq: u32,
    input_ack: u32,
    last_basis_seq: u32,
    front_ack: u32,

    output_states: Vec<OutputState>,
    input_states: Vec<InputState>,
    pool_out: BigStatePool,
    pool_in: BigStatePool,

    acks: VecDeque<AckData>,
    peer_wants_ack: bool,

    pending: BTreeMap<u32, PendingPacket>,
    sent_elems: Slab<SentElem>,
    state_blockers: u32,

    reliable_seq: u32,
    reliable_wait: bool,

    resend_buffer: Bytes,
    last_send: Option<Instant>,
    last_resend: Option<Instant>,
    epoch: Option<Instant>,

    backoff_since: Option<Instant>,

    rng: StdRng,
    stats: EndpointStats,
    events: Vec<EndpointEvent>,
}

impl Endpoint {
    pub fn new(cfg: Config, directory: MessageDirectory) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let window = cfg.window as usize;
        let mut pool_out = BigStatePool::new();
        let mut pool_in = BigStatePool::new();

        let mut output_states: Vec<OutputState> =
            (0..window).map(|_| OutputState::default()).collect();
        output_states[0].big = Some(pool_out.create_initial(&directory, &cfg.cipher));

        let mut input_states: Vec<InputState> =
            (0..window).map(|_| InputState::default()).collect();
        input_states[0] = InputState {
            big: Some(pool_in.create_initial(&directory, &cfg.cipher)),
            acks_read: 0,
            valid_seq: 0,
        };

        Ok(Self {
            cfg,
            directory,
            state: ConnectionState::Connecting,
            fault: None,
            output_seq: 0,
            input_seq: 1,
            input_ack: 0,
            last_basis_seq: 0,
            front_ack: 1,
            output_states,
            input_states,
            pool_out,
            pool_in,
            acks: VecDeque::new(),
            peer_wants_ack: false,
            pending: BTreeMap::new(),
            sent_elems: Slab::new(),
            state_blockers: 0,
            reliable_seq: 0,
            reliable_wait: false,
            resend_buffer: Bytes::new(),
            last_send: None,
            last_resend: None,
            epoch: None,
            backoff_since: None,
            rng: StdRng::from_entropy(),
            stats: EndpointStats::default(),
            events: Vec::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn fault(&self) -> Option<&ProtocolError> {
        self.fault.as_ref()
    }

    pub fn stats(&self) -> EndpointStats {
        self.stats
    }

    pub fn take_events(&mut self) -> Vec<EndpointEvent> {
        mem::take(&mut self.events)
    }

    /// Packets the peer has not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.output_seq - self.input_ack
    }

    /// Suppress sends until traffic from the peer resumes.
    pub fn back_off(&mut self, now: Instant) {
        self.backoff_since.get_or_insert(now);
    }

    pub fn perform_regular_cleanup(&mut self) {
        self.pool_out.perform_regular_cleanup();
        self.pool_in.perform_regular_cleanup();
    }

    fn slot(&self, seq: u32) -> usize {
        (seq & (self.cfg.window - 1)) as usize
    }

    fn fail(&mut self, e: ProtocolError) {
        if self.fault.is_none() {
            error!(reason = e.reason, "connection fault, endpoint is now inert");
            self.fault = Some(e);
            self.state = ConnectionState::Disconnected;
        }
    }

    // ─── Driving ─────────────────────────────────────────────────────────

    pub fn update(&mut self, now: Instant, io: &mut EndpointIo<'_>, params: UpdateParams) {
        if self.fault.is_some() || self.state == ConnectionState::Disconnected {
            return;
        }
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
        }
        if params.disconnecting {
            self.state = ConnectionState::Disconnecting;
        }
        self.update_pending_queue(now, io);
        if self.fault.is_some() {
            return;
        }
        if let Some(since) = self.backoff_since {
            if now.duration_since(since) >= BACKOFF_WARN_AFTER {
                self.events.push(EndpointEvent::BackoffTooLong);
            }
            return;
        }
        self.send_packets(now, io, params);
    }

    /// Feed a datagram fresh off the wire.
    pub fn receive(&mut self, now: Instant, packet: &[u8], io: &mut EndpointIo<'_>) {
        if self.fault.is_some() || self.state == ConnectionState::Disconnected {
            return;
        }
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
        }
        self.backoff_since = None;
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.len() as u64;
        io.rate.got_packet(now, packet.len());
        self.process_inner(now, packet, io, true);
        self.update_pending_queue(now, io);
    }

    /// Tear the connection down: nack everything in flight, tell the queue
    /// to forget it all, free every snapshot.
    pub fn empty_messages(&mut self, io: &mut EndpointIo<'_>) {
        let mut handles = Vec::new();
        for st in &mut self.output_states {
            let mut head = st.head_sent.take();
            while let Some(idx) = head {
                let elem = self.sent_elems.remove(idx);
                handles.push(elem.handle);
                head = elem.next;
            }
            if let Some(big) = st.big.take() {
                self.pool_out.release(big);
            }
            st.state_blockers = 0;
        }
        for st in &mut self.input_states {
            if let Some(big) = st.big.take() {
                self.pool_in.release(big);
            }
            st.valid_seq = u32::MAX;
        }
        io.queue.ack_messages(&handles, self.input_ack, false, true);
        self.acks.clear();
        self.pending.clear();
        self.state_blockers = 0;
        self.reliable_wait = false;
        self.state = ConnectionState::Disconnected;
    }

    // ─── Receive path ────────────────────────────────────────────────────

    fn process_inner(
        &mut self,
        now: Instant,
        packet: &[u8],
        io: &mut EndpointIo<'_>,
        queueing: bool,
    ) {
        if let Err(e) = self.try_process(now, packet, io, queueing) {
            self.fail(e);
        }
    }

    fn try_process(
        &mut self,
        now: Instant,
        packet: &[u8],
        io: &mut EndpointIo<'_>,
        queueing: bool,
    ) -> Result<(), ProtocolError> {
        if packet.len() < frame::min_packet_size(self.cfg.crc8) {
            warn!(len = packet.len(), "runt packet");
            self.stats.packets_dropped += 1;
            return Ok(());
        }
        let (current, basis, in_sync) =
            match frame::parse_sequence(packet[0], packet[1], self.input_seq, &self.cfg) {
                SequenceParse::Parsed {
                    current,
                    basis,
                    in_sync,
                } => (current, basis, in_sync),
                SequenceParse::Stale => {
                    debug!("stale duplicate");
                    self.stats.packets_dropped += 1;
                    return Ok(());
                }
                SequenceParse::TooFar => {
                    warn!("sequence beyond the send window");
                    self.stats.packets_dropped += 1;
                    return Ok(());
                }
                SequenceParse::Malformed => {
                    warn!("malformed sequence tags");
                    self.stats.packets_dropped += 1;
                    return Ok(());
                }
            };

        if current > self.input_seq && queueing && !in_sync && self.cfg.reorder_buffering {
            if self.pending.len() >= self.cfg.window as usize {
                warn!(seq = current, "reorder buffer full");
                self.stats.packets_dropped += 1;
                return Ok(());
            }
            self.pending.entry(current).or_insert_with(|| PendingPacket {
                bytes: packet.to_vec(),
                arrived: now,
            });
            self.stats.packets_queued += 1;
            return Ok(());
        }

        if basis < self.last_basis_seq {
            debug!(basis, last = self.last_basis_seq, "basis went backwards");
            self.stats.packets_dropped += 1;
            return Ok(());
        }
        let bslot = self.slot(basis);
        if self.input_states[bslot].valid_seq != basis {
            warn!(basis, "packet references a freed basis");
            self.stats.packets_dropped += 1;
            return Ok(());
        }
        let mut big = match &self.input_states[bslot].big {
            Some(b) => self.pool_in.clone_state(b),
            None => {
                warn!(basis, "packet references a freed basis");
                self.stats.packets_dropped += 1;
                return Ok(());
            }
        };
        let basis_acks_read = self.input_states[bslot].acks_read;

        let mut data = packet.to_vec();
        let body_len = data.len() - 2;
        big.cipher.apply(&mut data[2..]);

        let key = data[body_len];
        let hash = frame::quick_hash(&data[..body_len]);
        if data[body_len + 1] != hash ^ key {
            return Err(ProtocolError::new("packet hash mismatch"));
        }

        // The packet is authentic; commit the basis advance.
        let free_from = basis
            .saturating_sub(self.cfg.window)
            .max(self.last_basis_seq);
        for s in free_from..basis {
            let sl = self.slot(s);
            if self.input_states[sl].valid_seq == s {
                if let Some(b) = self.input_states[sl].big.take() {
                    self.pool_in.release(b);
                }
                self.input_states[sl].valid_seq = u32::MAX;
            }
        }
        self.last_basis_seq = basis;

        // Sequences skipped between the cursor and this packet are lost.
        for _ in self.input_seq..current {
            self.acks.push_back(AckData {
                ok: false,
                urgent: true,
                had_data: false,
            });
            self.stats.nacks_synthesized += 1;
        }

        let mut inp = InputStream::new(self.cfg.format, &data[2..body_len]);

        let mut acks_read = basis_acks_read;
        loop {
            match big.ack_alphabet.read_symbol(&mut inp) {
                sym @ (ACK_NACK | ACK_ACK) => {
                    acks_read += 1;
                    self.ack_packet(now, acks_read, sym == ACK_ACK, io)?;
                }
                ACK_END_RETURN_NEEDED => {
                    self.peer_wants_ack = true;
                    break;
                }
                _ => break,
            }
        }

        if inp.read_bits(8) as u8 != key {
            return Err(ProtocolError::new("signing key mismatch"));
        }
        big.time_fraction = inp.read_bits(32);

        self.acks.push_back(AckData {
            ok: true,
            urgent: false,
            had_data: false,
        });

        let mut messages = 0u32;
        loop {
            let id = match self.directory.read_id(
                &mut inp,
                &mut big.msg_alphabet,
                &mut big.current_table,
            ) {
                Some(id) => id,
                None => return Err(ProtocolError::new("undecodable message id")),
            };
            if id == END_OF_STREAM {
                break;
            }
            if inp.failed() {
                return Err(ProtocolError::new("truncated message stream"));
            }
            messages += 1;
            if messages > self.cfg.max_messages_per_packet {
                return Err(ProtocolError::new("too many messages in one packet"));
            }
            if let Some(e) = self.acks.back_mut() {
                e.had_data = true;
            }
            let env = MessageEnv {
                current_seq: current,
                basis_seq: basis,
                time_fraction: big.time_fraction,
                in_sync,
            };
            match io.sink.dispatch(id, &mut inp, &env) {
                DispatchResult::Accepted { .. } => {}
                DispatchResult::Rejected => {
                    return Err(ProtocolError::new("sink rejected message"));
                }
            }
            self.stats.messages_received += 1;
        }

        if inp.read_bits(1) == 1 {
            self.stats.urgent_acks += 1;
            if let Some(e) = self.acks.back_mut() {
                e.urgent = true;
            }
        }
        if self.cfg.crc8 {
            let expect = inp.crc8();
            let got = inp.read_bits(8) as u8;
            if got != expect {
                return Err(ProtocolError::new("stream crc mismatch"));
            }
        }
        if inp.read_bits(8) as u8 != key ^ 0xFF {
            return Err(ProtocolError::new("end-of-stream signing mismatch"));
        }
        if inp.failed() {
            return Err(ProtocolError::new("truncated packet"));
        }
        drop(inp);

        self.input_seq = current + 1;
        let slot = self.slot(current);
        if let Some(old) = self.input_states[slot].big.take() {
            self.pool_in.release(old);
        }
        self.input_states[slot] = InputState {
            big: Some(big),
            acks_read,
            valid_seq: current,
        };
        Ok(())
    }

    fn ack_packet(
        &mut self,
        now: Instant,
        seq: u32,
        ok: bool,
        io: &mut EndpointIo<'_>,
    ) -> Result<(), ProtocolError> {
        if seq > self.output_seq {
            return Err(ProtocolError::new("ack for a packet never sent"));
        }
        if seq <= self.input_ack {
            // Replay of history already applied via an older basis.
            return Ok(());
        }
        if seq != self.input_ack + 1 {
            return Err(ProtocolError::new("out-of-order ack"));
        }
        let new_slot = self.slot(seq);
        if self.output_states[new_slot].big.is_none() {
            return Err(ProtocolError::new("ack for an unavailable slot"));
        }
        let old_slot = self.slot(self.input_ack);
        if let Some(big) = self.output_states[old_slot].big.take() {
            self.pool_out.release(big);
        }
        self.input_ack = seq;
        if self.reliable_wait && seq == self.reliable_seq {
            self.reliable_wait = false;
        }

        let mut handles = Vec::new();
        let mut head = self.output_states[new_slot].head_sent.take();
        while let Some(idx) = head {
            let elem = self.sent_elems.remove(idx);
            handles.push(elem.handle);
            head = elem.next;
        }
        if !handles.is_empty() {
            io.queue.ack_messages(&handles, seq, ok, false);
        }
        io.rate.acked_packet(now, seq, ok);

        let blockers = mem::take(&mut self.output_states[new_slot].state_blockers);
        if blockers > 0 {
            self.state_blockers = self.state_blockers.saturating_sub(blockers);
            if self.state_blockers == 0 {
                self.events.push(EndpointEvent::NoBlockingMessages);
            }
        }
        Ok(())
    }

    fn update_pending_queue(&mut self, now: Instant, io: &mut EndpointIo<'_>) {
        while self.fault.is_none() {
            let seq = match self.pending.first_key_value() {
                Some((&seq, _)) => seq,
                None => break,
            };
            if seq < self.input_seq {
                self.pending.pop_first();
                self.stats.packets_dropped += 1;
                continue;
            }
            let ready = seq == self.input_seq;
            let timed_out = match self.pending.get(&seq) {
                Some(p) => now.duration_since(p.arrived) >= self.cfg.incoming_timeout,
                None => false,
            };
            if !ready && !timed_out {
                break;
            }
            if let Some((_, p)) = self.pending.pop_first() {
                if ready {
                    self.stats.reorder_replayed += 1;
                } else {
                    self.stats.reorder_timeouts += 1;
                }
                self.process_inner(now, &p.bytes, io, false);
            }
        }
    }

    // ─── Send path ───────────────────────────────────────────────────────

    fn is_idle(&self, io: &EndpointIo<'_>) -> bool {
        io.queue.is_idle()
            && !self.reliable_wait
            && !self.peer_wants_ack
            && !self.acks.iter().any(|a| a.urgent)
    }

    fn send_packets(&mut self, now: Instant, io: &mut EndpointIo<'_>, p: UpdateParams) {
        let disconnecting = p.disconnecting;
        let allow_user = p.allow_user_send && !disconnecting;
        let flush = p.flush && !disconnecting;
        let mut force = p.force || disconnecting || flush;
        if self.acks.len() as u32 > self.cfg.window / 4 {
            force = true;
        }
        loop {
            if self.output_seq + 1 >= self.input_ack + self.cfg.window {
                self.resend_current(now, io, force);
                return;
            }
            let max = io.rate.max_packet_size();
            let size = if force {
                max
            } else {
                let idle = self.is_idle(io);
                let age = self
                    .last_send
                    .map(|t| {
                        now.duration_since(t)
                            .as_millis()
                            .min(u128::from(u32::MAX)) as u32
                    })
                    .unwrap_or(u32::MAX);
                io.rate.ideal_packet_size(age, idle, max)
            };
            if size == 0 {
                return;
            }
            let sent = match self.send_packet(now, io, size.min(max), allow_user, force) {
                Ok(n) => n,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            if sent == 0 {
                return;
            }
            force = false;
            if !(flush && allow_user && !io.queue.is_empty()) {
                return;
            }
        }
    }

    /// The window is exhausted; the only legal traffic is a byte-for-byte
    /// repeat of the newest packet. Rebuilding it would fork the adaptive
    /// statistics the peer will clone from.
    fn resend_current(&mut self, now: Instant, io: &mut EndpointIo<'_>, force: bool) {
        if self.resend_buffer.is_empty() {
            return;
        }
        if !(force || !io.queue.is_empty() || !self.acks.is_empty()) {
            return;
        }
        if let Some(t) = self.last_resend {
            if now.duration_since(t) < self.cfg.resend_holdoff {
                return;
            }
        }
        debug!(seq = self.output_seq, "window exhausted, repeating last packet");
        io.transport.send(&self.resend_buffer);
        self.last_resend = Some(now);
        self.stats.packets_resent += 1;
        self.stats.bytes_sent += self.resend_buffer.len() as u64;
    }

    fn send_packet(
        &mut self,
        now: Instant,
        io: &mut EndpointIo<'_>,
        budget: usize,
        allow_user: bool,
        force: bool,
    ) -> Result<usize, ProtocolError> {
        // Drop ack entries the basis proves delivered.
        let basis_slot = self.slot(self.input_ack);
        while self.front_ack <= self.output_states[basis_slot].acks_written {
            if self.acks.pop_front().is_none() {
                break;
            }
            self.front_ack += 1;
        }

        let user_data = allow_user && !io.queue.is_empty();
        if !(force || user_data || !self.acks.is_empty()) {
            return Ok(0);
        }
        let basis_big = match &self.output_states[basis_slot].big {
            Some(b) => b,
            None => return Err(ProtocolError::new("send basis state missing")),
        };
        let mut big = self.pool_out.clone_state(basis_big);
        let seq = self.output_seq + 1;
        let mut out = OutputStream::new(self.cfg.format);

        let mut acks_written = self.output_states[basis_slot].acks_written;
        for a in &self.acks {
            big.ack_alphabet
                .write_symbol(&mut out, if a.ok { ACK_ACK } else { ACK_NACK });
            acks_written += 1;
        }
        let return_needed = user_data || self.reliable_wait;
        big.ack_alphabet.write_symbol(
            &mut out,
            if return_needed {
                ACK_END_RETURN_NEEDED
            } else {
                ACK_END_PLAIN
            },
        );
        self.stats.acks_sent += self.acks.len() as u64;

        let key: u8 = self.rng.gen();
        out.write_bits(u32::from(key), 8);

        let epoch = *self.epoch.get_or_insert(now);
        let time_fraction = now.duration_since(epoch).as_micros() as u32;
        out.write_bits(time_fraction, 32);

        let mut writer = PacketWriter {
            stream: &mut out,
            big: &mut big,
            directory: &self.directory,
            budget: budget.saturating_sub(PACKET_RESERVED_BYTES),
            max_messages: self.cfg.max_messages_per_packet,
            messages: 0,
            handles: Vec::new(),
            urgent: false,
            needs_sync: false,
            blockers: 0,
        };
        let mut fill = FillResult::Ok;
        if user_data {
            let fill_budget = writer.budget;
            fill = io.queue.build_packet(&mut writer, fill_budget);
            if fill == FillResult::Fail {
                return Err(ProtocolError::new("message queue failed to build a packet"));
            }
        }
        let messages = writer.messages;
        let handles = mem::take(&mut writer.handles);
        let urgent = writer.urgent;
        let needs_sync = writer.needs_sync;
        let blockers = writer.blockers;
        drop(writer);

        // A delaying queue that wrote nothing leaves the packet with no
        // payload worth a sequence number; hold it back unless acks or a
        // forced keepalive must go out anyway.
        if fill == FillResult::Delay && messages == 0 && !force && self.acks.is_empty() {
            self.pool_out.release(big);
            return Ok(0);
        }

        self.directory
            .write_id(&mut out, &mut big.msg_alphabet, &mut big.current_table, END_OF_STREAM);
        out.write_bits(u32::from(urgent), 1);
        if self.cfg.crc8 {
            let c = out.crc8();
            out.write_bits(u32::from(c), 8);
        }
        out.write_bits(u32::from(key ^ 0xFF), 8);

        let stream_bytes = out.finish();
        let mut pkt = BytesMut::with_capacity(stream_bytes.len() + 4);
        pkt.put_u8(frame::encode_header(seq - self.input_ack - 1, needs_sync));
        pkt.put_u8(frame::encode_seq_byte(seq, self.cfg.diameter()));
        pkt.extend_from_slice(&stream_bytes);
        let hash = frame::quick_hash(&pkt);
        pkt.put_u8(key);
        pkt.put_u8(hash ^ key);
        big.cipher.apply(&mut pkt[2..]);

        self.output_seq = seq;
        let slot = self.slot(seq);
        debug_assert!(self.output_states[slot].big.is_none());
        let mut head = None;
        for h in handles {
            let idx = self.sent_elems.insert(SentElem { handle: h, next: head });
            head = Some(idx);
        }
        self.output_states[slot] = OutputState {
            big: Some(big),
            acks_written,
            head_sent: head,
            state_blockers: blockers,
        };
        self.state_blockers += blockers;
        if messages > 0 && !self.reliable_wait {
            self.reliable_wait = true;
            self.reliable_seq = seq;
        }
        self.peer_wants_ack = false;

        self.events.push(EndpointEvent::SendingPacket { seq });
        io.transport.send(&pkt);
        io.rate.sent_packet(now, seq, pkt.len());
        self.last_send = Some(now);
        self.stats.packets_sent += 1;
        self.stats.messages_sent += u64::from(messages);
        self.stats.bytes_sent += pkt.len() as u64;
        let len = pkt.len();
        self.resend_buffer = pkt.freeze();
        Ok(len)
    }
}
