//! Two endpoints wired back to back through in-memory buffers, exercising
//! the full packet pipeline: loss, reordering, nack propagation, the
//! reorder buffer, integrity failures and the message cap.

use std::collections::VecDeque;
use std::mem;
use std::time::{Duration, Instant};

use statecast_transport::codec::OutputStream;
use statecast_transport::frame;
use statecast_transport::{
    CipherConfig, Config, ConnectionState, DispatchResult, Endpoint, EndpointIo, FillResult,
    MessageDirectory, MessageEnv, MessageFlags, MessageId, MessageQueue, MessageSink,
    PacketWriter, RateControl, SendableHandle, StreamFormat, Transport, UpdateParams,
    END_OF_STREAM,
};

const MSG_VALUE: MessageId = MessageId(1);

#[derive(Default)]
struct Queue {
    pending: VecDeque<(u64, u16, MessageFlags)>,
    acked: Vec<(u64, bool)>,
}

impl MessageQueue for Queue {
    fn build_packet(&mut self, w: &mut PacketWriter<'_>, _budget: usize) -> FillResult {
        while let Some(&(h, v, flags)) = self.pending.front() {
            if !w.begin_message(MSG_VALUE, SendableHandle(h), flags) {
                break;
            }
            w.write_bits(u32::from(v), 16);
            self.pending.pop_front();
        }
        FillResult::Ok
    }

    fn ack_messages(&mut self, handles: &[SendableHandle], _seq: u32, ok: bool, force: bool) {
        for h in handles {
            self.acked.push((h.0, ok));
        }
        if force {
            self.pending.clear();
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Default)]
struct Sink {
    got: Vec<(u16, MessageEnv)>,
}

impl MessageSink for Sink {
    fn dispatch(
        &mut self,
        id: MessageId,
        stream: &mut statecast_transport::codec::InputStream<'_>,
        env: &MessageEnv,
    ) -> DispatchResult {
        assert_eq!(id, MSG_VALUE);
        self.got.push((stream.read_bits(16) as u16, *env));
        DispatchResult::Accepted {
            blocks_state_change: false,
        }
    }
}

#[derive(Default)]
struct Net {
    sent: Vec<Vec<u8>>,
}

impl Transport for Net {
    fn send(&mut self, packet: &[u8]) {
        self.sent.push(packet.to_vec());
    }
}

struct Rate;

impl RateControl for Rate {
    fn max_packet_size(&self) -> usize {
        1200
    }
    fn ideal_packet_size(&mut self, _age_ms: u32, _idle: bool, max: usize) -> usize {
        max
    }
}

struct Peer {
    ep: Endpoint,
    queue: Queue,
    sink: Sink,
    net: Net,
    rate: Rate,
}

impl Peer {
    fn new(cfg: Config) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            ep: Endpoint::new(cfg, directory()).unwrap(),
            queue: Queue::default(),
            sink: Sink::default(),
            net: Net::default(),
            rate: Rate,
        }
    }

    fn update(&mut self, now: Instant) {
        self.update_with(now, UpdateParams::default());
    }

    fn update_with(&mut self, now: Instant, params: UpdateParams) {
        let mut io = EndpointIo {
            queue: &mut self.queue,
            sink: &mut self.sink,
            transport: &mut self.net,
            rate: &mut self.rate,
        };
        self.ep.update(now, &mut io, params);
    }

    fn receive(&mut self, now: Instant, packet: &[u8]) {
        let mut io = EndpointIo {
            queue: &mut self.queue,
            sink: &mut self.sink,
            transport: &mut self.net,
            rate: &mut self.rate,
        };
        self.ep.receive(now, packet, &mut io);
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        mem::take(&mut self.net.sent)
    }

    fn send_value(&mut self, handle: u64, value: u16) {
        self.queue
            .pending
            .push_back((handle, value, MessageFlags::default()));
    }

    fn values(&self) -> Vec<u16> {
        self.sink.got.iter().map(|&(v, _)| v).collect()
    }
}

fn directory() -> MessageDirectory {
    MessageDirectory::new(8).unwrap()
}

fn deliver(from: &mut Peer, to: &mut Peer, now: Instant) {
    for p in from.drain() {
        to.receive(now, &p);
    }
}

/// One packet per value; returns the packets without delivering them.
fn send_series(peer: &mut Peer, now: Instant, values: &[u16]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    for (i, &v) in values.iter().enumerate() {
        peer.send_value(i as u64 + 1, v);
        peer.update(now);
        let mut sent = peer.drain();
        assert_eq!(sent.len(), 1, "value {v}");
        packets.push(sent.remove(0));
    }
    packets
}

#[test]
fn long_conversation_stays_in_sync() {
    let now = Instant::now();
    let mut a = Peer::new(Config::default());
    let mut b = Peer::new(Config::default());

    for round in 0u16..50 {
        a.send_value(u64::from(round) + 1, round);
        a.update(now);
        deliver(&mut a, &mut b, now);
        b.update(now);
        deliver(&mut b, &mut a, now);
    }
    assert_eq!(a.values(), Vec::<u16>::new());
    assert_eq!(b.values(), (0u16..50).collect::<Vec<_>>());
    assert_eq!(a.queue.acked.len(), 50);
    assert!(a.queue.acked.iter().all(|&(_, ok)| ok));
    assert_eq!(a.ep.fault(), None);
    assert_eq!(b.ep.fault(), None);
    assert_eq!(a.ep.in_flight(), 0);
}

#[test]
fn reorder_buffer_replays_the_held_packet() {
    let now = Instant::now();
    let mut a = Peer::new(Config::default());
    let mut b = Peer::new(Config::default());

    let packets = send_series(&mut a, now, &[10, 11, 12, 13, 14]);

    b.receive(now, &packets[0]);
    b.receive(now, &packets[1]);
    b.receive(now, &packets[2]);
    // Packet 5 arrives before packet 4: parked, not processed.
    b.receive(now, &packets[4]);
    assert_eq!(b.values(), vec![10, 11, 12]);
    assert_eq!(b.ep.stats().packets_queued, 1);

    b.receive(now, &packets[3]);
    assert_eq!(b.values(), vec![10, 11, 12, 13, 14]);
    assert_eq!(b.ep.stats().reorder_replayed, 1);
    assert_eq!(b.ep.fault(), None);
}

#[test]
fn reorder_timeout_nacks_the_gap_end_to_end() {
    let t0 = Instant::now();
    let mut a = Peer::new(Config::default());
    let mut b = Peer::new(Config::default());

    let packets = send_series(&mut a, t0, &[20, 21, 22, 23]);

    b.receive(t0, &packets[0]);
    b.receive(t0, &packets[1]);
    // Packet 3 is lost; packet 4 waits out the reorder timeout.
    b.receive(t0, &packets[3]);
    assert_eq!(b.values(), vec![20, 21]);

    let t1 = t0 + Duration::from_millis(40);
    b.update_with(t1, UpdateParams::default());
    assert_eq!(b.values(), vec![20, 21, 23]);
    assert_eq!(b.ep.stats().reorder_timeouts, 1);
    assert_eq!(b.ep.stats().nacks_synthesized, 1);

    // The synthetic nack reaches A's queue as a loss report.
    deliver(&mut b, &mut a, t1);
    assert_eq!(
        a.queue.acked,
        vec![(1, true), (2, true), (3, false), (4, true)]
    );
}

#[test]
fn duplicate_delivery_is_ignored() {
    let now = Instant::now();
    let mut a = Peer::new(Config::default());
    let mut b = Peer::new(Config::default());

    let packets = send_series(&mut a, now, &[7]);
    b.receive(now, &packets[0]);
    b.receive(now, &packets[0]);
    assert_eq!(b.values(), vec![7]);
    assert_eq!(b.ep.stats().packets_dropped, 1);
    assert_eq!(b.ep.fault(), None);
}

#[test]
fn ack_for_an_unsent_packet_disconnects() {
    let now = Instant::now();
    let mut a = Peer::new(Config::default());

    // Craft a structurally valid packet whose ack stream acknowledges a
    // packet A never sent. Fresh connection state is deterministic, so the
    // coder state here matches what A expects from a real peer.
    let dir = directory();
    let mut pool = statecast_transport::bigstate::BigStatePool::new();
    let mut big = pool.create_initial(&dir, &CipherConfig::Null);
    let mut table = big.current_table;
    let mut out = OutputStream::new(StreamFormat::Arithmetic);
    big.ack_alphabet.write_symbol(&mut out, 1); // ack of "packet 1"
    big.ack_alphabet.write_symbol(&mut out, 3); // end of acks
    let key = 0x5Au8;
    out.write_bits(u32::from(key), 8);
    out.write_bits(0, 32);
    dir.write_id(&mut out, &mut big.msg_alphabet, &mut table, END_OF_STREAM);
    out.write_bits(0, 1);
    out.write_bits(u32::from(key ^ 0xFF), 8);
    let stream = out.finish();

    let cfg = Config::default();
    let mut pkt = Vec::new();
    pkt.push(frame::encode_header(0, false));
    pkt.push(frame::encode_seq_byte(1, cfg.diameter()));
    pkt.extend_from_slice(&stream);
    let hash = frame::quick_hash(&pkt);
    pkt.push(key);
    pkt.push(hash ^ key);

    a.receive(now, &pkt);
    assert_eq!(
        a.ep.fault().map(|e| e.reason),
        Some("ack for a packet never sent")
    );
    assert_eq!(a.ep.state(), ConnectionState::Disconnected);
}

#[test]
fn basis_stepping_backwards_is_dropped_without_fault() {
    let now = Instant::now();
    let mut a = Peer::new(Config::default());
    let mut b = Peer::new(Config::default());

    // Advance B's newest-seen basis to 1: A learns packet 1 was acked and
    // codes packet 2 against it.
    a.send_value(1, 1);
    a.update(now);
    deliver(&mut a, &mut b, now);
    b.update(now);
    deliver(&mut b, &mut a, now);
    a.send_value(2, 2);
    a.update(now);
    deliver(&mut a, &mut b, now);
    assert_eq!(b.values(), vec![1, 2]);

    // Sequence 3 claiming basis 0 steps behind that; it is dropped before
    // any decoding, so the garbage body never matters.
    let before = b.ep.stats().packets_dropped;
    let cfg = Config::default();
    let mut pkt = vec![
        frame::encode_header(2, false),
        frame::encode_seq_byte(3, cfg.diameter()),
    ];
    pkt.extend_from_slice(&[0u8; 12]);
    b.receive(now, &pkt);
    assert_eq!(b.ep.stats().packets_dropped, before + 1);
    assert_eq!(b.ep.fault(), None);
    assert_eq!(b.values(), vec![1, 2]);
}

#[test]
fn reference_to_a_missing_basis_is_dropped_without_fault() {
    let now = Instant::now();
    let mut a = Peer::new(Config::default());
    let mut b = Peer::new(Config::default());

    a.send_value(1, 1);
    a.update(now);
    deliver(&mut a, &mut b, now);
    assert_eq!(b.values(), vec![1]);

    // Sequence 3 claiming basis 2: B never processed packet 2, so that
    // slot holds no snapshot. The sync flag keeps the reorder buffer out
    // of the way.
    let before = b.ep.stats().packets_dropped;
    let cfg = Config::default();
    let mut pkt = vec![
        frame::encode_header(0, true),
        frame::encode_seq_byte(3, cfg.diameter()),
    ];
    pkt.extend_from_slice(&[0u8; 12]);
    b.receive(now, &pkt);
    assert_eq!(b.ep.stats().packets_dropped, before + 1);
    assert_eq!(b.ep.fault(), None);
    assert_eq!(b.values(), vec![1]);
}

#[test]
fn message_cap_disconnects_the_receiver() {
    let now = Instant::now();
    let mut a = Peer::new(Config::default());
    let mut b = Peer::new(Config {
        max_messages_per_packet: 4,
        ..Config::default()
    });

    for i in 1..=5u64 {
        a.send_value(i, i as u16);
    }
    a.update(now);
    deliver(&mut a, &mut b, now);
    assert_eq!(
        b.ep.fault().map(|e| e.reason),
        Some("too many messages in one packet")
    );
}

#[test]
fn sync_packets_bypass_the_reorder_buffer() {
    let now = Instant::now();
    let mut a = Peer::new(Config::default());
    let mut b = Peer::new(Config::default());

    a.send_value(1, 1);
    a.update(now);
    let first = a.drain().remove(0);

    a.queue
        .pending
        .push_back((2, 2, MessageFlags { needs_sync_decode: true, ..MessageFlags::default() }));
    a.update(now);
    let second = a.drain().remove(0);

    // The sync packet arrives first and is processed immediately, nacking
    // the gap instead of waiting for the straggler.
    b.receive(now, &second);
    assert_eq!(b.values(), vec![2]);
    assert!(b.sink.got[0].1.in_sync);
    assert_eq!(b.ep.stats().nacks_synthesized, 1);

    // The straggler is now stale.
    b.receive(now, &first);
    assert_eq!(b.values(), vec![2]);
    assert_eq!(b.ep.fault(), None);
}

#[test]
fn crc8_and_cipher_round_trip() {
    let cfg = Config {
        crc8: true,
        cipher: CipherConfig::XorStream { key: [0x42; 16] },
        ..Config::default()
    };
    let now = Instant::now();
    let mut a = Peer::new(cfg.clone());
    let mut b = Peer::new(cfg);

    for round in 0u16..10 {
        a.send_value(u64::from(round) + 1, round + 100);
        a.update(now);
        deliver(&mut a, &mut b, now);
        b.update(now);
        deliver(&mut b, &mut a, now);
    }
    assert_eq!(b.values(), (100u16..110).collect::<Vec<_>>());
    assert_eq!(a.ep.fault(), None);
    assert_eq!(b.ep.fault(), None);
}

#[test]
fn bit_packed_connection_carries_traffic() {
    let cfg = Config {
        format: StreamFormat::BitPacked,
        ..Config::default()
    };
    let now = Instant::now();
    let mut a = Peer::new(cfg.clone());
    let mut b = Peer::new(cfg);

    for round in 0u16..10 {
        a.send_value(u64::from(round) + 1, round);
        a.update(now);
        deliver(&mut a, &mut b, now);
        b.update(now);
        deliver(&mut b, &mut a, now);
    }
    assert_eq!(b.values(), (0u16..10).collect::<Vec<_>>());
    assert!(a.queue.acked.iter().all(|&(_, ok)| ok));
}

#[test]
fn window_stall_recovers_after_acks_resume() {
    let cfg = Config {
        window: 4,
        ..Config::default()
    };
    let now = Instant::now();
    let mut a = Peer::new(cfg.clone());
    let mut b = Peer::new(cfg);

    // Fill the window without any acks coming back.
    let packets = send_series(&mut a, now, &[1, 2, 3]);
    a.send_value(9, 9);
    a.update(now);
    assert_eq!(a.ep.stats().packets_resent, 1);
    a.drain();

    // Deliver everything; B acks; A resumes with a fresh sequence.
    for p in &packets {
        b.receive(now, p);
    }
    b.update(now);
    deliver(&mut b, &mut a, now);
    assert_eq!(a.ep.in_flight(), 0);
    a.update(now);
    deliver(&mut a, &mut b, now);
    assert_eq!(b.values(), vec![1, 2, 3, 9]);
}
