//! Deterministic lossy-link simulation for the transport engine.
//!
//! Everything here is seeded: the same `LinkConfig` always produces the
//! same packet fates, so a failing scenario replays exactly. The harness
//! drives two endpoints in fixed time steps through a [`LossyLink`] that
//! drops, duplicates and reorders datagrams, with a resending queue on top
//! so nack reports turn into retransmitted messages.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use statecast_transport::{
    Config, DispatchResult, Endpoint, EndpointIo, FillResult, MessageDirectory, MessageEnv,
    MessageFlags, MessageId, MessageQueue, MessageSink, PacketWriter, RateControl,
    SendableHandle, Transport, UpdateParams,
};

pub const MSG_STATE: MessageId = MessageId(1);

/// Packet fates on the simulated link, all probabilities in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub loss: f64,
    pub duplicate: f64,
    /// Chance a delivery swaps with the datagram behind it.
    pub reorder: f64,
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            seed: 0,
        }
    }
}

/// One direction of the simulated link.
pub struct LossyLink {
    cfg: LinkConfig,
    rng: StdRng,
    /// A datagram held back so it lands behind a newer one.
    held: Option<Vec<u8>>,
    pub dropped: u64,
    pub duplicated: u64,
    pub delayed: u64,
}

impl LossyLink {
    pub fn new(cfg: LinkConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self {
            cfg,
            rng,
            held: None,
            dropped: 0,
            duplicated: 0,
            delayed: 0,
        }
    }

    /// Apply the link's fates to a batch of datagrams.
    pub fn disturb(&mut self, packets: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = Vec::with_capacity(packets.len());
        for p in packets {
            if self.rng.gen_bool(self.cfg.loss) {
                self.dropped += 1;
                continue;
            }
            if self.rng.gen_bool(self.cfg.duplicate) {
                self.duplicated += 1;
                out.push(p.clone());
            }
            if self.held.is_none() && self.rng.gen_bool(self.cfg.reorder) {
                self.delayed += 1;
                self.held = Some(p);
                continue;
            }
            out.push(p);
        }
        // A held datagram is only released behind a newer one.
        if !out.is_empty() {
            if let Some(h) = self.held.take() {
                out.push(h);
            }
        }
        out
    }
}

/// Outgoing store that retransmits on nack: every state value keeps its
/// payload until the carrying packet is acknowledged, and goes back to the
/// front of the line when that packet is reported lost.
#[derive(Default)]
pub struct ResendQueue {
    next_handle: u64,
    pending: VecDeque<(SendableHandle, u16)>,
    in_flight: HashMap<u64, u16>,
    pub delivered: u64,
    pub retransmitted: u64,
}

impl ResendQueue {
    pub fn push(&mut self, value: u16) {
        self.next_handle += 1;
        self.pending
            .push_back((SendableHandle(self.next_handle), value));
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }
}

impl MessageQueue for ResendQueue {
    fn build_packet(&mut self, w: &mut PacketWriter<'_>, _budget: usize) -> FillResult {
        while let Some(&(h, v)) = self.pending.front() {
            if !w.begin_message(MSG_STATE, h, MessageFlags::default()) {
                break;
            }
            w.write_bits(u32::from(v), 16);
            self.in_flight.insert(h.0, v);
            self.pending.pop_front();
        }
        FillResult::Ok
    }

    fn ack_messages(&mut self, handles: &[SendableHandle], _seq: u32, ok: bool, force: bool) {
        for h in handles {
            match self.in_flight.remove(&h.0) {
                Some(v) if !ok && !force => {
                    debug!(value = v, "retransmitting nacked message");
                    self.retransmitted += 1;
                    self.pending.push_front((*h, v));
                }
                Some(_) => self.delivered += 1,
                None => {}
            }
        }
        if force {
            self.pending.clear();
            self.in_flight.clear();
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub values: Vec<u16>,
    pub envs: Vec<MessageEnv>,
}

impl MessageSink for RecordingSink {
    fn dispatch(
        &mut self,
        id: MessageId,
        stream: &mut statecast_transport::codec::InputStream<'_>,
        env: &MessageEnv,
    ) -> DispatchResult {
        debug_assert_eq!(id, MSG_STATE);
        self.values.push(stream.read_bits(16) as u16);
        self.envs.push(*env);
        DispatchResult::Accepted {
            blocks_state_change: false,
        }
    }
}

#[derive(Default)]
pub struct Outbox {
    pub sent: Vec<Vec<u8>>,
}

impl Transport for Outbox {
    fn send(&mut self, packet: &[u8]) {
        self.sent.push(packet.to_vec());
    }
}

/// Fixed-budget rate policy, enough for simulation.
pub struct FixedRate {
    pub max: usize,
}

impl Default for FixedRate {
    fn default() -> Self {
        Self { max: 1200 }
    }
}

impl RateControl for FixedRate {
    fn max_packet_size(&self) -> usize {
        self.max
    }
    fn ideal_packet_size(&mut self, _age_ms: u32, _idle: bool, max: usize) -> usize {
        max
    }
}

pub struct SimPeer {
    pub endpoint: Endpoint,
    pub queue: ResendQueue,
    pub sink: RecordingSink,
    pub outbox: Outbox,
    pub rate: FixedRate,
}

impl SimPeer {
    pub fn new(cfg: Config) -> Result<Self> {
        let directory = MessageDirectory::new(8)?;
        Ok(Self {
            endpoint: Endpoint::new(cfg, directory)?,
            queue: ResendQueue::default(),
            sink: RecordingSink::default(),
            outbox: Outbox::default(),
            rate: FixedRate::default(),
        })
    }

    pub fn update(&mut self, now: Instant, params: UpdateParams) {
        let mut io = EndpointIo {
            queue: &mut self.queue,
            sink: &mut self.sink,
            transport: &mut self.outbox,
            rate: &mut self.rate,
        };
        self.endpoint.update(now, &mut io, params);
    }

    pub fn receive_all(&mut self, now: Instant, packets: &[Vec<u8>]) {
        for p in packets {
            let mut io = EndpointIo {
                queue: &mut self.queue,
                sink: &mut self.sink,
                transport: &mut self.outbox,
                rate: &mut self.rate,
            };
            self.endpoint.receive(now, p, &mut io);
        }
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        mem::take(&mut self.outbox.sent)
    }
}

/// Two peers, one lossy link per direction, fixed-step clock.
pub struct Scenario {
    pub a: SimPeer,
    pub b: SimPeer,
    pub a_to_b: LossyLink,
    pub b_to_a: LossyLink,
    pub step: Duration,
    now: Instant,
}

impl Scenario {
    pub fn new(cfg: Config, link: LinkConfig) -> Result<Self> {
        let mut fwd = link.clone();
        let mut rev = link;
        fwd.seed = fwd.seed.wrapping_mul(2).wrapping_add(1);
        rev.seed = rev.seed.wrapping_mul(2).wrapping_add(2);
        Ok(Self {
            a: SimPeer::new(cfg.clone())?,
            b: SimPeer::new(cfg)?,
            a_to_b: LossyLink::new(fwd),
            b_to_a: LossyLink::new(rev),
            step: Duration::from_millis(16),
            now: Instant::now(),
        })
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// One tick: both peers update, then both directions deliver. Sends
    /// are forced so idle keepalives keep flowing; without them a lost
    /// tail packet would never be noticed by either side.
    pub fn tick(&mut self) {
        self.now += self.step;
        let params = UpdateParams {
            force: true,
            ..UpdateParams::default()
        };
        self.a.update(self.now, params);
        self.b.update(self.now, params);
        let fwd = self.a_to_b.disturb(self.a.drain());
        let rev = self.b_to_a.disturb(self.b.drain());
        self.b.receive_all(self.now, &fwd);
        self.a.receive_all(self.now, &rev);
    }

    /// Run until A's queue drains and B has acknowledged everything, or
    /// the tick budget runs out.
    pub fn run_until_settled(&mut self, max_ticks: u32) -> Result<()> {
        for _ in 0..max_ticks {
            self.tick();
            ensure!(
                self.a.endpoint.fault().is_none(),
                "peer A faulted: {:?}",
                self.a.endpoint.fault()
            );
            ensure!(
                self.b.endpoint.fault().is_none(),
                "peer B faulted: {:?}",
                self.b.endpoint.fault()
            );
            // A keepalive is always freshly in flight, so one unacked
            // packet still counts as settled.
            if self.a.queue.outstanding() == 0 && self.a.endpoint.in_flight() <= 1 {
                return Ok(());
            }
        }
        // One forced flush of whatever acks remain.
        self.tick();
        ensure!(
            self.a.queue.outstanding() == 0,
            "undelivered messages after {max_ticks} ticks: {}",
            self.a.queue.outstanding()
        );
        Ok(())
    }
}
