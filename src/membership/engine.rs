use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::membership::listener::{ListenerSet, MemberListener};
use crate::membership::member::{
    refuted_generation, Health, Member, MemberAddress, Service,
};
use crate::membership::registry::{MemberChange, MemberRegistry};
use crate::membership::wire::{self, DatagramWriter, MessageKind, Overflow};

/// One logical tick is 100ms of wall time in production.
pub(crate) const TICK_MS: u64 = 100;

/// Protocol timing knobs, in milliseconds. Converted to ticks internally;
/// values below one tick round up to a single tick.
#[derive(Debug, Clone)]
pub struct GossiperOptions {
    /// How often a new probe round starts.
    pub protocol_period_ms: u64,
    /// How long a direct ping to a known member may go unacknowledged.
    pub ping_timeout_ms: u64,
    /// How long the relayed probe may go unacknowledged before the target
    /// is marked dead.
    pub indirect_ping_timeout_ms: u64,
    /// How long a dead entry lingers before being pruned.
    pub death_timeout_ms: u64,
    /// Members probed per protocol period.
    pub fanout_factor: usize,
    /// Relays asked to probe an unresponsive member on our behalf.
    pub indirect_endpoints: usize,
}

impl Default for GossiperOptions {
    fn default() -> Self {
        Self {
            protocol_period_ms: 1000,
            ping_timeout_ms: 200,
            indirect_ping_timeout_ms: 400,
            death_timeout_ms: 60_000,
            fanout_factor: 3,
            indirect_endpoints: 3,
        }
    }
}

fn ticks(ms: u64) -> u32 {
    ms.div_ceil(TICK_MS).max(1) as u32
}

/// A datagram the engine wants on the wire.
#[derive(Debug, Clone)]
pub struct OutboundDatagram {
    pub target: MemberAddress,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutKind {
    /// Direct ping sent, waiting for any word back.
    DirectAck,
    /// Relays asked to probe, waiting for a forwarded ack.
    IndirectAck,
    /// Entry is dead; prune it if nothing changes.
    Death,
}

/// At most one of these exists per address; scheduling over an existing one
/// is a no-op, and any inbound datagram from the address clears it.
struct PendingTimeout {
    kind: TimeoutKind,
    ticks_remaining: u32,
    /// Member state captured when the timer was armed. Timeout handlers merge
    /// against this snapshot rather than the live entry, so a member that
    /// refuted in the meantime is not dragged back down.
    snapshot: Member,
}

/// Membership state machine. No sockets, no tasks, no real clocks.
///
/// Driven by two inputs:
///   - `step(src, payload)` — a datagram arrived from the network
///   - `tick()`             — one unit of logical time passed (100ms)
///
/// Outbound datagrams are buffered; drain with `take_outbound()` after every
/// `step()` or `tick()`.
///
/// # Probe lifecycle for one member
///
/// ```text
///   tick: protocol period elapses, member drawn in the probe round
///   └─ Ping sent, DirectAck timer armed
///            │  step: anything arrives from them → timer cleared, done
///            │
///            │  tick: ping timeout elapses
///            │  └─ merge SUSPICIOUS, PingRequest to relays,
///            │     IndirectAck timer armed
///            │       step: ForwardedAck names them → timer cleared
///            │
///            │  tick: indirect timeout elapses
///            │  └─ merge DEAD, Death timer armed
///            │
///            ▼  tick: death timeout elapses
///   entry pruned — but only if still equal to the dead snapshot;
///   any change in between (a refutation, say) keeps it
/// ```
pub struct Gossip {
    local_address: MemberAddress,
    generation: u8,
    service: Service,

    registry: MemberRegistry,
    listeners: ListenerSet,

    waiting: HashMap<MemberAddress, PendingTimeout>,
    protocol_elapsed: u32,

    protocol_period_ticks: u32,
    ping_timeout_ticks: u32,
    indirect_ping_timeout_ticks: u32,
    death_timeout_ticks: u32,
    fanout_factor: usize,
    indirect_endpoints: usize,

    pending_outbound: Vec<OutboundDatagram>,
    rng: StdRng,
}

impl Gossip {
    pub fn new(local_address: MemberAddress, service: Service, options: &GossiperOptions) -> Self {
        Self {
            local_address,
            generation: 0,
            service,
            registry: MemberRegistry::new(),
            listeners: ListenerSet::new(),
            waiting: HashMap::new(),
            protocol_elapsed: 0,
            protocol_period_ticks: ticks(options.protocol_period_ms),
            ping_timeout_ticks: ticks(options.ping_timeout_ms),
            indirect_ping_timeout_ticks: ticks(options.indirect_ping_timeout_ms),
            death_timeout_ticks: ticks(options.death_timeout_ms),
            fanout_factor: options.fanout_factor,
            indirect_endpoints: options.indirect_endpoints,
            pending_outbound: vec![],
            rng: StdRng::from_entropy(),
        }
    }

    pub fn local_address(&self) -> MemberAddress {
        self.local_address
    }

    pub fn add_listener(&mut self, key: String, listener: Box<dyn MemberListener>) {
        self.listeners.insert(key, listener);
    }

    pub fn remove_listener(&mut self, key: &str) {
        self.listeners.remove(key);
    }

    /// Seed ping to an address we may know nothing about.
    pub fn connect_to(&mut self, seed: MemberAddress) {
        info!(%seed, "connecting to seed");
        self.ping(seed);
    }

    pub fn tick(&mut self) {
        // Age every pending timer; fire the expired ones.
        let mut expired: Vec<MemberAddress> = vec![];
        for (addr, pending) in self.waiting.iter_mut() {
            pending.ticks_remaining -= 1;
            if pending.ticks_remaining == 0 {
                expired.push(*addr);
            }
        }

        for addr in expired {
            if let Some(pending) = self.waiting.remove(&addr) {
                match pending.kind {
                    TimeoutKind::DirectAck => self.on_ack_timeout(addr, pending.snapshot),
                    TimeoutKind::IndirectAck => self.on_indirect_timeout(addr, pending.snapshot),
                    TimeoutKind::Death => self.on_death_timeout(addr, pending.snapshot),
                }
            }
        }

        self.protocol_elapsed += 1;
        if self.protocol_elapsed >= self.protocol_period_ticks {
            self.protocol_elapsed = 0;
            self.start_probe_round();
        }
    }

    pub fn step(&mut self, src: MemberAddress, payload: &[u8]) {
        let envelope = match wire::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%src, %err, "dropping undecodable datagram");
                return;
            }
        };

        // If we were waiting to hear from them - here they are.
        self.waiting.remove(&src);

        // A datagram from them is direct proof of life at their claimed
        // generation, events notwithstanding.
        if src != self.local_address {
            let sender = Member::new(
                Health::Alive,
                envelope.sender_generation,
                Some(envelope.sender_service),
            );
            self.apply(None, src, |m| {
                Some(match m {
                    Some(mine) => mine.merge(&sender),
                    None => sender.clone(),
                })
            });
        }

        // What they believe about us; a negative belief gets refuted by
        // out-claiming its generation on every subsequent header.
        if matches!(envelope.receiver_health, Health::Suspicious | Health::Dead) {
            self.refute(envelope.receiver_generation);
        }

        for event in &envelope.events {
            if event.address == self.local_address {
                // Never an entry for ourselves; a negative rumor only bumps
                // our generation.
                if matches!(event.health, Health::Suspicious | Health::Dead) {
                    self.refute(event.generation);
                }
                continue;
            }
            let rumor = Member::new(event.health, event.generation, event.service);
            self.apply(Some(src), event.address, |m| match m {
                Some(mine) => Some(mine.merge(&rumor)),
                // First sightings only enter alive or suspicious; a dead or
                // left rumor about a stranger would just be gossiped forever.
                None if matches!(rumor.health, Health::Alive | Health::Suspicious) => {
                    Some(rumor.clone())
                }
                None => None,
            });
        }

        match envelope.kind {
            MessageKind::Ping => {
                self.send_datagram(src, MessageKind::Ack, None);
            }
            MessageKind::Ack => {}
            // We are the relay: probe the target on the prober's behalf.
            MessageKind::PingRequest => {
                if let Some(target) = envelope.carried {
                    self.send_datagram(target, MessageKind::ForwardedPing, Some(src));
                }
            }
            // We are the target: hand our ack to the relay for delivery.
            MessageKind::ForwardedPing => {
                if let Some(origin) = envelope.carried {
                    self.send_datagram(src, MessageKind::AckRequest, Some(origin));
                }
            }
            // We are the relay again: the target answered, tell the prober.
            MessageKind::AckRequest => {
                if let Some(origin) = envelope.carried {
                    self.send_datagram(origin, MessageKind::ForwardedAck, Some(src));
                }
            }
            // We are the prober: the target is reachable after all.
            MessageKind::ForwardedAck => {
                if let Some(target) = envelope.carried {
                    self.waiting.remove(&target);
                }
            }
        }
    }

    /// Drain the datagrams buffered since the last call.
    pub fn take_outbound(&mut self) -> Vec<OutboundDatagram> {
        std::mem::take(&mut self.pending_outbound)
    }

    fn start_probe_round(&mut self) {
        let targets = self
            .registry
            .random_peers(self.fanout_factor, None, &mut self.rng);
        for target in targets {
            self.ping(target);
        }
    }

    fn ping(&mut self, target: MemberAddress) {
        self.send_datagram(target, MessageKind::Ping, None);

        let (snapshot, timeout_ticks) = match self.registry.get(&target) {
            Some(member) => (member.clone(), self.ping_timeout_ticks),
            None => {
                // Placeholder so the timer chain has an entry to work on. An
                // address we have never heard from gets a whole protocol
                // period to answer.
                let placeholder = Member::placeholder();
                self.apply(None, target, |_| Some(placeholder.clone()));
                (placeholder, self.protocol_period_ticks)
            }
        };
        self.schedule(target, TimeoutKind::DirectAck, timeout_ticks, snapshot);
    }

    fn on_ack_timeout(&mut self, target: MemberAddress, snapshot: Member) {
        let suspicious = snapshot.with_health(Health::Suspicious);
        self.apply(None, target, |m| m.map(|mine| mine.merge(&suspicious)));

        let relays = self
            .registry
            .random_peers(self.indirect_endpoints, Some(target), &mut self.rng);
        for relay in relays {
            self.send_datagram(relay, MessageKind::PingRequest, Some(target));
        }

        // Armed even with no relays available: the target still gets the
        // indirect window to show up on its own before being marked dead.
        self.schedule(
            target,
            TimeoutKind::IndirectAck,
            self.indirect_ping_timeout_ticks,
            snapshot,
        );
    }

    fn on_indirect_timeout(&mut self, target: MemberAddress, snapshot: Member) {
        let dead = snapshot.with_health(Health::Dead);
        self.apply(None, target, |m| m.map(|mine| mine.merge(&dead)));

        // The prune check compares against the state as of now; any change
        // during the death window keeps the entry.
        if let Some(current) = self.registry.get(&target).cloned() {
            self.schedule(target, TimeoutKind::Death, self.death_timeout_ticks, current);
        }
    }

    fn on_death_timeout(&mut self, target: MemberAddress, snapshot: Member) {
        self.apply(None, target, |m| match m {
            Some(current) if *current == snapshot => None,
            other => other.cloned(),
        });
    }

    fn refute(&mut self, rumored: u8) {
        let claimed = refuted_generation(self.generation, rumored);
        if claimed != self.generation {
            info!(
                old = self.generation,
                new = claimed,
                "refuting rumor of own demise"
            );
            self.generation = claimed;
        }
    }

    fn schedule(
        &mut self,
        address: MemberAddress,
        kind: TimeoutKind,
        timeout_ticks: u32,
        snapshot: Member,
    ) {
        if let Entry::Vacant(entry) = self.waiting.entry(address) {
            entry.insert(PendingTimeout {
                kind,
                ticks_remaining: timeout_ticks,
                snapshot,
            });
        }
    }

    fn apply<F>(
        &mut self,
        from: Option<MemberAddress>,
        address: MemberAddress,
        update: F,
    ) -> Option<MemberChange>
    where
        F: FnOnce(Option<&Member>) -> Option<Member>,
    {
        let change = self.registry.apply(address, update)?;
        match &change.new {
            Some(member) => debug!(%address, state = %member, "member updated"),
            None => debug!(%address, "member pruned"),
        }
        self.listeners.notify(from, &change);
        Some(change)
    }

    fn send_datagram(
        &mut self,
        recipient: MemberAddress,
        kind: MessageKind,
        carried: Option<MemberAddress>,
    ) {
        let mut writer = DatagramWriter::new();
        let header = writer.write_header(
            kind,
            carried,
            self.generation,
            self.service,
            self.registry.get(&recipient),
        );
        if header.is_err() {
            // Unreachable on a fresh writer; drop rather than send garbage.
            return;
        }

        let mut included: Vec<MemberAddress> = vec![];
        for (address, member) in self.registry.gossip_order(recipient) {
            match writer.write_event(address, &member) {
                Ok(()) => included.push(address),
                Err(Overflow) => break,
            }
        }
        for address in &included {
            self.registry.note_mentioned(address);
        }

        debug!(%recipient, ?kind, rumors = included.len(), "queueing datagram");
        self.pending_outbound.push(OutboundDatagram {
            target: recipient,
            payload: writer.finish(),
        });
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u8 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &MemberRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn is_waiting_on(&self, address: &MemberAddress) -> bool {
        self.waiting.contains_key(address)
    }
}
