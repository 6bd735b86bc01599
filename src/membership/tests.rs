//! Actor-level tests: the engine driven through its channels the way the
//! transport would, plus multi-node exchanges with hand-delivered datagrams.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time;

use super::actor::{EngineActor, EngineEvent};
use super::engine::{Gossip, GossiperOptions, OutboundDatagram};
use super::member::{Health, Member, MemberAddress, Service};
use super::wire::{decode, DatagramWriter, MessageKind};

fn addr(last_octet: u8, port: u16) -> MemberAddress {
    MemberAddress::new(Ipv4Addr::new(127, 0, 0, last_octet), port)
}

fn service() -> Service {
    Service { id: 1, port: 9000 }
}

/// Spawns an engine actor for `local` and returns its channels: send faked
/// network events in, catch outbound datagrams.
fn setup(
    local: MemberAddress,
) -> (
    mpsc::Sender<EngineEvent>,
    mpsc::Receiver<OutboundDatagram>,
) {
    let (tx_in, rx_in) = mpsc::channel(100);
    let (tx_out, rx_out) = mpsc::channel(100);

    let engine = Gossip::new(local, service(), &GossiperOptions::default());
    tokio::spawn(EngineActor::new(engine, rx_in, tx_out).run());

    (tx_in, rx_out)
}

/// Builds a datagram as a remote peer would.
fn datagram(
    kind: MessageKind,
    carried: Option<MemberAddress>,
    sender_generation: u8,
    belief: Option<&Member>,
    events: &[(MemberAddress, Member)],
) -> Bytes {
    let mut w = DatagramWriter::new();
    w.write_header(kind, carried, sender_generation, service(), belief)
        .unwrap();
    for (a, m) in events {
        w.write_event(*a, m).unwrap();
    }
    w.finish()
}

fn ping_from(sender_generation: u8) -> Bytes {
    datagram(MessageKind::Ping, None, sender_generation, None, &[])
}

async fn next_outbound(rx: &mut mpsc::Receiver<OutboundDatagram>) -> OutboundDatagram {
    time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out waiting for an outbound datagram")
        .expect("outbound channel closed")
}

/// Skips outbound traffic until a datagram of the wanted kind appears.
async fn next_of_kind(
    rx: &mut mpsc::Receiver<OutboundDatagram>,
    kind: MessageKind,
) -> OutboundDatagram {
    loop {
        let out = next_outbound(rx).await;
        if decode(&out.payload).unwrap().kind == kind {
            return out;
        }
    }
}

async fn deliver(tx: &mpsc::Sender<EngineEvent>, src: MemberAddress, payload: Bytes) {
    tx.send(EngineEvent::Datagram { src, payload })
        .await
        .unwrap();
}

async fn ticks(tx: &mpsc::Sender<EngineEvent>, count: u32) {
    for _ in 0..count {
        tx.send(EngineEvent::Tick).await.unwrap();
    }
}

#[tokio::test]
async fn test_ping_response() {
    let (tx, mut rx) = setup(addr(1, 8000));
    let remote = addr(1, 9000);

    deliver(&tx, remote, ping_from(0)).await;

    let response = next_outbound(&mut rx).await;
    assert_eq!(response.target, remote);
    assert_eq!(decode(&response.payload).unwrap().kind, MessageKind::Ack);
}

#[tokio::test]
async fn test_refutation_mechanism() {
    let (tx, mut rx) = setup(addr(1, 8000));
    let remote = addr(1, 9000);

    // The sender claims WE are suspicious at our current generation (0).
    let lie = Member::new(Health::Suspicious, 0, None);
    deliver(
        &tx,
        remote,
        datagram(MessageKind::Ping, None, 0, Some(&lie), &[]),
    )
    .await;

    // The ack must already carry the bumped generation.
    let response = next_of_kind(&mut rx, MessageKind::Ack).await;
    assert_eq!(
        decode(&response.payload).unwrap().sender_generation,
        1,
        "engine did not bump its generation to refute the suspicion"
    );
}

#[tokio::test]
async fn test_rumor_propagation() {
    let (tx, mut rx) = setup(addr(1, 8000));
    let informant = addr(1, 9000);
    let subject = addr(1, 9999);

    // Learn about the subject from one peer...
    let events = [(subject, Member::new(Health::Alive, 5, None))];
    deliver(
        &tx,
        informant,
        datagram(MessageKind::Ping, None, 0, None, &events),
    )
    .await;
    let _ = next_of_kind(&mut rx, MessageKind::Ack).await;

    // ...and gossip it to the next one that pings us.
    let prober = addr(1, 8001);
    deliver(&tx, prober, ping_from(0)).await;

    let response = next_of_kind(&mut rx, MessageKind::Ack).await;
    assert_eq!(response.target, prober);
    let env = decode(&response.payload).unwrap();
    let rumor = env
        .events
        .iter()
        .find(|e| e.address == subject)
        .expect("subject was not gossiped onward");
    assert_eq!(rumor.health, Health::Alive);
    assert_eq!(rumor.generation, 5);
}

#[tokio::test]
async fn test_indirect_probe_trigger() {
    // Tick -> Ping -> timeout -> PingRequest through the other peer.
    let (tx, mut rx) = setup(addr(1, 8000));
    let peer_1 = addr(1, 9001);
    let peer_2 = addr(1, 9002);

    let events = [(peer_2, Member::new(Health::Alive, 1, None))];
    deliver(
        &tx,
        peer_1,
        datagram(MessageKind::Ping, None, 1, None, &events),
    )
    .await;
    let _ = next_of_kind(&mut rx, MessageKind::Ack).await;

    // A full protocol period starts the probe round.
    ticks(&tx, 10).await;
    let probe = next_of_kind(&mut rx, MessageKind::Ping).await;
    assert!([peer_1, peer_2].contains(&probe.target));

    // Nobody acks; the direct window lapses.
    ticks(&tx, 2).await;
    let request = next_of_kind(&mut rx, MessageKind::PingRequest).await;
    let env = decode(&request.payload).unwrap();
    let target = env.carried.unwrap();
    assert!([peer_1, peer_2].contains(&target));
    assert!([peer_1, peer_2].contains(&request.target));
    assert_ne!(request.target, target, "relay must differ from the target");
}

#[tokio::test]
async fn test_seed_bootstrap_converges_via_refutation() {
    // A seeds from B. The placeholder has B dead at generation 0, and an
    // ack at the same generation could not beat it. The seed ping's belief
    // header says exactly that, so B refutes on the spot and its very first
    // ack carries generation 1, which flips the placeholder to alive.
    let a_local = addr(1, 7001);
    let b_local = addr(1, 7002);
    let (a_tx, mut a_rx) = setup(a_local);
    let (b_tx, mut b_rx) = setup(b_local);

    let (changes_tx, mut changes_rx) = mpsc::channel(100);
    let listener = Box::new(
        move |_from: Option<MemberAddress>,
              address: MemberAddress,
              new: Option<&Member>,
              _old: Option<&Member>| {
            let _ = changes_tx.try_send((address, new.cloned()));
        },
    );
    a_tx.send(EngineEvent::AddListener {
        key: "test".into(),
        listener,
    })
    .await
    .unwrap();

    a_tx.send(EngineEvent::ConnectTo(b_local)).await.unwrap();

    // Seed ping over, ack back.
    let ping = next_of_kind(&mut a_rx, MessageKind::Ping).await;
    deliver(&b_tx, a_local, ping.payload).await;
    let ack = next_of_kind(&mut b_rx, MessageKind::Ack).await;
    assert_eq!(decode(&ack.payload).unwrap().sender_generation, 1);
    deliver(&a_tx, b_local, ack.payload).await;

    let alive = time::timeout(Duration::from_secs(1), async {
        loop {
            let (address, member) = changes_rx.recv().await.expect("listener channel closed");
            if address == b_local {
                if let Some(member) = member {
                    if member.health == Health::Alive {
                        return member;
                    }
                }
            }
        }
    })
    .await
    .expect("seed never became alive");

    assert_eq!(alive.generation, 1);
    assert_eq!(alive.service, Some(service()));
}

/// Three pure state machines wired by hand: prober P, relay R, target T.
/// Deterministic, no tasks, no clocks.
#[test]
fn relay_round_trip_keeps_target_alive() {
    let pa = addr(1, 7001);
    let ra = addr(1, 7002);
    let ta = addr(1, 7003);

    let options = GossiperOptions::default();
    let mut p = Gossip::new(pa, service(), &options);
    let mut r = Gossip::new(ra, service(), &options);
    let mut t = Gossip::new(ta, service(), &options);

    // Datagrams addressed to `target`; everything else is dropped on the
    // floor, which doubles as the lossy network.
    fn take_for(engine: &mut Gossip, target: MemberAddress) -> Vec<Bytes> {
        engine
            .take_outbound()
            .into_iter()
            .filter(|d| d.target == target)
            .map(|d| d.payload)
            .collect()
    }

    // R and T introduce themselves to P.
    r.connect_to(pa);
    for payload in take_for(&mut r, pa) {
        p.step(ra, &payload);
    }
    t.connect_to(pa);
    for payload in take_for(&mut t, pa) {
        p.step(ta, &payload);
    }
    let _ = p.take_outbound();

    // Probe round: P pings both. Only R's ping gets through.
    for _ in 0..10 {
        p.tick();
    }
    for payload in take_for(&mut p, ra) {
        r.step(pa, &payload);
    }
    for payload in take_for(&mut r, pa) {
        p.step(ra, &payload);
    }

    // T's direct window lapses: suspicious, and R is asked to step in.
    for _ in 0..2 {
        p.tick();
    }
    assert_eq!(p.registry().get(&ta).unwrap().health, Health::Suspicious);
    let requests = take_for(&mut p, ra);
    assert!(!requests.is_empty(), "no ping request went to the relay");

    // PingRequest -> ForwardedPing -> AckRequest -> ForwardedAck.
    for payload in requests {
        r.step(pa, &payload);
    }
    for payload in take_for(&mut r, ta) {
        t.step(ra, &payload);
    }
    for payload in take_for(&mut t, ra) {
        r.step(ta, &payload);
    }
    for payload in take_for(&mut r, pa) {
        p.step(ra, &payload);
    }

    assert!(
        !p.is_waiting_on(&ta),
        "forwarded ack should cancel the prober's timer"
    );

    // The indirect window passes without T being declared dead.
    for _ in 0..4 {
        p.tick();
    }
    assert_ne!(p.registry().get(&ta).unwrap().health, Health::Dead);
}
