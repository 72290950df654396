//! End-to-end tests over a simulated three-node chain.
//!
//! Topology is a line, A - B - C, where B is the only relay and the edges
//! cannot hear each other. Everything a real deployment does in sequence
//! is exercised here: announce flooding, path caching, datagram
//! forwarding, reply correlation and end-to-end signature checks.

use std::cell::Cell;
use std::rc::Rc;

use thicket_core::simulation::{RadioBus, SeededRandom, SharedClock, SimRadio, SimRtc};
use thicket_core::{
    AnnounceFilter, AnnounceMeta, Destination, EdgeRouting, LocalIdentity, MeshEvent, MillisClock,
    Node, Packet, PacketHash, PacketType, Radio, RelayRouting, RoutingStrategy,
};

const STEP_MS: u32 = 25;
const EPOCH: u32 = 1_700_000_000;

type Edge = Node<SimRadio, SharedClock, EdgeRouting>;
type Relay = Node<SimRadio, SharedClock, RelayRouting>;

fn edge(bus: &RadioBus, clock: &SharedClock, seed: u8, sim_id: u8) -> Edge {
    Node::new(
        bus.endpoint(),
        clock.clone(),
        LocalIdentity::from_seed([seed; 32]),
        EdgeRouting::new(),
    )
    .with_rtc(SimRtc::new(clock.clone(), EPOCH))
    .with_rng(SeededRandom::new(u64::from(seed)))
    .with_sim_id(sim_id)
}

fn relay(bus: &RadioBus, clock: &SharedClock, seed: u8, sim_id: u8) -> Relay {
    let identity = LocalIdentity::from_seed([seed; 32]);
    let strategy = RelayRouting::new(&identity);
    Node::new(bus.endpoint(), clock.clone(), identity, strategy)
        .with_rtc(SimRtc::new(clock.clone(), EPOCH))
        .with_rng(SeededRandom::new(u64::from(seed)))
        .with_sim_id(sim_id)
}

/// A as endpoint 0, relay B as endpoint 1, C as endpoint 2, linked in a
/// line so that A and C only reach each other through B.
fn line3() -> (SharedClock, RadioBus, Edge, Relay, Edge) {
    let clock = SharedClock::new();
    let bus = RadioBus::new(clock.clone());
    let a = edge(&bus, &clock, 1, 1);
    let b = relay(&bus, &clock, 2, 2);
    let c = edge(&bus, &clock, 3, 3);
    bus.connect(0, 1);
    bus.connect(1, 2);
    (clock, bus, a, b, c)
}

fn run(clock: &SharedClock, ms: u32, mut tick_all: impl FnMut()) {
    let mut elapsed = 0;
    while elapsed < ms {
        clock.advance(STEP_MS);
        elapsed += STEP_MS;
        tick_all();
    }
}

fn drain<R: Radio, C: MillisClock, S: RoutingStrategy>(node: &mut Node<R, C, S>) -> Vec<MeshEvent> {
    let mut events = Vec::new();
    while let Some(ev) = node.poll_event() {
        events.push(ev);
    }
    events
}

/// Announce the gateway at A and wait for the flood to cross the relay.
fn discover(clock: &SharedClock, a: &mut Edge, b: &mut Relay, c: &mut Edge) -> Destination {
    let a_dest = a.announce_destination();
    let handle = a.create_announce(b"gateway").expect("create announce");
    a.send_announce(handle, 1, 0, 30);
    run(clock, 12_000, || {
        a.tick();
        b.tick();
        c.tick();
    });
    assert!(c.has_path_to(&a_dest), "flood must reach the far edge");
    a_dest
}

/// Wire frame of a signed reply, with a leading simulated-sender byte.
fn signed_reply_frame(
    signer: &LocalIdentity,
    hash: &PacketHash,
    data: &[u8],
    sim_from: u8,
) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(hash);
    message.extend_from_slice(signer.identity().as_bytes());
    message.extend_from_slice(data);
    let signature = signer.sign(&message);

    let mut packet = Packet::new(PacketType::ReplySigned);
    packet.destination = Destination::from_bytes(*hash);
    let mut payload = signature.to_vec();
    payload.extend_from_slice(data);
    packet.set_payload(&payload).expect("reply payload");

    let mut frame = vec![sim_from];
    packet.to_wire(&mut frame);
    frame
}

#[test]
fn announce_floods_across_the_relay() {
    let (clock, _bus, mut a, mut b, mut c) = line3();
    let a_dest = a.announce_destination();

    let handle = a.create_announce(b"gateway").expect("create announce");
    a.send_announce(handle, 1, 0, 30);
    assert!(a.awaiting_announce_confirm());

    run(&clock, 12_000, || {
        a.tick();
        b.tick();
        c.tick();
    });

    assert!(b.has_path_to(&a_dest));
    assert!(c.has_path_to(&a_dest));
    assert_eq!(b.stats().mesh.announces_rebroadcast, 1);

    // the rebroadcast echoed back to A doubles as its delivery confirmation
    assert!(!a.awaiting_announce_confirm());
    assert_eq!(a.stats().dispatcher.packets_sent, 1);

    let events = drain(&mut c);
    let announce = events
        .iter()
        .find_map(|ev| match ev {
            MeshEvent::Announce {
                destination,
                identity,
                hops,
                app_data,
            } => Some((*destination, *identity, *hops, app_data.clone())),
            _ => None,
        })
        .expect("announce event at the far edge");
    assert_eq!(announce.0, a_dest);
    assert_eq!(announce.1, a.identity());
    assert_eq!(announce.2, 2, "one hop to the relay, one to the edge");
    assert_eq!(announce.3, b"gateway");
}

#[test]
fn datagram_forwards_along_the_cached_path() {
    let (clock, _bus, mut a, mut b, mut c) = line3();
    let a_dest = discover(&clock, &mut a, &mut b, &mut c);

    let handle = c
        .create_datagram(a_dest, b"temp probe 17", true)
        .expect("create datagram");
    let request_hash = c.packet(handle).packet_hash();

    // routed through the relay before it ever leaves the node
    assert!(c.packet(handle).header.has_transport());
    assert_eq!(c.packet(handle).transport_id, b.strategy().transport());
    c.send_packet(handle, 0, 0).expect("queue datagram");

    run(&clock, 2_000, || {
        a.tick();
        b.tick();
        c.tick();
    });

    assert_eq!(b.stats().mesh.datagrams_forwarded, 1);
    // the relay's echo of C's own request is suppressed at C
    assert_eq!(c.stats().mesh.duplicates_dropped, 1);

    let events = drain(&mut a);
    let datagram = events
        .iter()
        .find_map(|ev| match ev {
            MeshEvent::Datagram {
                packet_hash,
                payload,
                wants_reply,
                hops,
                ..
            } => Some((*packet_hash, payload.clone(), *wants_reply, *hops)),
            _ => None,
        })
        .expect("datagram delivered at the gateway");
    assert_eq!(datagram.0, request_hash);
    assert_eq!(datagram.1, b"temp probe 17");
    assert!(datagram.2, "keep-path flag must survive forwarding");
    assert_eq!(datagram.3, 2);
}

#[test]
fn signed_reply_verifies_end_to_end() {
    let (clock, bus, mut a, mut b, mut c) = line3();
    let a_dest = discover(&clock, &mut a, &mut b, &mut c);

    let handle = c
        .create_datagram(a_dest, b"read sensor", true)
        .expect("create datagram");
    let request_hash = c.packet(handle).packet_hash();
    c.send_packet(handle, 0, 0).expect("queue datagram");
    run(&clock, 2_000, || {
        a.tick();
        b.tick();
        c.tick();
    });

    let request = drain(&mut a)
        .into_iter()
        .find_map(|ev| match ev {
            MeshEvent::Datagram {
                packet_hash,
                wants_reply: true,
                ..
            } => Some(packet_hash),
            _ => None,
        })
        .expect("request delivered at the gateway");
    assert_eq!(request, request_hash);
    a.mark_datagram_handled(&request);

    // a reply forged with the wrong key is dropped at the requester
    let mallory = LocalIdentity::from_seed([99; 32]);
    bus.inject(1, signed_reply_frame(&mallory, &request_hash, b"spoofed", 9));
    run(&clock, 500, || {
        a.tick();
        b.tick();
        c.tick();
    });
    assert_eq!(c.stats().mesh.forged_drops, 1);
    assert!(drain(&mut c)
        .iter()
        .all(|ev| !matches!(ev, MeshEvent::ReplyVerified { .. })));

    // the genuine reply relays through B and verifies at C
    let reply = a
        .create_reply_signed(&request_hash, b"ack from gateway")
        .expect("create signed reply");
    a.send_packet(reply, 1, 0).expect("queue reply");
    run(&clock, 2_000, || {
        a.tick();
        b.tick();
        c.tick();
    });

    assert_eq!(b.stats().mesh.replies_relayed, 1);
    let verified = drain(&mut c)
        .into_iter()
        .find_map(|ev| match ev {
            MeshEvent::ReplyVerified {
                packet_hash,
                payload,
                hops,
            } => Some((packet_hash, payload, hops)),
            _ => None,
        })
        .expect("verified reply at the requester");
    assert_eq!(verified.0, request_hash);
    assert_eq!(verified.1, b"ack from gateway");
    assert_eq!(verified.2, 2);

    // replaying the very same reply finds its correlation consumed; it is
    // dropped before any signature work, so the forgery count stays put
    let gateway_key = LocalIdentity::from_seed([1; 32]);
    bus.inject(
        1,
        signed_reply_frame(&gateway_key, &request_hash, b"ack from gateway", 9),
    );
    run(&clock, 500, || {
        a.tick();
        b.tick();
        c.tick();
    });
    assert!(drain(&mut c)
        .iter()
        .all(|ev| !matches!(ev, MeshEvent::ReplyVerified { .. })));
    assert_eq!(c.stats().mesh.forged_drops, 1);
}

/// Lets the test flip an announce filter on and off.
struct Gated(Rc<Cell<bool>>);

impl AnnounceFilter for Gated {
    fn is_interesting(&mut self, _meta: &AnnounceMeta) -> bool {
        self.0.get()
    }
}

#[test]
fn path_request_recovers_a_missed_route() {
    let clock = SharedClock::new();
    let bus = RadioBus::new(clock.clone());
    let mut a = edge(&bus, &clock, 1, 1);
    let mut b = relay(&bus, &clock, 2, 2);
    let mut c = edge(&bus, &clock, 3, 3);

    // D hangs off the relay and ignores announces until told otherwise
    let interested = Rc::new(Cell::new(false));
    let mut d = edge(&bus, &clock, 4, 4).with_announce_filter(Gated(interested.clone()));

    bus.connect(0, 1);
    bus.connect(1, 2);
    bus.connect(1, 3);

    let a_dest = a.announce_destination();
    let handle = a.create_announce(b"gateway").expect("create announce");
    a.send_announce(handle, 1, 0, 0);
    run(&clock, 12_000, || {
        a.tick();
        b.tick();
        c.tick();
        d.tick();
    });

    assert!(c.has_path_to(&a_dest));
    assert!(!d.has_path_to(&a_dest), "filtered announce must not be cached");

    // now D wants the route it ignored
    interested.set(true);
    d.request_path_to(&a_dest).expect("queue path request");
    run(&clock, 10_000, || {
        a.tick();
        b.tick();
        c.tick();
        d.tick();
    });

    assert!(d.has_path_to(&a_dest));
    assert_eq!(b.stats().mesh.path_requests_served, 1);

    let announce = drain(&mut d)
        .into_iter()
        .find_map(|ev| match ev {
            MeshEvent::Announce {
                destination, hops, ..
            } => Some((destination, hops)),
            _ => None,
        })
        .expect("replayed announce at the late joiner");
    assert_eq!(announce.0, a_dest);
    assert_eq!(announce.1, 2, "replayed from the relay's cache, one hop out");

    // requests are never marked seen, so asking again still gets served
    d.request_path_to(&a_dest).expect("repeat path request");
    run(&clock, 10_000, || {
        a.tick();
        b.tick();
        c.tick();
        d.tick();
    });
    assert_eq!(b.stats().mesh.path_requests_served, 2);
}
