//! Thicket Mesh Command-Line Interface
//!
//! This CLI provides tools for:
//! - Running multi-node mesh exchanges on a simulated radio bus
//! - Generating node identities and their destination hashes
//! - Inspecting wire format and scheduling constants
//!
//! The simulation runs entirely under virtual time; no radio hardware is
//! involved.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use thicket_core::destination::{ANNOUNCE_NAME, PATH_REQUEST_NAME, TRANSPORT_NAME};
use thicket_core::routing::{
    PATH_REPLY_DELAY_MAX_MS, PATH_REPLY_DELAY_MIN_MS, REBROADCAST_DELAY_MAX_MS,
    REBROADCAST_DELAY_MIN_MS,
};
use thicket_core::simulation::{RadioBus, SeededRandom, SharedClock, SimRadio, SimRtc};
use thicket_core::{
    announce_destination, path_request_destination, transport_destination, Destination,
    EdgeRouting, LocalIdentity, MeshEvent, MillisClock, Node, NodeStats, OsRandom, Packet,
    PacketHash, Radio, RelayRouting, RoutingStrategy, TableLimits, ANNOUNCE_MIN_LEN,
    DEFAULT_AIRTIME_FACTOR, DEFAULT_MAX_HOPS, MAX_APP_DATA, SIGNATURE_LEN,
};
use tracing::warn;

/// Virtual clock step per simulation iteration.
const STEP_MS: u32 = 25;

/// RTC base handed to every simulated node, epoch seconds.
const EPOCH: u32 = 1_700_000_000;

#[derive(Parser)]
#[command(name = "thicket")]
#[command(author, version, about = "Thicket mesh engine CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an announce / datagram / signed-reply exchange on a simulated bus
    Simulate {
        /// Total number of nodes (two line edges, relays between them,
        /// the rest hang off relays as leaf edges)
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Relays bridging the two line edges
        #[arg(long, default_value = "1")]
        relays: usize,

        /// Seed for node keys and retransmit jitter
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Virtual time to run, in seconds
        #[arg(long, default_value = "60")]
        duration_secs: u32,

        /// Emit the results as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Generate a node identity and its destination hashes
    Keygen {
        /// 32-byte hex seed for a deterministic keypair
        #[arg(long)]
        seed: Option<String>,
    },

    /// Show wire format and scheduling constants
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            relays,
            seed,
            duration_secs,
            json,
        } => cmd_simulate(nodes, relays, seed, duration_secs, json),
        Commands::Keygen { seed } => cmd_keygen(seed),
        Commands::Info => cmd_info(),
    }
}

type EdgeNode = Node<SimRadio, SharedClock, EdgeRouting>;
type RelayNode = Node<SimRadio, SharedClock, RelayRouting>;

/// A mesh node plus its role in the simulated topology.
enum SimNode {
    Edge(EdgeNode),
    Relay(RelayNode),
}

impl SimNode {
    fn role(&self) -> &'static str {
        match self {
            SimNode::Edge(_) => "edge",
            SimNode::Relay(_) => "relay",
        }
    }

    fn tick(&mut self) {
        match self {
            SimNode::Edge(node) => node.tick(),
            SimNode::Relay(node) => node.tick(),
        }
    }

    fn poll_event(&mut self) -> Option<MeshEvent> {
        match self {
            SimNode::Edge(node) => node.poll_event(),
            SimNode::Relay(node) => node.poll_event(),
        }
    }

    fn stats(&self) -> NodeStats {
        match self {
            SimNode::Edge(node) => node.stats(),
            SimNode::Relay(node) => node.stats(),
        }
    }

    fn announce_destination(&self) -> Destination {
        match self {
            SimNode::Edge(node) => node.announce_destination(),
            SimNode::Relay(node) => node.announce_destination(),
        }
    }

    fn has_path_to(&self, destination: &Destination) -> bool {
        match self {
            SimNode::Edge(node) => node.has_path_to(destination),
            SimNode::Relay(node) => node.has_path_to(destination),
        }
    }

    fn announce(&mut self, app_data: &[u8], confirm_secs: u32) -> Result<()> {
        match self {
            SimNode::Edge(node) => announce_via(node, app_data, confirm_secs),
            SimNode::Relay(node) => announce_via(node, app_data, confirm_secs),
        }
    }

    fn ping(&mut self, destination: Destination, payload: &[u8]) -> Result<PacketHash> {
        match self {
            SimNode::Edge(node) => ping_via(node, destination, payload),
            SimNode::Relay(node) => ping_via(node, destination, payload),
        }
    }

    fn ack(&mut self, hash: &PacketHash, payload: &[u8]) -> Result<()> {
        match self {
            SimNode::Edge(node) => ack_via(node, hash, payload),
            SimNode::Relay(node) => ack_via(node, hash, payload),
        }
    }
}

fn announce_via<R: Radio, C: MillisClock, S: RoutingStrategy>(
    node: &mut Node<R, C, S>,
    app_data: &[u8],
    confirm_secs: u32,
) -> Result<()> {
    let handle = node.create_announce(app_data)?;
    node.send_announce(handle, 1, 0, confirm_secs);
    Ok(())
}

/// Keep-path datagram to `destination`. Returns the hash the reply will
/// be correlated under.
fn ping_via<R: Radio, C: MillisClock, S: RoutingStrategy>(
    node: &mut Node<R, C, S>,
    destination: Destination,
    payload: &[u8],
) -> Result<PacketHash> {
    let handle = node.create_datagram(destination, payload, true)?;
    let hash = node.packet(handle).packet_hash();
    if let Err(err) = node.send_packet(handle, 0, 0) {
        node.release_packet(handle);
        return Err(err.into());
    }
    Ok(hash)
}

fn ack_via<R: Radio, C: MillisClock, S: RoutingStrategy>(
    node: &mut Node<R, C, S>,
    hash: &PacketHash,
    payload: &[u8],
) -> Result<()> {
    let handle = node.create_reply_signed(hash, payload)?;
    if let Err(err) = node.send_packet(handle, 1, 0) {
        node.release_packet(handle);
        return Err(err.into());
    }
    node.mark_datagram_handled(hash);
    Ok(())
}

fn secs(ms: u32) -> f64 {
    f64::from(ms) / 1000.0
}

fn cmd_simulate(
    nodes: usize,
    relays: usize,
    seed: u64,
    duration_secs: u32,
    json: bool,
) -> Result<()> {
    use rand::{RngCore, SeedableRng};

    if nodes < 2 {
        anyhow::bail!("need at least two nodes (an announcer and a requester)");
    }
    if nodes > 200 {
        anyhow::bail!("node ids are single bytes; at most 200 nodes");
    }
    if relays + 2 > nodes {
        anyhow::bail!("{} relays need at least {} nodes", relays, relays + 2);
    }
    if relays == 0 && nodes > 2 {
        anyhow::bail!("extra edges need a relay to reach the gateway; add --relays");
    }

    if !json {
        println!("=== Thicket Mesh Simulation ===");
        println!();
        println!("Nodes:    {} ({} edge, {} relay)", nodes, nodes - relays, relays);
        println!("Seed:     {}", seed);
        println!("Duration: {} s virtual", duration_secs);
        println!();
    }

    let clock = SharedClock::new();
    let bus = RadioBus::new(clock.clone());

    // Node 0 is the announcing gateway, nodes 1..=relays form the line,
    // the far edge closes it and any remaining edges hang off relays.
    let mut key_rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut mesh_nodes: Vec<SimNode> = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let mut key_seed = [0u8; 32];
        key_rng.fill_bytes(&mut key_seed);
        let identity = LocalIdentity::from_seed(key_seed);
        let rng = SeededRandom::new(seed.wrapping_add(i as u64 + 1));
        let rtc = SimRtc::new(clock.clone(), EPOCH);
        let sim_id = (i + 1) as u8;
        let node = if i >= 1 && i <= relays {
            let strategy = RelayRouting::new(&identity);
            SimNode::Relay(
                Node::new(bus.endpoint(), clock.clone(), identity, strategy)
                    .with_rtc(rtc)
                    .with_rng(rng)
                    .with_sim_id(sim_id),
            )
        } else {
            SimNode::Edge(
                Node::new(bus.endpoint(), clock.clone(), identity, EdgeRouting::new())
                    .with_rtc(rtc)
                    .with_rng(rng)
                    .with_sim_id(sim_id),
            )
        };
        mesh_nodes.push(node);
    }

    let line_len = relays + 2;
    for i in 0..line_len - 1 {
        bus.connect(i, i + 1);
    }
    for leaf in line_len..nodes {
        bus.connect(1 + (leaf - line_len) % relays, leaf);
    }

    if !json {
        println!("Topology (line with leaves):");
        for (i, node) in mesh_nodes.iter().enumerate() {
            println!("  node {:<3} {:<6} {}", i, node.role(), node.announce_destination());
        }
        println!();
    }

    let gateway_dest = mesh_nodes[0].announce_destination();

    // Every edge except the gateway pings it once the flood has landed,
    // staggered so the relays' airtime budgets do not collide.
    let ping_at = (duration_secs.saturating_mul(1_000) / 3).clamp(5_000, 20_000);
    let mut pending: Vec<(usize, u32)> = Vec::new();
    let mut stagger = 0u32;
    for (idx, node) in mesh_nodes.iter().enumerate().skip(1) {
        if matches!(node, SimNode::Edge(_)) {
            pending.push((idx, ping_at + stagger * 1_500));
            stagger += 1;
        }
    }

    mesh_nodes[0].announce(b"gateway", 30)?;

    if !json {
        println!("Running exchange under virtual time...");
        println!();
    }

    let total_ms = duration_secs.saturating_mul(1_000);
    let mut now_ms: u32 = 0;
    let mut pings_sent = 0u64;
    let mut acks_signed = 0u64;
    let mut acks_verified = 0u64;
    let mut ping_owner: HashMap<PacketHash, usize> = HashMap::new();
    let mut path_seen = vec![false; nodes];

    while now_ms < total_ms {
        clock.advance(STEP_MS);
        now_ms += STEP_MS;

        let mut i = 0;
        while i < pending.len() {
            let (idx, at) = pending[i];
            if now_ms < at {
                i += 1;
                continue;
            }
            if !mesh_nodes[idx].has_path_to(&gateway_dest) {
                // Flood still in the air; check again in a second.
                pending[i].1 = now_ms + 1_000;
                i += 1;
                continue;
            }
            match mesh_nodes[idx].ping(gateway_dest, format!("ping from node {}", idx).as_bytes())
            {
                Ok(hash) => {
                    ping_owner.insert(hash, idx);
                    pings_sent += 1;
                    if !json {
                        println!("[{:>7.3}s] node {} pings the gateway", secs(now_ms), idx);
                    }
                }
                Err(err) => warn!("node {} could not send its ping: {}", idx, err),
            }
            pending.remove(i);
        }

        for node in mesh_nodes.iter_mut() {
            node.tick();
        }

        for idx in 0..mesh_nodes.len() {
            while let Some(event) = mesh_nodes[idx].poll_event() {
                match event {
                    MeshEvent::Announce {
                        destination, hops, ..
                    } => {
                        if destination == gateway_dest && !path_seen[idx] {
                            path_seen[idx] = true;
                            if !json {
                                println!(
                                    "[{:>7.3}s] node {} cached the gateway path ({} hops)",
                                    secs(now_ms),
                                    idx,
                                    hops
                                );
                            }
                        }
                    }
                    MeshEvent::Datagram {
                        packet_hash,
                        payload,
                        wants_reply,
                        hops,
                        ..
                    } => {
                        if idx == 0 {
                            if !json {
                                println!(
                                    "[{:>7.3}s] gateway received '{}' over {} hops",
                                    secs(now_ms),
                                    String::from_utf8_lossy(&payload),
                                    hops
                                );
                            }
                            if wants_reply {
                                match mesh_nodes[0].ack(&packet_hash, b"ack from gateway") {
                                    Ok(()) => acks_signed += 1,
                                    Err(err) => warn!("gateway could not reply: {}", err),
                                }
                            }
                        }
                    }
                    MeshEvent::ReplyVerified {
                        packet_hash,
                        payload,
                        hops,
                    } => {
                        if ping_owner.get(&packet_hash) == Some(&idx) {
                            acks_verified += 1;
                            if !json {
                                println!(
                                    "[{:>7.3}s] node {} verified '{}' over {} hops",
                                    secs(now_ms),
                                    idx,
                                    String::from_utf8_lossy(&payload),
                                    hops
                                );
                            }
                        }
                    }
                    MeshEvent::Reply { .. } => {}
                }
            }
        }
    }

    if json {
        let per_node: Vec<serde_json::Value> = mesh_nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                serde_json::json!({
                    "node": idx,
                    "role": node.role(),
                    "destination": node.announce_destination().to_string(),
                    "stats": node.stats(),
                })
            })
            .collect();
        let report = serde_json::json!({
            "virtual_ms": total_ms,
            "nodes": nodes,
            "relays": relays,
            "seed": seed,
            "pings_sent": pings_sent,
            "acks_signed": acks_signed,
            "acks_verified": acks_verified,
            "per_node": per_node,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("=== Simulation Results ===");
    println!();
    println!("Virtual time:  {:.1} s", secs(total_ms));
    println!("Pings sent:    {}", pings_sent);
    println!("Acks signed:   {}", acks_signed);
    println!("Acks verified: {}", acks_verified);
    println!();
    println!("Per-Node Statistics:");
    println!(
        "{:<6} {:<7} {:>5} {:>5} {:>5} {:>8} {:>5} {:>7} {:>8}",
        "Node", "Role", "TX", "RX", "Fwd", "Relayed", "Dup", "Forged", "Air ms"
    );
    println!("{}", "-".repeat(64));
    for (idx, node) in mesh_nodes.iter().enumerate() {
        let stats = node.stats();
        println!(
            "{:<6} {:<7} {:>5} {:>5} {:>5} {:>8} {:>5} {:>7} {:>8}",
            idx,
            node.role(),
            stats.dispatcher.packets_sent,
            stats.dispatcher.packets_received,
            stats.mesh.datagrams_forwarded,
            stats.mesh.replies_relayed,
            stats.mesh.duplicates_dropped,
            stats.mesh.forged_drops,
            stats.dispatcher.total_air_time_ms
        );
    }

    Ok(())
}

fn cmd_keygen(seed: Option<String>) -> Result<()> {
    let identity = match seed {
        Some(hex_seed) => {
            let bytes = hex::decode(hex_seed.trim()).context("seed is not valid hex")?;
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("seed must be exactly 32 bytes (64 hex chars)"))?;
            LocalIdentity::from_seed(seed)
        }
        None => LocalIdentity::generate(&mut OsRandom),
    };
    let public = identity.identity();

    println!("=== Node Identity ===");
    println!();
    println!("Keypair:    {}", identity.to_hex());
    println!("Public key: {}", public.to_hex());
    println!();
    println!("Destinations:");
    println!("  announce:  {}", announce_destination(&public));
    println!("  transport: {}", transport_destination(&public));
    println!();
    println!("Keep the keypair line private; everything else is shareable.");

    Ok(())
}

fn cmd_info() -> Result<()> {
    let limits = TableLimits::default();

    println!("=== Thicket Protocol Constants ===");
    println!();
    println!("Wire format:");
    println!("  Max frame:          {} bytes", Packet::MAX_WIRE);
    println!("  Max payload:        {} bytes", Packet::MAX_PAYLOAD);
    println!(
        "  Announce overhead:  {} bytes (key 32, stamp 8, signature 64)",
        ANNOUNCE_MIN_LEN
    );
    println!("  Max announce data:  {} bytes", MAX_APP_DATA);
    println!("  Signature:          {} bytes (Ed25519)", SIGNATURE_LEN);
    println!();
    println!("Reserved destinations:");
    println!("  {:<16} identity-bound, one per node", ANNOUNCE_NAME);
    println!("  {:<16} identity-bound, relay ingress", TRANSPORT_NAME);
    println!("  {:<16} {}", PATH_REQUEST_NAME, path_request_destination());
    println!();
    println!("Scheduling:");
    println!(
        "  Airtime budget:     {}x measured airtime between sends",
        DEFAULT_AIRTIME_FACTOR
    );
    println!(
        "  Rebroadcast delay:  {}-{} ms",
        REBROADCAST_DELAY_MIN_MS, REBROADCAST_DELAY_MAX_MS
    );
    println!(
        "  Path reply delay:   {}-{} ms",
        PATH_REPLY_DELAY_MIN_MS, PATH_REPLY_DELAY_MAX_MS
    );
    println!("  Hop limit:          {}", DEFAULT_MAX_HOPS);
    println!();
    println!("Default table limits (per node):");
    println!("  Paths:              {}", limits.destinations);
    println!("  Packet hashes:      {}", limits.packet_hashes);
    println!("  Reply correlations: {}", limits.correlations);
    println!("  Announce blobs:     {}", limits.rand_blobs);
    println!();
    println!("Examples:");
    println!("  thicket keygen");
    println!("  thicket simulate --nodes 4 --relays 2 --duration-secs 90");
    println!("  thicket simulate --nodes 3 --relays 1 --seed 7 --json");

    Ok(())
}
