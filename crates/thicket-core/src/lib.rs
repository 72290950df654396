//! # Thicket Mesh Engine
//!
//! This crate implements a store-and-forward mesh protocol for long-range,
//! low-bandwidth packet radios. Frames are small, airtime is precious, and
//! links are half-duplex, so every layer is built around polling, strict
//! payload limits and an airtime budget.
//!
//! ## Overview
//!
//! - **Wire format**: 2 to 18 byte headers, payloads up to 235 bytes,
//!   whole frames never above 255 bytes
//! - **Discovery**: Ed25519-signed announce floods with per-hop duplicate
//!   suppression and jittered rebroadcast
//! - **Routing**: next-hop path cache fed by announces, LRU eviction,
//!   on-demand path requests when a route is missing
//! - **Replies**: request hashes correlate replies back along the reverse
//!   path, optionally signed end to end across untrusted relays
//! - **Scheduling**: priority outbound queue gated by a duty-cycle style
//!   airtime budget
//!
//! ## Packet Flow
//!
//! ```text
//! TX: create_* → strategy prepare → priority queue → airtime gate → radio
//! RX: radio → decode → dedup + signature checks → strategy verdict → event
//! ```
//!
//! The engine is sans-IO: radios, clocks and entropy come in through the
//! traits in [`traits`], so the same code drives hardware and the
//! simulated bus in [`simulation`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use thicket_core::prelude::*;
//! use thicket_core::simulation::{RadioBus, SeededRandom, SharedClock, SimRtc};
//!
//! let clock = SharedClock::new();
//! let bus = RadioBus::new(clock.clone());
//!
//! // An edge node that announces itself and consumes events.
//! let identity = LocalIdentity::from_seed([7; 32]);
//! let mut node = Node::new(bus.endpoint(), clock.clone(), identity, EdgeRouting::new())
//!     .with_rtc(SimRtc::new(clock.clone(), 1_700_000_000))
//!     .with_rng(SeededRandom::new(42));
//!
//! let announce = node.create_announce(b"sensor-7").unwrap();
//! node.send_announce(announce, 1, 0, 30);
//!
//! loop {
//!     clock.advance(25);
//!     node.tick();
//!     while let Some(event) = node.poll_event() {
//!         println!("{event:?}");
//!     }
//! }
//! ```

pub mod crypto;
pub mod destination;
pub mod dispatcher;
pub mod identity;
pub mod mesh;
pub mod packet;
pub mod pool;
pub mod routing;
pub mod simulation;
pub mod tables;
pub mod traits;

// Re-export main types
pub use destination::{
    announce_destination, path_request_destination, transport_destination, Destination,
};
pub use dispatcher::{DispatcherStats, SentAction, Verdict, DEFAULT_AIRTIME_FACTOR};
pub use identity::{Identity, LocalIdentity, SIGNATURE_LEN};
pub use mesh::{
    verify_reply_signed, AcceptAll, AnnounceFilter, AnnounceMeta, MeshEvent, MeshStats, Node,
    NodeCtx, NodeStats, RoutingStrategy,
};
pub use packet::{Header, Packet, PacketHash, PacketType, ANNOUNCE_MIN_LEN, MAX_APP_DATA};
pub use pool::{ArenaPacketStore, Handle, PacketStore};
pub use routing::{EdgeRouting, RelayRouting, DEFAULT_MAX_HOPS};
pub use tables::{InMemoryTables, MeshTables, SeenStatus, TableLimits};
pub use traits::{
    MeshError, MeshResult, MillisClock, OsRandom, Radio, RandomSource, RtcClock, SystemMillis,
    SystemRtc,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::destination::{announce_destination, Destination};
    pub use crate::dispatcher::Verdict;
    pub use crate::identity::{Identity, LocalIdentity};
    pub use crate::mesh::{MeshEvent, Node, RoutingStrategy};
    pub use crate::packet::{Packet, PacketHash, PacketType};
    pub use crate::pool::Handle;
    pub use crate::routing::{EdgeRouting, RelayRouting};
    pub use crate::traits::{MeshError, MeshResult, Radio};
}
