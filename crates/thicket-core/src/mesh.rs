//! The mesh engine.
//!
//! [`Node`] ties a radio dispatcher, the packet pool, the routing tables
//! and a [`RoutingStrategy`] together. Each [`Node::tick`] advances the
//! in-flight send, drains one received frame, routes it through the
//! strategy and starts the next queued send. Nothing blocks; call `tick`
//! from the main loop as fast as you like.
//!
//! Inbound packets are validated here (frame shape, announce signatures,
//! duplicate suppression) and then handed to the strategy, which decides
//! whether to deliver, forward or drop. Delivery happens through the
//! [`MeshEvent`] queue, drained with [`Node::poll_event`].

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::destination::{announce_destination, path_request_destination, Destination};
use crate::dispatcher::{
    future_millis, Dispatcher, DispatcherStats, SendPoll, SentAction, Verdict,
    DEFAULT_AIRTIME_FACTOR,
};
use crate::identity::{Identity, LocalIdentity, SIGNATURE_LEN};
use crate::packet::{Header, Packet, PacketHash, PacketType, ANNOUNCE_MIN_LEN, MAX_APP_DATA};
use crate::pool::{ArenaPacketStore, Handle, PacketStore};
use crate::tables::{InMemoryTables, MeshTables, SeenStatus};
use crate::traits::{MeshError, MeshResult, MillisClock, OsRandom, Radio, RandomSource, RtcClock, SystemRtc};

/// What a node tells the application.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A verified announce. The destination is now routable.
    Announce {
        destination: Destination,
        identity: Identity,
        hops: u8,
        app_data: Vec<u8>,
    },
    /// A datagram reached this node.
    Datagram {
        destination: Destination,
        packet_hash: PacketHash,
        payload: Vec<u8>,
        /// The sender kept the path open and expects a reply to the hash.
        wants_reply: bool,
        hops: u8,
    },
    /// An unsigned reply to a datagram sent from here.
    Reply {
        packet_hash: PacketHash,
        payload: Vec<u8>,
    },
    /// A signed reply whose signature checked out against the announce
    /// cached for the replying destination.
    ReplyVerified {
        packet_hash: PacketHash,
        payload: Vec<u8>,
        hops: u8,
    },
}

/// Parsed and verified announce fields, handed to strategies and filters.
#[derive(Debug, Clone)]
pub struct AnnounceMeta {
    pub destination: Destination,
    pub identity: Identity,
    /// Creation time embedded by the announcer, epoch seconds.
    pub timestamp: u32,
    pub rand_blob: [u8; 8],
    pub hops: u8,
    pub app_data: Vec<u8>,
}

/// Decides which announces the application cares about. Relays see all
/// announces regardless.
pub trait AnnounceFilter {
    fn is_interesting(&mut self, meta: &AnnounceMeta) -> bool;
}

/// The default filter: everything is interesting.
pub struct AcceptAll;

impl AnnounceFilter for AcceptAll {
    fn is_interesting(&mut self, _meta: &AnnounceMeta) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct MeshStats {
    pub announces_processed: u64,
    pub announces_rebroadcast: u64,
    pub datagrams_forwarded: u64,
    pub path_requests_served: u64,
    pub replies_relayed: u64,
    pub duplicates_dropped: u64,
    /// Announces and signed replies that failed signature checks.
    pub forged_drops: u64,
}

/// Combined node counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NodeStats {
    pub mesh: MeshStats,
    pub dispatcher: DispatcherStats,
}

/// Mutable node state lent to a [`RoutingStrategy`] for one call.
pub struct NodeCtx<'a> {
    pub store: &'a mut dyn PacketStore,
    pub tables: &'a mut dyn MeshTables,
    pub rng: &'a mut dyn RandomSource,
    pub events: &'a mut VecDeque<MeshEvent>,
    pub stats: &'a mut MeshStats,
    pub now_ms: u32,
    pub now_secs: u32,
}

/// How a node participates in the mesh.
///
/// The engine validates packets and then asks the strategy what to do
/// with them. Edge nodes deliver locally; relays additionally rebroadcast
/// announces and forward routed traffic. Every inbound hook returns a
/// [`Verdict`] deciding the packet's fate.
pub trait RoutingStrategy {
    /// A verified announce passed the interest check.
    fn on_announce(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle, meta: &AnnounceMeta)
        -> Verdict;

    /// A datagram that is not a duplicate.
    fn on_datagram(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict;

    /// An unsigned reply.
    fn on_reply(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict;

    /// A signed reply that passed [`RoutingStrategy::accept_signed_reply`].
    fn on_reply_signed(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict;

    /// Gate for signed replies. Implementations verify the signature
    /// against the cached announce of the replying destination.
    fn accept_signed_reply(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> bool;

    /// Bookkeeping for a locally created announce, before it is queued.
    fn prepare_local_announce(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle);

    /// Bookkeeping for a locally created datagram, before it is queued.
    fn prepare_local_datagram(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle);

    /// Multiplier on measured airtime that gates the next send.
    fn airtime_budget_factor(&self) -> f32 {
        DEFAULT_AIRTIME_FACTOR
    }

    /// Relays return true: every verified announce reaches the strategy,
    /// bypassing the application's announce filter.
    fn wants_all_announces(&self) -> bool {
        false
    }

    /// Called for every verified announce, interesting or not.
    fn on_announce_observed(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle, meta: &AnnounceMeta) {
        let _ = (ctx, handle, meta);
    }

    /// Duplicate check for inbound datagrams.
    fn datagram_seen(&self, ctx: &NodeCtx<'_>, hash: &PacketHash) -> bool {
        ctx.tables.seen_status(hash) != SeenStatus::Unseen
    }

    /// Bookkeeping for a locally created reply.
    fn prepare_local_reply(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) {
        let _ = (ctx, handle);
    }

    /// A locally queued packet finished transmitting.
    fn on_packet_sent(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> SentAction {
        let _ = (ctx, handle);
        SentAction::Release
    }

    /// Queue an announce for sending. `confirm_secs` asks the strategy to
    /// retransmit until the announce is heard back from a relay; zero
    /// sends it once.
    fn send_announce(
        &mut self,
        ctx: &mut NodeCtx<'_>,
        handle: Handle,
        priority: u8,
        delay_ms: u32,
        confirm_secs: u32,
    ) {
        let _ = confirm_secs;
        let at = future_millis(ctx.now_ms, delay_ms);
        if !ctx.store.queue_outbound(handle, priority, at) {
            error!("cannot queue announce, queue full");
            ctx.store.release(handle);
        }
    }

    /// Stop confirming the pending announce, if any.
    fn cancel_announce_confirm(&mut self, ctx: &mut NodeCtx<'_>) {
        let _ = ctx;
    }

    fn awaiting_announce_confirm(&self) -> bool {
        false
    }

    /// Periodic work, called once per [`Node::tick`].
    fn tick(&mut self, ctx: &mut NodeCtx<'_>) {
        let _ = ctx;
    }
}

/// One mesh participant.
pub struct Node<R, C, S> {
    dispatcher: Dispatcher<R, C>,
    store: Box<dyn PacketStore>,
    tables: Box<dyn MeshTables>,
    rtc: Box<dyn RtcClock>,
    rng: Box<dyn RandomSource>,
    identity: LocalIdentity,
    strategy: S,
    filter: Box<dyn AnnounceFilter>,
    events: VecDeque<MeshEvent>,
    stats: MeshStats,
}

impl<R: Radio, C: MillisClock, S: RoutingStrategy> Node<R, C, S> {
    pub fn new(radio: R, clock: C, identity: LocalIdentity, strategy: S) -> Self {
        Self {
            dispatcher: Dispatcher::new(radio, clock),
            store: Box::new(ArenaPacketStore::new()),
            tables: Box::new(InMemoryTables::new()),
            rtc: Box::new(SystemRtc::default()),
            rng: Box::new(OsRandom),
            identity,
            strategy,
            filter: Box::new(AcceptAll),
            events: VecDeque::new(),
            stats: MeshStats::default(),
        }
    }

    pub fn with_store(mut self, store: impl PacketStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn with_tables(mut self, tables: impl MeshTables + 'static) -> Self {
        self.tables = Box::new(tables);
        self
    }

    pub fn with_rtc(mut self, rtc: impl RtcClock + 'static) -> Self {
        self.rtc = Box::new(rtc);
        self
    }

    pub fn with_rng(mut self, rng: impl RandomSource + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn with_announce_filter(mut self, filter: impl AnnounceFilter + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    /// Tag outgoing frames with a simulated sender id. Simulation only.
    pub fn with_sim_id(mut self, id: u8) -> Self {
        self.dispatcher.set_sim_id(id);
        self
    }

    pub fn begin(&mut self) {
        self.dispatcher.begin();
    }

    /// Advance the node: finish sends, take one frame, start the next
    /// send, run strategy housekeeping.
    pub fn tick(&mut self) {
        let factor = self.strategy.airtime_budget_factor();
        let poll = self.dispatcher.poll_send(self.store.as_mut(), factor);
        if let SendPoll::Sent(handle) = poll {
            let (strategy, _, mut ctx) = self.ctx_parts();
            if strategy.on_packet_sent(&mut ctx, handle) == SentAction::Release {
                ctx.store.release(handle);
            }
        }
        if poll != SendPoll::InFlight {
            if let Some(handle) = self.dispatcher.poll_recv(self.store.as_mut()) {
                self.handle_inbound(handle);
            }
            self.dispatcher.start_next_send(self.store.as_mut());
        }
        let (strategy, _, mut ctx) = self.ctx_parts();
        strategy.tick(&mut ctx);
    }

    /// Next application event, if any.
    pub fn poll_event(&mut self) -> Option<MeshEvent> {
        self.events.pop_front()
    }

    /// Build a signed announce for this node. Returns the pooled handle;
    /// queue it with [`Node::send_announce`].
    pub fn create_announce(&mut self, app_data: &[u8]) -> MeshResult<Handle> {
        if app_data.len() > MAX_APP_DATA {
            return Err(MeshError::PayloadTooLarge {
                len: app_data.len(),
                max: MAX_APP_DATA,
            });
        }
        let Some(handle) = self.store.alloc() else {
            warn!("no unused packets available for announce");
            return Err(MeshError::PoolExhausted);
        };

        let identity = self.identity.identity();
        let destination = announce_destination(&identity);

        let mut rand_blob = [0u8; 8];
        rand_blob[..4].copy_from_slice(&self.rtc.current_time().to_le_bytes());
        self.rng.fill(&mut rand_blob[4..]);

        let mut message = Vec::with_capacity(Destination::LEN + ANNOUNCE_MIN_LEN + app_data.len());
        message.extend_from_slice(destination.as_bytes());
        message.extend_from_slice(identity.as_bytes());
        message.extend_from_slice(&rand_blob);
        message.extend_from_slice(app_data);
        let signature = self.identity.sign(&message);

        let mut payload = Vec::with_capacity(ANNOUNCE_MIN_LEN + app_data.len());
        payload.extend_from_slice(identity.as_bytes());
        payload.extend_from_slice(&rand_blob);
        payload.extend_from_slice(&signature);
        payload.extend_from_slice(app_data);

        {
            let pkt = self.store.packet_mut(handle);
            pkt.header = Header::new(PacketType::Announce);
            pkt.destination = destination;
            if let Err(err) = pkt.set_payload(&payload) {
                self.store.release(handle);
                return Err(err);
            }
        }

        let (strategy, _, mut ctx) = self.ctx_parts();
        strategy.prepare_local_announce(&mut ctx, handle);
        Ok(handle)
    }

    /// Build a datagram. With `want_reply` the path stays open and a
    /// [`MeshEvent::Reply`] or [`MeshEvent::ReplyVerified`] for its hash
    /// is expected back.
    pub fn create_datagram(
        &mut self,
        destination: Destination,
        payload: &[u8],
        want_reply: bool,
    ) -> MeshResult<Handle> {
        let Some(handle) = self.store.alloc() else {
            warn!("no unused packets available for datagram");
            return Err(MeshError::PoolExhausted);
        };
        {
            let pkt = self.store.packet_mut(handle);
            pkt.header = Header::new(PacketType::Data);
            pkt.header.set_keep_path(want_reply);
            pkt.destination = destination;
            if let Err(err) = pkt.set_payload(payload) {
                self.store.release(handle);
                return Err(err);
            }
        }
        let (strategy, _, mut ctx) = self.ctx_parts();
        strategy.prepare_local_datagram(&mut ctx, handle);
        Ok(handle)
    }

    /// Build an unsigned reply to a received datagram.
    pub fn create_reply(&mut self, hash: &PacketHash, payload: &[u8]) -> MeshResult<Handle> {
        let Some(handle) = self.store.alloc() else {
            warn!("no unused packets available for reply");
            return Err(MeshError::PoolExhausted);
        };
        {
            let pkt = self.store.packet_mut(handle);
            pkt.header = Header::new(PacketType::Reply);
            pkt.destination = Destination::from_bytes(*hash);
            if let Err(err) = pkt.set_payload(payload) {
                self.store.release(handle);
                return Err(err);
            }
        }
        let (strategy, _, mut ctx) = self.ctx_parts();
        strategy.prepare_local_reply(&mut ctx, handle);
        Ok(handle)
    }

    /// Build a signed reply. The signature binds the reply to the request
    /// hash and this node's key, so the requester can verify it end to
    /// end across untrusted relays.
    pub fn create_reply_signed(&mut self, hash: &PacketHash, payload: &[u8]) -> MeshResult<Handle> {
        let max = Packet::MAX_PAYLOAD - SIGNATURE_LEN;
        if payload.len() > max {
            return Err(MeshError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        let Some(handle) = self.store.alloc() else {
            warn!("no unused packets available for signed reply");
            return Err(MeshError::PoolExhausted);
        };

        let identity = self.identity.identity();
        let mut message = Vec::with_capacity(hash.len() + Identity::PUB_KEY_LEN + payload.len());
        message.extend_from_slice(hash);
        message.extend_from_slice(identity.as_bytes());
        message.extend_from_slice(payload);
        let signature = self.identity.sign(&message);

        let mut full = Vec::with_capacity(SIGNATURE_LEN + payload.len());
        full.extend_from_slice(&signature);
        full.extend_from_slice(payload);

        {
            let pkt = self.store.packet_mut(handle);
            pkt.header = Header::new(PacketType::ReplySigned);
            pkt.destination = Destination::from_bytes(*hash);
            if let Err(err) = pkt.set_payload(&full) {
                self.store.release(handle);
                return Err(err);
            }
        }
        let (strategy, _, mut ctx) = self.ctx_parts();
        strategy.prepare_local_reply(&mut ctx, handle);
        Ok(handle)
    }

    /// Queue a packet for sending after `delay_ms`. On a full queue the
    /// caller keeps the handle.
    pub fn send_packet(&mut self, handle: Handle, priority: u8, delay_ms: u32) -> MeshResult<()> {
        let at = future_millis(self.dispatcher.now(), delay_ms);
        if self.store.queue_outbound(handle, priority, at) {
            Ok(())
        } else {
            Err(MeshError::QueueFull)
        }
    }

    /// Queue an announce through the strategy. With `confirm_secs` > 0 an
    /// edge strategy retransmits it until a relay echoes it back.
    pub fn send_announce(&mut self, handle: Handle, priority: u8, delay_ms: u32, confirm_secs: u32) {
        let (strategy, _, mut ctx) = self.ctx_parts();
        strategy.send_announce(&mut ctx, handle, priority, delay_ms, confirm_secs);
    }

    /// Flood a request for `destination`'s announce. Somebody holding a
    /// path replays the cached announce back through the mesh.
    pub fn request_path_to(&mut self, destination: &Destination) -> MeshResult<()> {
        let handle =
            self.create_datagram(path_request_destination(), destination.as_bytes(), false)?;
        // path requests always flood
        self.store.packet_mut(handle).clear_transport();
        if let Err(err) = self.send_packet(handle, 0, 0) {
            self.store.release(handle);
            return Err(err);
        }
        Ok(())
    }

    pub fn cancel_announce_confirm(&mut self) {
        let (strategy, _, mut ctx) = self.ctx_parts();
        strategy.cancel_announce_confirm(&mut ctx);
    }

    pub fn awaiting_announce_confirm(&self) -> bool {
        self.strategy.awaiting_announce_confirm()
    }

    /// Suppress further deliveries of a datagram the application has
    /// fully handled.
    pub fn mark_datagram_handled(&mut self, hash: &PacketHash) {
        self.tables.set_seen_status(*hash, SeenStatus::Seen);
    }

    pub fn identity(&self) -> Identity {
        self.identity.identity()
    }

    /// The destination this node's announces advertise.
    pub fn announce_destination(&self) -> Destination {
        announce_destination(&self.identity.identity())
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            mesh: self.stats,
            dispatcher: *self.dispatcher.stats(),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    pub fn packet(&self, handle: Handle) -> &Packet {
        self.store.packet(handle)
    }

    pub fn release_packet(&mut self, handle: Handle) {
        self.store.release(handle);
    }

    pub fn free_packet_count(&self) -> usize {
        self.store.free_count()
    }

    pub fn outbound_queue_len(&self) -> usize {
        self.store.outbound_count()
    }

    pub fn has_path_to(&self, destination: &Destination) -> bool {
        self.tables.has_next_hop(destination)
    }

    /// The announce cached for `destination`, if a path is known.
    pub fn cached_announce(&self, destination: &Destination) -> Option<Packet> {
        self.tables.orig_announce(destination).map(|(p, _)| p.clone())
    }

    pub fn active_path_count(&self, max_age_secs: u32) -> usize {
        self.tables
            .active_path_count(self.rtc.current_time(), max_age_secs)
    }

    pub fn set_rtc_time(&mut self, epoch_secs: u32) {
        self.rtc.set_current_time(epoch_secs);
    }

    fn ctx_parts(&mut self) -> (&mut S, &mut dyn AnnounceFilter, NodeCtx<'_>) {
        let now_ms = self.dispatcher.now();
        let now_secs = self.rtc.current_time();
        let Self {
            store,
            tables,
            rng,
            events,
            stats,
            strategy,
            filter,
            ..
        } = self;
        (
            strategy,
            filter.as_mut(),
            NodeCtx {
                store: store.as_mut(),
                tables: tables.as_mut(),
                rng: rng.as_mut(),
                events,
                stats,
                now_ms,
                now_secs,
            },
        )
    }

    fn handle_inbound(&mut self, handle: Handle) {
        {
            let pkt = self.store.packet_mut(handle);
            pkt.hops = pkt.hops.saturating_add(1);
        }

        let (strategy, filter, mut ctx) = self.ctx_parts();
        let verdict = match ctx.store.packet(handle).packet_type() {
            Some(PacketType::Announce) => {
                Self::inbound_announce(strategy, filter, &mut ctx, handle)
            }
            Some(PacketType::Data) => {
                let hash = ctx.store.packet(handle).packet_hash();
                if strategy.datagram_seen(&ctx, &hash) {
                    debug!(hash = %hex::encode(hash), "duplicate datagram dropped");
                    ctx.stats.duplicates_dropped += 1;
                    Verdict::Release
                } else {
                    strategy.on_datagram(&mut ctx, handle)
                }
            }
            Some(PacketType::Reply) => strategy.on_reply(&mut ctx, handle),
            Some(PacketType::ReplySigned) => {
                if strategy.accept_signed_reply(&mut ctx, handle) {
                    strategy.on_reply_signed(&mut ctx, handle)
                } else {
                    Verdict::Release
                }
            }
            None => {
                warn!("pooled packet with unknown type");
                Verdict::Release
            }
        };

        self.dispatcher
            .apply_verdict(self.store.as_mut(), handle, verdict);
    }

    /// Derive the announce destination from the embedded key, check the
    /// signature, then route through filter and strategy.
    fn inbound_announce(
        strategy: &mut S,
        filter: &mut dyn AnnounceFilter,
        ctx: &mut NodeCtx<'_>,
        handle: Handle,
    ) -> Verdict {
        let (identity, timestamp, rand_blob, signature, app_data, hops) = {
            let pkt = ctx.store.packet(handle);
            let Some(view) = pkt.announce_view() else {
                warn!(len = pkt.payload().len(), "dropping incomplete announce");
                return Verdict::Release;
            };
            (
                Identity::from_bytes(*view.pub_key),
                view.timestamp,
                *view.rand_blob,
                *view.signature,
                view.app_data.to_vec(),
                pkt.hops,
            )
        };

        let destination = announce_destination(&identity);
        ctx.store.packet_mut(handle).destination = destination;

        let mut message =
            Vec::with_capacity(Destination::LEN + ANNOUNCE_MIN_LEN + app_data.len());
        message.extend_from_slice(destination.as_bytes());
        message.extend_from_slice(identity.as_bytes());
        message.extend_from_slice(&rand_blob);
        message.extend_from_slice(&app_data);
        if !identity.verify(&signature, &message) {
            warn!(%identity, "announce signature check failed");
            ctx.stats.forged_drops += 1;
            return Verdict::Release;
        }

        let meta = AnnounceMeta {
            destination,
            identity,
            timestamp,
            rand_blob,
            hops,
            app_data,
        };

        strategy.on_announce_observed(ctx, handle, &meta);

        if !strategy.wants_all_announces() && !filter.is_interesting(&meta) {
            debug!(dest = %meta.destination, "announce not interesting");
            return Verdict::Release;
        }

        strategy.on_announce(ctx, handle, &meta)
    }
}

/// Check a signed reply against the claimed sender's key. The signature
/// covers the request hash (the packet's destination), the key and the
/// reply data, so relays cannot alter any of the three.
pub fn verify_reply_signed(packet: &Packet, identity: &Identity) -> bool {
    if packet.packet_type() != Some(PacketType::ReplySigned) {
        return false;
    }
    let payload = packet.payload();
    if payload.len() < SIGNATURE_LEN {
        return false;
    }
    let (signature, data) = payload.split_at(SIGNATURE_LEN);
    let mut message = Vec::with_capacity(Destination::LEN + Identity::PUB_KEY_LEN + data.len());
    message.extend_from_slice(packet.destination.as_bytes());
    message.extend_from_slice(identity.as_bytes());
    message.extend_from_slice(data);
    identity.verify(signature, &message)
}
