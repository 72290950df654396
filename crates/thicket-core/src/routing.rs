//! Edge and relay routing strategies.
//!
//! [`EdgeRouting`] consumes the mesh: it caches paths from announces it
//! finds interesting, answers path requests from that cache, delivers
//! datagrams and replies as events, and can retransmit its own announce
//! until a relay is heard rebroadcasting it.
//!
//! [`RelayRouting`] wraps the edge behaviors and keeps traffic moving:
//! verified announces are rebroadcast once per rand blob with the relay
//! written in as transport, transport-addressed datagrams hop along the
//! cached path, and replies ride the recorded reverse hop back. Announce
//! rebroadcast priority worsens with hop count, so closer copies win the
//! queue.

use tracing::{debug, error, warn};

use crate::destination::{path_request_destination, transport_destination, Destination};
use crate::dispatcher::{
    future_millis, millis_has_passed, SentAction, Verdict, DEFAULT_AIRTIME_FACTOR,
};
use crate::identity::{Identity, LocalIdentity, SIGNATURE_LEN};
use crate::mesh::{AnnounceMeta, MeshEvent, NodeCtx, RoutingStrategy};
use crate::packet::{PacketHash, PacketType};
use crate::pool::Handle;
use crate::tables::SeenStatus;

/// Delay window for replaying a cached announce to a path request.
pub const PATH_REPLY_DELAY_MIN_MS: u32 = 2_000;
pub const PATH_REPLY_DELAY_MAX_MS: u32 = 5_000;

/// Delay window for rebroadcasting an announce.
pub const REBROADCAST_DELAY_MIN_MS: u32 = 2_000;
pub const REBROADCAST_DELAY_MAX_MS: u32 = 5_000;

/// Announces past this hop count are not rebroadcast.
pub const DEFAULT_MAX_HOPS: u8 = 64;

/// A self-announce being retransmitted until somebody rebroadcasts it.
#[derive(Debug)]
struct AnnounceConfirm {
    handle: Handle,
    destination: Destination,
    priority: u8,
    /// Next retransmit interval; grows by a third on every send.
    interval_secs: u32,
    deadline_ms: u32,
    /// The handle sits with the strategy, not the queue.
    held: bool,
    /// Cancelled while in flight; release on send completion.
    cancelled: bool,
}

/// Routing for a leaf node: consume, never forward.
#[derive(Default)]
pub struct EdgeRouting {
    pending: Option<AnnounceConfirm>,
}

impl EdgeRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a path request from the announce cache.
    ///
    /// The received packet is overwritten in place with the cached
    /// announce and requeued. The request is never marked seen, so
    /// repeated requests keep working. Relays pass their own transport
    /// address to splice themselves into the replayed path.
    fn handle_path_request(
        &mut self,
        ctx: &mut NodeCtx<'_>,
        handle: Handle,
        transport_rewrite: Option<Destination>,
    ) -> Verdict {
        let Some(wanted) = Destination::from_slice(ctx.store.packet(handle).payload()) else {
            warn!("path request with short payload");
            return Verdict::Release;
        };

        // somebody already holds our announce, no confirmation needed
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.destination == wanted && !p.cancelled)
        {
            debug!("path request for own announce cancels confirmation");
            self.cancel_confirm(ctx);
        }

        let Some(replay) = ctx.tables.orig_announce(&wanted).map(|(p, _)| p.clone()) else {
            debug!(dest = %wanted, "no cached announce for path request");
            return Verdict::Release;
        };

        let hops = replay.hops;
        *ctx.store.packet_mut(handle) = replay;
        if hops > 0 {
            if let Some(transport) = transport_rewrite {
                ctx.store.packet_mut(handle).set_transport(transport);
            }
        }
        let delay_ms = ctx
            .rng
            .next_in_range(PATH_REPLY_DELAY_MIN_MS, PATH_REPLY_DELAY_MAX_MS);
        ctx.stats.path_requests_served += 1;
        debug!(dest = %wanted, delay_ms, "replaying cached announce");
        Verdict::Retransmit {
            priority: 2,
            delay_ms,
        }
    }

    fn cancel_confirm(&mut self, ctx: &mut NodeCtx<'_>) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        if pending.cancelled {
            // still waiting for the in-flight send to finish
            self.pending = Some(pending);
            return;
        }
        if pending.held {
            ctx.store.release(pending.handle);
            return;
        }
        let mut idx = 0;
        while let Some(queued) = ctx.store.outbound_at(idx) {
            if queued == pending.handle {
                ctx.store.remove_outbound_at(idx);
                ctx.store.release(pending.handle);
                return;
            }
            idx += 1;
        }
        // in flight; the radio still owns the buffer
        pending.cancelled = true;
        self.pending = Some(pending);
    }
}

impl RoutingStrategy for EdgeRouting {
    fn on_announce(
        &mut self,
        ctx: &mut NodeCtx<'_>,
        handle: Handle,
        meta: &AnnounceMeta,
    ) -> Verdict {
        let now = ctx.now_secs;
        ctx.tables.update_next_hop(ctx.store.packet(handle), now);
        ctx.stats.announces_processed += 1;
        ctx.events.push_back(MeshEvent::Announce {
            destination: meta.destination,
            identity: meta.identity,
            hops: meta.hops,
            app_data: meta.app_data.clone(),
        });
        Verdict::Release
    }

    fn on_datagram(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict {
        if ctx.store.packet(handle).destination == path_request_destination() {
            return self.handle_path_request(ctx, handle, None);
        }
        deliver_datagram(ctx, handle)
    }

    fn on_reply(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict {
        let pkt = ctx.store.packet(handle);
        ctx.events.push_back(MeshEvent::Reply {
            packet_hash: *pkt.destination.as_bytes(),
            payload: pkt.payload().to_vec(),
        });
        Verdict::Release
    }

    fn on_reply_signed(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict {
        deliver_verified_reply(ctx, handle);
        Verdict::Release
    }

    fn accept_signed_reply(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> bool {
        signed_reply_gate(ctx, handle)
    }

    fn prepare_local_announce(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) {
        register_local_announce(ctx, handle);
    }

    fn prepare_local_datagram(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) {
        register_local_datagram(ctx, handle);
    }

    fn on_announce_observed(&mut self, ctx: &mut NodeCtx<'_>, _handle: Handle, meta: &AnnounceMeta) {
        let confirmed = self
            .pending
            .as_ref()
            .is_some_and(|p| !p.cancelled && p.destination == meta.destination && meta.hops > 0);
        if confirmed {
            debug!(dest = %meta.destination, hops = meta.hops, "announce confirmed by rebroadcast");
            self.cancel_confirm(ctx);
        }

        // a copy of this flood is already queued and no better: drop it
        let pending_handle = self.pending.as_ref().map(|p| p.handle);
        let mut idx = 0;
        while let Some(queued) = ctx.store.outbound_at(idx) {
            if Some(queued) != pending_handle {
                let pkt = ctx.store.packet(queued);
                if pkt.packet_type() == Some(PacketType::Announce)
                    && pkt.destination == meta.destination
                    && pkt.hops >= meta.hops
                {
                    debug!(dest = %meta.destination, "flood already covered, dropping queued announce");
                    ctx.store.remove_outbound_at(idx);
                    ctx.store.release(queued);
                    return;
                }
            }
            idx += 1;
        }
    }

    fn on_packet_sent(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> SentAction {
        let Some(pending) = self.pending.as_mut() else {
            return SentAction::Release;
        };
        if pending.handle != handle {
            return SentAction::Release;
        }
        if pending.cancelled {
            self.pending = None;
            return SentAction::Release;
        }
        pending.deadline_ms = future_millis(ctx.now_ms, pending.interval_secs.saturating_mul(1_000));
        pending.interval_secs = pending.interval_secs.saturating_mul(4) / 3;
        pending.held = true;
        debug!(
            dest = %pending.destination,
            next_interval_secs = pending.interval_secs,
            "announce held until confirmed"
        );
        SentAction::Hold
    }

    fn send_announce(
        &mut self,
        ctx: &mut NodeCtx<'_>,
        handle: Handle,
        priority: u8,
        delay_ms: u32,
        confirm_secs: u32,
    ) {
        self.cancel_confirm(ctx);
        if confirm_secs > 0 {
            let destination = ctx.store.packet(handle).destination;
            self.pending = Some(AnnounceConfirm {
                handle,
                destination,
                priority,
                interval_secs: confirm_secs,
                deadline_ms: 0,
                held: false,
                cancelled: false,
            });
        }
        let at = future_millis(ctx.now_ms, delay_ms);
        if !ctx.store.queue_outbound(handle, priority, at) {
            error!("cannot queue announce, queue full");
            ctx.store.release(handle);
            self.pending = None;
        }
    }

    fn cancel_announce_confirm(&mut self, ctx: &mut NodeCtx<'_>) {
        self.cancel_confirm(ctx);
    }

    fn awaiting_announce_confirm(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| !p.cancelled)
    }

    fn tick(&mut self, ctx: &mut NodeCtx<'_>) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if !pending.held || pending.cancelled {
            return;
        }
        if !millis_has_passed(ctx.now_ms, pending.deadline_ms) {
            return;
        }
        pending.held = false;
        debug!(dest = %pending.destination, "re-sending unconfirmed announce");
        if !ctx.store.queue_outbound(pending.handle, pending.priority, ctx.now_ms) {
            error!("cannot requeue announce, queue full");
            ctx.store.release(pending.handle);
            self.pending = None;
        }
    }
}

/// Routing for a store-and-forward node.
pub struct RelayRouting {
    edge: EdgeRouting,
    /// This relay's transport address, written into forwarded packets.
    transport: Destination,
    max_hops: u8,
    budget_factor: f32,
}

impl RelayRouting {
    pub fn new(identity: &LocalIdentity) -> Self {
        Self {
            edge: EdgeRouting::new(),
            transport: transport_destination(&identity.identity()),
            max_hops: DEFAULT_MAX_HOPS,
            budget_factor: DEFAULT_AIRTIME_FACTOR,
        }
    }

    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_airtime_budget_factor(mut self, factor: f32) -> Self {
        self.budget_factor = factor;
        self
    }

    pub fn transport(&self) -> Destination {
        self.transport
    }
}

impl RoutingStrategy for RelayRouting {
    fn on_announce(
        &mut self,
        ctx: &mut NodeCtx<'_>,
        handle: Handle,
        meta: &AnnounceMeta,
    ) -> Verdict {
        let now = ctx.now_secs;
        let updated = ctx.tables.update_next_hop(ctx.store.packet(handle), now);
        ctx.stats.announces_processed += 1;
        ctx.events.push_back(MeshEvent::Announce {
            destination: meta.destination,
            identity: meta.identity,
            hops: meta.hops,
            app_data: meta.app_data.clone(),
        });

        if !updated || ctx.tables.has_forwarded(&meta.rand_blob) {
            ctx.stats.duplicates_dropped += 1;
            debug!(dest = %meta.destination, "announce already covered, not rebroadcast");
            return Verdict::Release;
        }
        ctx.tables.set_forwarded(&meta.rand_blob);
        if meta.hops >= self.max_hops {
            debug!(dest = %meta.destination, hops = meta.hops, "hop limit reached");
            return Verdict::Release;
        }

        ctx.store.packet_mut(handle).set_transport(self.transport);
        let delay_ms = ctx
            .rng
            .next_in_range(REBROADCAST_DELAY_MIN_MS, REBROADCAST_DELAY_MAX_MS);
        ctx.stats.announces_rebroadcast += 1;
        Verdict::Retransmit {
            priority: 2u8.saturating_add(meta.hops),
            delay_ms,
        }
    }

    fn on_datagram(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict {
        let (destination, routed_here, keep_path, hash) = {
            let pkt = ctx.store.packet(handle);
            (
                pkt.destination,
                pkt.header.has_transport() && pkt.transport_id == self.transport,
                pkt.header.keep_path(),
                pkt.packet_hash(),
            )
        };

        if destination == self.transport {
            ctx.tables.set_seen_status(hash, SeenStatus::Seen);
            return deliver_datagram(ctx, handle);
        }

        if routed_here {
            if let Some(next) = ctx.tables.next_hop(&destination, ctx.now_secs) {
                // next == destination collapses at send time
                ctx.store.packet_mut(handle).set_transport(next);
                if keep_path {
                    ctx.tables.set_correlated_dest(hash, destination);
                    ctx.tables
                        .set_seen_status(hash, SeenStatus::AwaitingReplyRelay);
                } else {
                    ctx.tables.set_seen_status(hash, SeenStatus::Seen);
                }
                ctx.stats.datagrams_forwarded += 1;
                debug!(dest = %destination, next = %next, "forwarding datagram");
                return Verdict::Retransmit {
                    priority: 0,
                    delay_ms: 0,
                };
            }
            debug!(dest = %destination, "no path for routed datagram");
            ctx.tables.set_seen_status(hash, SeenStatus::Seen);
        }

        if destination == path_request_destination() {
            return self
                .edge
                .handle_path_request(ctx, handle, Some(self.transport));
        }
        deliver_datagram(ctx, handle)
    }

    fn on_reply(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict {
        let hash: PacketHash = *ctx.store.packet(handle).destination.as_bytes();
        if ctx.tables.seen_status(&hash) == SeenStatus::AwaitingReplyRelay {
            ctx.tables.set_seen_status(hash, SeenStatus::Seen);
            ctx.stats.replies_relayed += 1;
            debug!(hash = %hex::encode(hash), "relaying reply along reverse hop");
            return Verdict::Retransmit {
                priority: 3,
                delay_ms: 0,
            };
        }
        self.edge.on_reply(ctx, handle)
    }

    fn on_reply_signed(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict {
        // the gate cleared the correlation, so this relays exactly once
        deliver_verified_reply(ctx, handle);
        ctx.stats.replies_relayed += 1;
        Verdict::Retransmit {
            priority: 1,
            delay_ms: 0,
        }
    }

    fn accept_signed_reply(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> bool {
        self.edge.accept_signed_reply(ctx, handle)
    }

    fn prepare_local_announce(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) {
        self.edge.prepare_local_announce(ctx, handle);
    }

    fn prepare_local_datagram(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) {
        self.edge.prepare_local_datagram(ctx, handle);
    }

    fn airtime_budget_factor(&self) -> f32 {
        self.budget_factor
    }

    fn wants_all_announces(&self) -> bool {
        true
    }

    fn on_announce_observed(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle, meta: &AnnounceMeta) {
        self.edge.on_announce_observed(ctx, handle, meta);
    }

    fn on_packet_sent(&mut self, ctx: &mut NodeCtx<'_>, handle: Handle) -> SentAction {
        self.edge.on_packet_sent(ctx, handle)
    }

    fn send_announce(
        &mut self,
        ctx: &mut NodeCtx<'_>,
        handle: Handle,
        priority: u8,
        delay_ms: u32,
        confirm_secs: u32,
    ) {
        self.edge
            .send_announce(ctx, handle, priority, delay_ms, confirm_secs);
    }

    fn cancel_announce_confirm(&mut self, ctx: &mut NodeCtx<'_>) {
        self.edge.cancel_announce_confirm(ctx);
    }

    fn awaiting_announce_confirm(&self) -> bool {
        self.edge.awaiting_announce_confirm()
    }

    fn tick(&mut self, ctx: &mut NodeCtx<'_>) {
        self.edge.tick(ctx);
    }
}

fn deliver_datagram(ctx: &mut NodeCtx<'_>, handle: Handle) -> Verdict {
    let pkt = ctx.store.packet(handle);
    ctx.events.push_back(MeshEvent::Datagram {
        destination: pkt.destination,
        packet_hash: pkt.packet_hash(),
        payload: pkt.payload().to_vec(),
        wants_reply: pkt.header.keep_path(),
        hops: pkt.hops,
    });
    Verdict::Release
}

fn deliver_verified_reply(ctx: &mut NodeCtx<'_>, handle: Handle) {
    let pkt = ctx.store.packet(handle);
    ctx.events.push_back(MeshEvent::ReplyVerified {
        packet_hash: *pkt.destination.as_bytes(),
        payload: pkt.payload().get(SIGNATURE_LEN..).unwrap_or(&[]).to_vec(),
        hops: pkt.hops,
    });
}

/// Table work for a locally created announce: remember our own rand blob
/// and cache our own path, which also lets us answer path requests for
/// ourselves.
fn register_local_announce(ctx: &mut NodeCtx<'_>, handle: Handle) {
    let now = ctx.now_secs;
    if let Some(view) = ctx.store.packet(handle).announce_view() {
        let blob = *view.rand_blob;
        ctx.tables.set_forwarded(&blob);
    }
    ctx.tables.update_next_hop(ctx.store.packet(handle), now);
}

/// Table work for a locally created datagram: route it along the cached
/// path and record what its hash means to us.
fn register_local_datagram(ctx: &mut NodeCtx<'_>, handle: Handle) {
    let (hash, destination, keep_path) = {
        let pkt = ctx.store.packet(handle);
        (pkt.packet_hash(), pkt.destination, pkt.header.keep_path())
    };
    match ctx.tables.next_hop(&destination, ctx.now_secs) {
        Some(next) => {
            if next != destination {
                ctx.store.packet_mut(handle).set_transport(next);
            }
            if keep_path {
                ctx.tables.set_correlated_dest(hash, destination);
                ctx.tables
                    .set_seen_status(hash, SeenStatus::AwaitingReplyRelay);
            } else {
                ctx.tables.set_seen_status(hash, SeenStatus::Seen);
            }
        }
        None => {
            // no path; it still floods, but our own echo must not loop
            ctx.tables.set_seen_status(hash, SeenStatus::Seen);
        }
    }
}

/// Accept a signed reply only when the signature checks out against the
/// cached announce of the destination this hash was correlated to. On
/// success the correlation is consumed.
fn signed_reply_gate(ctx: &mut NodeCtx<'_>, handle: Handle) -> bool {
    let hash: PacketHash = {
        let pkt = ctx.store.packet(handle);
        if pkt.payload().len() < SIGNATURE_LEN {
            warn!("signed reply too short");
            return false;
        }
        *pkt.destination.as_bytes()
    };

    let Some(source) = ctx.tables.correlated_dest(&hash) else {
        debug!(hash = %hex::encode(hash), "signed reply for unknown packet hash");
        return false;
    };
    let pub_key = {
        let Some((announce, _)) = ctx.tables.orig_announce(&source) else {
            debug!(dest = %source, "path no longer known, cannot verify reply");
            return false;
        };
        match announce.announce_view() {
            Some(view) => *view.pub_key,
            None => return false,
        }
    };

    let identity = Identity::from_bytes(pub_key);
    if !crate::mesh::verify_reply_signed(ctx.store.packet(handle), &identity) {
        warn!(%identity, "signed reply failed verification");
        ctx.stats.forged_drops += 1;
        return false;
    }
    ctx.tables.clear_correlated_dest(&hash);
    true
}
