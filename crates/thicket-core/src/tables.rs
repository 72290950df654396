//! Routing state: duplicate suppression, reply correlation and cached
//! paths.
//!
//! Everything is bounded. The blob, hash and correlation tables are rings
//! that overwrite their oldest entry when full; the path table evicts the
//! entry that was least recently used to route a packet. Timestamps are
//! epoch seconds from the node's RTC and arrive as arguments, which keeps
//! the tables clock-free and easy to drive from tests.

use serde::{Deserialize, Serialize};

use crate::destination::Destination;
use crate::packet::{Packet, PacketHash};

/// How long an established path stays open to same-timestamp improvements.
///
/// A rebroadcast of the announce we already hold can still replace the
/// stored path within this window if it arrived over fewer hops.
pub const LATE_ANNOUNCE_SECS: u32 = 60;

/// Tracking state of a packet hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeenStatus {
    #[default]
    Unseen,
    Seen,
    /// Seen, and a reply to this hash should be relayed when it comes back.
    AwaitingReplyRelay,
}

/// Capacity of each table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TableLimits {
    pub rand_blobs: usize,
    pub packet_hashes: usize,
    pub correlations: usize,
    pub destinations: usize,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            rand_blobs: 32,
            packet_hashes: 64,
            correlations: 64,
            destinations: 64,
        }
    }
}

/// Shared routing state consulted by the mesh and its routing strategy.
pub trait MeshTables {
    /// Has this announce instance (identified by its rand blob) already
    /// been rebroadcast by this node?
    fn has_forwarded(&self, rand_blob: &[u8; 8]) -> bool;

    fn set_forwarded(&mut self, rand_blob: &[u8; 8]);

    fn seen_status(&self, hash: &PacketHash) -> SeenStatus;

    fn set_seen_status(&mut self, hash: PacketHash, status: SeenStatus);

    /// Destination recorded for a keep-path packet hash, if any.
    fn correlated_dest(&self, hash: &PacketHash) -> Option<Destination>;

    fn set_correlated_dest(&mut self, hash: PacketHash, dest: Destination);

    fn clear_correlated_dest(&mut self, hash: &PacketHash);

    /// Offer an announce to the path table. Returns true when it created
    /// or replaced the cached path for its destination.
    ///
    /// A strictly newer embedded timestamp always wins. The same
    /// timestamp wins only over more hops, and only within
    /// [`LATE_ANNOUNCE_SECS`] of the path being recorded. Anything older
    /// is rejected.
    fn update_next_hop(&mut self, announce: &Packet, now_secs: u32) -> bool;

    /// Path lookup without touching the LRU order.
    fn has_next_hop(&self, dest: &Destination) -> bool;

    /// Where to send a packet for `dest`: the relay that forwarded the
    /// announce to us, or the destination itself when it is a direct
    /// neighbor. Marks the path as used.
    fn next_hop(&mut self, dest: &Destination, now_secs: u32) -> Option<Destination>;

    /// The cached announce for `dest` and the local time its path was
    /// recorded.
    fn orig_announce(&self, dest: &Destination) -> Option<(&Packet, u32)>;

    /// Paths used within the last `max_age_secs`.
    fn active_path_count(&self, now_secs: u32, max_age_secs: u32) -> usize;
}

#[derive(Debug, Clone)]
struct PathEntry {
    destination: Destination,
    announce: Packet,
    /// When this path was recorded.
    create_timestamp: u32,
    /// When this path last routed a packet.
    last_timestamp: u32,
}

/// Heap-backed [`MeshTables`].
pub struct InMemoryTables {
    limits: TableLimits,
    rand_blobs: Vec<[u8; 8]>,
    rand_cursor: usize,
    seen: Vec<(PacketHash, SeenStatus)>,
    seen_cursor: usize,
    correlations: Vec<(PacketHash, Destination)>,
    corr_cursor: usize,
    paths: Vec<PathEntry>,
}

fn ring_insert<T>(ring: &mut Vec<T>, cursor: &mut usize, cap: usize, item: T) {
    if cap == 0 {
        return;
    }
    if ring.len() < cap {
        ring.push(item);
    } else {
        ring[*cursor] = item;
        *cursor = (*cursor + 1) % cap;
    }
}

impl InMemoryTables {
    pub fn new() -> Self {
        Self::with_limits(TableLimits::default())
    }

    pub fn with_limits(limits: TableLimits) -> Self {
        Self {
            limits,
            rand_blobs: Vec::with_capacity(limits.rand_blobs),
            rand_cursor: 0,
            seen: Vec::with_capacity(limits.packet_hashes),
            seen_cursor: 0,
            correlations: Vec::with_capacity(limits.correlations),
            corr_cursor: 0,
            paths: Vec::with_capacity(limits.destinations),
        }
    }

    fn path_entry(&self, dest: &Destination) -> Option<&PathEntry> {
        self.paths.iter().find(|e| e.destination == *dest)
    }
}

impl Default for InMemoryTables {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshTables for InMemoryTables {
    fn has_forwarded(&self, rand_blob: &[u8; 8]) -> bool {
        self.rand_blobs.contains(rand_blob)
    }

    fn set_forwarded(&mut self, rand_blob: &[u8; 8]) {
        ring_insert(
            &mut self.rand_blobs,
            &mut self.rand_cursor,
            self.limits.rand_blobs,
            *rand_blob,
        );
    }

    fn seen_status(&self, hash: &PacketHash) -> SeenStatus {
        self.seen
            .iter()
            .find(|(h, _)| h == hash)
            .map(|(_, s)| *s)
            .unwrap_or(SeenStatus::Unseen)
    }

    fn set_seen_status(&mut self, hash: PacketHash, status: SeenStatus) {
        if let Some(entry) = self.seen.iter_mut().find(|(h, _)| *h == hash) {
            entry.1 = status;
            return;
        }
        ring_insert(
            &mut self.seen,
            &mut self.seen_cursor,
            self.limits.packet_hashes,
            (hash, status),
        );
    }

    fn correlated_dest(&self, hash: &PacketHash) -> Option<Destination> {
        self.correlations
            .iter()
            .find(|(h, _)| *h != [0u8; 8] && h == hash)
            .map(|(_, d)| *d)
    }

    fn set_correlated_dest(&mut self, hash: PacketHash, dest: Destination) {
        ring_insert(
            &mut self.correlations,
            &mut self.corr_cursor,
            self.limits.correlations,
            (hash, dest),
        );
    }

    fn clear_correlated_dest(&mut self, hash: &PacketHash) {
        if let Some(entry) = self
            .correlations
            .iter_mut()
            .find(|(h, _)| *h != [0u8; 8] && h == hash)
        {
            entry.0 = [0u8; 8];
            entry.1 = Destination::UNSET;
        }
    }

    fn update_next_hop(&mut self, announce: &Packet, now_secs: u32) -> bool {
        let Some(view) = announce.announce_view() else {
            return false;
        };
        let timestamp = view.timestamp;
        let dest = announce.destination;

        if let Some(entry) = self.paths.iter_mut().find(|e| e.destination == dest) {
            let stored_ts = entry
                .announce
                .announce_view()
                .map(|v| v.timestamp)
                .unwrap_or(0);
            let better = timestamp > stored_ts
                || (timestamp == stored_ts
                    && announce.hops < entry.announce.hops
                    && now_secs <= entry.create_timestamp.saturating_add(LATE_ANNOUNCE_SECS));
            if better {
                entry.announce = announce.clone();
                entry.create_timestamp = now_secs;
                entry.last_timestamp = now_secs;
            }
            return better;
        }

        let entry = PathEntry {
            destination: dest,
            announce: announce.clone(),
            create_timestamp: now_secs,
            last_timestamp: now_secs,
        };
        if self.paths.len() < self.limits.destinations {
            self.paths.push(entry);
        } else if let Some(oldest) = self.paths.iter_mut().min_by_key(|e| e.last_timestamp) {
            *oldest = entry;
        } else {
            return false;
        }
        true
    }

    fn has_next_hop(&self, dest: &Destination) -> bool {
        self.path_entry(dest).is_some()
    }

    fn next_hop(&mut self, dest: &Destination, now_secs: u32) -> Option<Destination> {
        let entry = self.paths.iter_mut().find(|e| e.destination == *dest)?;
        entry.last_timestamp = now_secs;
        if entry.announce.header.has_transport() {
            Some(entry.announce.transport_id)
        } else {
            Some(entry.announce.destination)
        }
    }

    fn orig_announce(&self, dest: &Destination) -> Option<(&Packet, u32)> {
        self.path_entry(dest)
            .map(|e| (&e.announce, e.create_timestamp))
    }

    fn active_path_count(&self, now_secs: u32, max_age_secs: u32) -> usize {
        let threshold = now_secs.saturating_sub(max_age_secs);
        self.paths
            .iter()
            .filter(|e| e.last_timestamp > threshold)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn announce(dest_byte: u8, hops: u8, timestamp: u32) -> Packet {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[dest_byte; 32]);
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload.extend_from_slice(&[dest_byte; 4]);
        payload.extend_from_slice(&[0; 64]);

        let mut pkt = Packet::new(PacketType::Announce);
        pkt.hops = hops;
        pkt.destination = Destination::from_bytes([dest_byte; 8]);
        pkt.set_payload(&payload).unwrap();
        pkt
    }

    fn small_limits() -> TableLimits {
        TableLimits {
            rand_blobs: 2,
            packet_hashes: 2,
            correlations: 2,
            destinations: 2,
        }
    }

    #[test]
    fn forwarded_blobs_evict_oldest() {
        let mut t = InMemoryTables::with_limits(small_limits());
        t.set_forwarded(&[1; 8]);
        t.set_forwarded(&[2; 8]);
        assert!(t.has_forwarded(&[1; 8]));
        assert!(t.has_forwarded(&[2; 8]));

        t.set_forwarded(&[3; 8]);
        assert!(!t.has_forwarded(&[1; 8]));
        assert!(t.has_forwarded(&[2; 8]));
        assert!(t.has_forwarded(&[3; 8]));
    }

    #[test]
    fn seen_status_updates_in_place() {
        let mut t = InMemoryTables::with_limits(small_limits());
        assert_eq!(t.seen_status(&[7; 8]), SeenStatus::Unseen);

        t.set_seen_status([7; 8], SeenStatus::Seen);
        t.set_seen_status([8; 8], SeenStatus::Seen);
        t.set_seen_status([7; 8], SeenStatus::AwaitingReplyRelay);

        // the in-place update must not consume a second slot
        assert_eq!(t.seen_status(&[7; 8]), SeenStatus::AwaitingReplyRelay);
        assert_eq!(t.seen_status(&[8; 8]), SeenStatus::Seen);
    }

    #[test]
    fn correlations_clear_without_matching_zero() {
        let mut t = InMemoryTables::with_limits(small_limits());
        let dest = Destination::from_bytes([9; 8]);
        t.set_correlated_dest([1; 8], dest);
        assert_eq!(t.correlated_dest(&[1; 8]), Some(dest));

        t.clear_correlated_dest(&[1; 8]);
        assert_eq!(t.correlated_dest(&[1; 8]), None);
        // the zeroed slot must not answer lookups for an all-zero hash
        assert_eq!(t.correlated_dest(&[0; 8]), None);
    }

    #[test]
    fn newer_announce_replaces_path() {
        let mut t = InMemoryTables::new();
        assert!(t.update_next_hop(&announce(1, 3, 100), 1000));
        assert!(t.update_next_hop(&announce(1, 5, 101), 1000));

        let (stored, _) = t.orig_announce(&Destination::from_bytes([1; 8])).unwrap();
        assert_eq!(stored.announce_view().unwrap().timestamp, 101);
        assert_eq!(stored.hops, 5);
    }

    #[test]
    fn older_announce_rejected() {
        let mut t = InMemoryTables::new();
        assert!(t.update_next_hop(&announce(1, 3, 100), 1000));
        assert!(!t.update_next_hop(&announce(1, 0, 99), 1000));

        let (stored, _) = t.orig_announce(&Destination::from_bytes([1; 8])).unwrap();
        assert_eq!(stored.hops, 3);
    }

    #[test]
    fn same_timestamp_fewer_hops_wins_inside_window() {
        let mut t = InMemoryTables::new();
        assert!(t.update_next_hop(&announce(1, 3, 100), 1000));
        assert!(t.update_next_hop(&announce(1, 1, 100), 1000 + LATE_ANNOUNCE_SECS));

        let (stored, created) = t.orig_announce(&Destination::from_bytes([1; 8])).unwrap();
        assert_eq!(stored.hops, 1);
        assert_eq!(created, 1000 + LATE_ANNOUNCE_SECS);
    }

    #[test]
    fn same_timestamp_rejected_outside_window_or_equal_hops() {
        let mut t = InMemoryTables::new();
        assert!(t.update_next_hop(&announce(1, 3, 100), 1000));
        assert!(!t.update_next_hop(&announce(1, 1, 100), 1001 + LATE_ANNOUNCE_SECS));
        assert!(!t.update_next_hop(&announce(1, 3, 100), 1000));
    }

    #[test]
    fn next_hop_prefers_transport_and_touches_entry() {
        let mut t = InMemoryTables::with_limits(small_limits());

        let direct = announce(1, 0, 100);
        let mut relayed = announce(2, 1, 100);
        relayed.set_transport(Destination::from_bytes([0x77; 8]));

        assert!(t.update_next_hop(&direct, 1000));
        assert!(t.update_next_hop(&relayed, 1001));

        assert_eq!(
            t.next_hop(&Destination::from_bytes([1; 8]), 2000),
            Some(Destination::from_bytes([1; 8]))
        );
        assert_eq!(
            t.next_hop(&Destination::from_bytes([2; 8]), 1002),
            Some(Destination::from_bytes([0x77; 8]))
        );
        assert_eq!(t.next_hop(&Destination::from_bytes([3; 8]), 1003), None);

        // the table is full; dest 1 was used most recently, so dest 2 goes
        assert!(t.update_next_hop(&announce(3, 0, 100), 3000));
        assert!(t.has_next_hop(&Destination::from_bytes([1; 8])));
        assert!(!t.has_next_hop(&Destination::from_bytes([2; 8])));
        assert!(t.has_next_hop(&Destination::from_bytes([3; 8])));
    }

    #[test]
    fn has_next_hop_does_not_touch() {
        let mut t = InMemoryTables::with_limits(small_limits());
        assert!(t.update_next_hop(&announce(1, 0, 100), 1000));
        assert!(t.update_next_hop(&announce(2, 0, 100), 1001));

        // inspecting dest 1 must not protect it from eviction
        assert!(t.has_next_hop(&Destination::from_bytes([1; 8])));
        assert!(t.update_next_hop(&announce(3, 0, 100), 2000));
        assert!(!t.has_next_hop(&Destination::from_bytes([1; 8])));
    }

    #[test]
    fn active_path_count_filters_by_age() {
        let mut t = InMemoryTables::new();
        assert!(t.update_next_hop(&announce(1, 0, 100), 1000));
        assert!(t.update_next_hop(&announce(2, 0, 100), 5000));

        assert_eq!(t.active_path_count(5000, 10), 1);
        assert_eq!(t.active_path_count(5000, 4000), 2);
        assert_eq!(t.active_path_count(20_000, 10), 0);
    }
}
