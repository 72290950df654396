//! Fixed-capacity packet storage and the outbound queue.
//!
//! Packets live in a preallocated arena and move around as [`Handle`]s.
//! The outbound queue holds handles with a priority and an earliest send
//! time; [`PacketStore::next_outbound`] pops the most urgent eligible
//! entry. Lower priority values send first.

use tracing::{error, warn};

use crate::packet::Packet;

/// Index of a pooled packet. Only valid against the store that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u16);

impl Handle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Packet arena plus outbound queue.
///
/// `now_ms` arguments are a wrapping millisecond clock; an entry is
/// eligible once `now_ms` has passed its scheduled time, wraparound
/// included.
pub trait PacketStore {
    /// Grab a free packet, reset for reuse. None when the pool is empty.
    fn alloc(&mut self) -> Option<Handle>;

    /// Return a packet to the pool. Releasing a queued packet dequeues it.
    fn release(&mut self, handle: Handle);

    fn packet(&self, handle: Handle) -> &Packet;

    fn packet_mut(&mut self, handle: Handle) -> &mut Packet;

    /// Queue for sending no earlier than `scheduled_for`. Returns false
    /// when the queue is full; the caller still owns the handle.
    fn queue_outbound(&mut self, handle: Handle, priority: u8, scheduled_for: u32) -> bool;

    /// Pop the eligible entry with the lowest priority value, oldest
    /// first among equals.
    fn next_outbound(&mut self, now_ms: u32) -> Option<Handle>;

    fn outbound_count(&self) -> usize;

    fn free_count(&self) -> usize;

    /// Peek at queue position `idx`.
    fn outbound_at(&self, idx: usize) -> Option<Handle>;

    /// Drop the queue entry at `idx` without releasing the packet.
    fn remove_outbound_at(&mut self, idx: usize) -> Option<Handle>;
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    handle: Handle,
    priority: u8,
    scheduled_for: u32,
}

/// In-memory [`PacketStore`] backed by `Vec`s.
pub struct ArenaPacketStore {
    slots: Vec<Packet>,
    in_use: Vec<bool>,
    free: Vec<u16>,
    queue: Vec<QueueEntry>,
    queue_capacity: usize,
}

impl ArenaPacketStore {
    pub const DEFAULT_CAPACITY: usize = 16;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(slots: usize, queue: usize) -> Self {
        Self {
            slots: vec![Packet::default(); slots],
            in_use: vec![false; slots],
            // free list popped from the back, so low indices go out first
            free: (0..slots as u16).rev().collect(),
            queue: Vec::with_capacity(queue),
            queue_capacity: queue,
        }
    }

    fn queued_position(&self, handle: Handle) -> Option<usize> {
        self.queue.iter().position(|e| e.handle == handle)
    }
}

impl Default for ArenaPacketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketStore for ArenaPacketStore {
    fn alloc(&mut self) -> Option<Handle> {
        let idx = self.free.pop()?;
        self.in_use[idx as usize] = true;
        self.slots[idx as usize].reset();
        Some(Handle(idx))
    }

    fn release(&mut self, handle: Handle) {
        let idx = handle.index();
        if !self.in_use[idx] {
            warn!(slot = idx, "releasing a packet that is already free");
            return;
        }
        if let Some(pos) = self.queued_position(handle) {
            warn!(slot = idx, "releasing a packet that is still queued");
            self.queue.remove(pos);
        }
        self.in_use[idx] = false;
        self.free.push(handle.0);
    }

    fn packet(&self, handle: Handle) -> &Packet {
        &self.slots[handle.index()]
    }

    fn packet_mut(&mut self, handle: Handle) -> &mut Packet {
        &mut self.slots[handle.index()]
    }

    fn queue_outbound(&mut self, handle: Handle, priority: u8, scheduled_for: u32) -> bool {
        if self.queue.len() >= self.queue_capacity {
            error!(
                slot = handle.index(),
                priority, "outbound queue full, cannot queue packet"
            );
            return false;
        }
        self.queue.push(QueueEntry {
            handle,
            priority,
            scheduled_for,
        });
        true
    }

    fn next_outbound(&mut self, now_ms: u32) -> Option<Handle> {
        let mut best: Option<usize> = None;
        for (i, entry) in self.queue.iter().enumerate() {
            if (now_ms.wrapping_sub(entry.scheduled_for) as i32) < 0 {
                continue;
            }
            match best {
                Some(b) if self.queue[b].priority <= entry.priority => {}
                _ => best = Some(i),
            }
        }
        best.map(|i| self.queue.remove(i).handle)
    }

    fn outbound_count(&self) -> usize {
        self.queue.len()
    }

    fn free_count(&self) -> usize {
        self.free.len()
    }

    fn outbound_at(&self, idx: usize) -> Option<Handle> {
        self.queue.get(idx).map(|e| e.handle)
    }

    fn remove_outbound_at(&mut self, idx: usize) -> Option<Handle> {
        if idx < self.queue.len() {
            Some(self.queue.remove(idx).handle)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    #[test]
    fn alloc_until_exhausted() {
        let mut store = ArenaPacketStore::with_capacity(2, 2);
        assert_eq!(store.free_count(), 2);

        let a = store.alloc().unwrap();
        let b = store.alloc().unwrap();
        assert_ne!(a, b);
        assert!(store.alloc().is_none());

        store.release(a);
        assert_eq!(store.free_count(), 1);
        assert!(store.alloc().is_some());
    }

    #[test]
    fn alloc_resets_slot() {
        let mut store = ArenaPacketStore::with_capacity(1, 1);
        let h = store.alloc().unwrap();
        *store.packet_mut(h) = Packet::new(PacketType::Reply);
        store.packet_mut(h).hops = 9;
        store.release(h);

        let h = store.alloc().unwrap();
        assert_eq!(store.packet(h).hops, 0);
        assert_eq!(store.packet(h).packet_type(), Some(PacketType::Data));
    }

    #[test]
    fn double_release_is_a_noop() {
        let mut store = ArenaPacketStore::with_capacity(2, 2);
        let h = store.alloc().unwrap();
        store.release(h);
        store.release(h);
        assert_eq!(store.free_count(), 2);
    }

    #[test]
    fn queue_respects_schedule_and_priority() {
        let mut store = ArenaPacketStore::with_capacity(4, 4);
        let urgent = store.alloc().unwrap();
        let relaxed = store.alloc().unwrap();
        let later = store.alloc().unwrap();

        assert!(store.queue_outbound(relaxed, 5, 100));
        assert!(store.queue_outbound(urgent, 0, 100));
        assert!(store.queue_outbound(later, 0, 5_000));

        // nothing eligible yet
        assert!(store.next_outbound(50).is_none());

        // both at t=100 eligible, lowest priority value wins
        assert_eq!(store.next_outbound(100), Some(urgent));
        assert_eq!(store.next_outbound(100), Some(relaxed));
        assert!(store.next_outbound(100).is_none());

        assert_eq!(store.next_outbound(5_000), Some(later));
    }

    #[test]
    fn equal_priority_pops_oldest_first() {
        let mut store = ArenaPacketStore::with_capacity(3, 3);
        let first = store.alloc().unwrap();
        let second = store.alloc().unwrap();
        store.queue_outbound(first, 2, 0);
        store.queue_outbound(second, 2, 0);

        assert_eq!(store.next_outbound(10), Some(first));
        assert_eq!(store.next_outbound(10), Some(second));
    }

    #[test]
    fn schedule_survives_clock_wraparound() {
        let mut store = ArenaPacketStore::with_capacity(1, 1);
        let h = store.alloc().unwrap();
        // scheduled just before the u32 clock wraps
        store.queue_outbound(h, 0, u32::MAX - 10);

        assert!(store.next_outbound(u32::MAX - 20).is_none());
        assert_eq!(store.next_outbound(5), Some(h));
    }

    #[test]
    fn queue_full_rejects_and_caller_keeps_handle() {
        let mut store = ArenaPacketStore::with_capacity(3, 1);
        let a = store.alloc().unwrap();
        let b = store.alloc().unwrap();

        assert!(store.queue_outbound(a, 0, 0));
        assert!(!store.queue_outbound(b, 0, 0));
        assert_eq!(store.outbound_count(), 1);

        // b is still alive and usable
        store.packet_mut(b).hops = 1;
        store.release(b);
    }

    #[test]
    fn releasing_a_queued_packet_dequeues_it() {
        let mut store = ArenaPacketStore::with_capacity(2, 2);
        let h = store.alloc().unwrap();
        store.queue_outbound(h, 0, 0);
        store.release(h);

        assert_eq!(store.outbound_count(), 0);
        assert!(store.next_outbound(100).is_none());
    }

    #[test]
    fn queue_inspection_by_index() {
        let mut store = ArenaPacketStore::with_capacity(3, 3);
        let a = store.alloc().unwrap();
        let b = store.alloc().unwrap();
        store.queue_outbound(a, 0, 0);
        store.queue_outbound(b, 1, 0);

        assert_eq!(store.outbound_at(0), Some(a));
        assert_eq!(store.outbound_at(1), Some(b));
        assert!(store.outbound_at(2).is_none());

        assert_eq!(store.remove_outbound_at(0), Some(a));
        assert_eq!(store.outbound_at(0), Some(b));
        assert!(store.remove_outbound_at(5).is_none());
    }
}
