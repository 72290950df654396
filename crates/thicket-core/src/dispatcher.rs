//! Radio dispatch: one frame in flight, airtime budgeting, receive
//! buffering.
//!
//! The dispatcher owns the radio and the millisecond clock. Each tick it
//! is polled three ways: finish the in-flight send, drain one received
//! frame into the pool, and start the next queued send. After every send
//! it blocks transmission for the measured airtime multiplied by the
//! routing strategy's budget factor, which caps duty cycle without
//! tracking a window.
//!
//! All times are wrapping `u32` milliseconds, safe across the 49-day
//! rollover.

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::packet::Packet;
use crate::pool::{Handle, PacketStore};
use crate::traits::{MillisClock, Radio};

/// Default airtime budget: after a send, stay quiet for five times the
/// airtime spent, a 1/6 duty cycle.
pub const DEFAULT_AIRTIME_FACTOR: f32 = 5.0;

/// Has the wrapping millisecond clock passed `t`?
pub fn millis_has_passed(now: u32, t: u32) -> bool {
    now.wrapping_sub(t) as i32 > 0
}

/// A wrapping `delta_ms` from now.
pub fn future_millis(now: u32, delta_ms: u32) -> u32 {
    now.wrapping_add(delta_ms)
}

/// What a routing strategy wants done with a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Done with it, return it to the pool.
    Release,
    /// The strategy keeps the handle and releases it later.
    Hold,
    /// Queue it for sending after `delay_ms`.
    Retransmit { priority: u8, delay_ms: u32 },
}

/// What a routing strategy wants done with a packet that finished sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentAction {
    Release,
    Hold,
}

/// Outcome of polling the in-flight send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPoll {
    /// Nothing in flight.
    Idle,
    /// Still transmitting.
    InFlight,
    /// Finished; the handle is back in the caller's hands.
    Sent(Handle),
    /// The radio never signalled completion; the packet was dropped.
    TimedOut,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DispatcherStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_timeouts: u64,
    /// Frames dropped because the pool had no free packet.
    pub recv_pool_drops: u64,
    pub malformed_drops: u64,
    /// Retransmits dropped because the outbound queue was full.
    pub queue_drops: u64,
    pub total_air_time_ms: u64,
}

/// Drives one radio. Generic over the radio and clock so the same code
/// runs against hardware and the simulated bus.
pub struct Dispatcher<R, C> {
    radio: R,
    clock: C,
    /// When set, every frame is prefixed with this node id byte and
    /// received frames carry the sender's. Simulation only.
    sim_id: Option<u8>,
    outbound: Option<Handle>,
    outbound_start: u32,
    outbound_expiry: u32,
    next_tx_time: u32,
    stats: DispatcherStats,
    recv_buf: [u8; 256],
}

impl<R: Radio, C: MillisClock> Dispatcher<R, C> {
    pub fn new(radio: R, clock: C) -> Self {
        Self {
            radio,
            clock,
            sim_id: None,
            outbound: None,
            outbound_start: 0,
            outbound_expiry: 0,
            next_tx_time: 0,
            stats: DispatcherStats::default(),
            recv_buf: [0; 256],
        }
    }

    pub fn set_sim_id(&mut self, id: u8) {
        self.sim_id = Some(id);
    }

    pub fn begin(&mut self) {
        self.radio.begin();
    }

    pub fn now(&self) -> u32 {
        self.clock.millis()
    }

    pub fn is_sending(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Advance the in-flight send, if any.
    ///
    /// On completion the handle is handed back as [`SendPoll::Sent`]; the
    /// caller decides whether to release or keep it. A send that outlives
    /// its expiry is abandoned and released here.
    pub fn poll_send(&mut self, store: &mut dyn PacketStore, airtime_factor: f32) -> SendPoll {
        let Some(handle) = self.outbound else {
            return SendPoll::Idle;
        };
        let now = self.now();

        if self.radio.is_send_complete() {
            let air_ms = now.wrapping_sub(self.outbound_start);
            self.stats.packets_sent += 1;
            self.stats.total_air_time_ms += u64::from(air_ms);
            self.next_tx_time = future_millis(now, (air_ms as f32 * airtime_factor) as u32);
            self.radio.on_send_finished();
            self.outbound = None;
            debug!(slot = handle.index(), air_ms, "send complete");
            return SendPoll::Sent(handle);
        }

        if millis_has_passed(now, self.outbound_expiry) {
            warn!(slot = handle.index(), "timed out waiting for packet send");
            self.stats.send_timeouts += 1;
            self.radio.on_send_finished();
            self.outbound = None;
            store.release(handle);
            return SendPoll::TimedOut;
        }

        SendPoll::InFlight
    }

    /// Pull one frame from the radio into a pooled packet.
    pub fn poll_recv(&mut self, store: &mut dyn PacketStore) -> Option<Handle> {
        let len = self.radio.recv_raw(&mut self.recv_buf);
        if len == 0 {
            return None;
        }
        let mut frame = &self.recv_buf[..len];
        if self.sim_id.is_some() && !frame.is_empty() {
            trace!(source = frame[0], "frame from simulated node");
            frame = &frame[1..];
        }

        let packet = match Packet::from_wire(frame) {
            Ok(p) => p,
            Err(err) => {
                warn!(%err, len, "dropping malformed frame");
                self.stats.malformed_drops += 1;
                return None;
            }
        };

        let Some(handle) = store.alloc() else {
            warn!("no unused packets available, dropping frame");
            self.stats.recv_pool_drops += 1;
            return None;
        };
        *store.packet_mut(handle) = packet;
        self.stats.packets_received += 1;
        Some(handle)
    }

    /// Carry out a routing verdict for `handle`.
    pub fn apply_verdict(&mut self, store: &mut dyn PacketStore, handle: Handle, verdict: Verdict) {
        match verdict {
            Verdict::Release => store.release(handle),
            Verdict::Hold => {}
            Verdict::Retransmit { priority, delay_ms } => {
                let at = future_millis(self.now(), delay_ms);
                if !store.queue_outbound(handle, priority, at) {
                    error!(slot = handle.index(), "dropping packet, queue full");
                    self.stats.queue_drops += 1;
                    store.release(handle);
                }
            }
        }
    }

    /// Start sending the most urgent eligible queued packet, if the
    /// airtime budget allows and the radio is free.
    pub fn start_next_send(&mut self, store: &mut dyn PacketStore) -> bool {
        if self.outbound.is_some() || store.outbound_count() == 0 {
            return false;
        }
        let now = self.now();
        if !millis_has_passed(now, self.next_tx_time) {
            return false;
        }
        if self.radio.is_receiving() {
            return false;
        }
        let Some(handle) = store.next_outbound(now) else {
            return false;
        };

        // a transport hop equal to the destination is a no-op, drop it
        {
            let packet = store.packet_mut(handle);
            if packet.header.has_transport() && packet.transport_id == packet.destination {
                packet.clear_transport();
            }
        }

        let mut frame = Vec::with_capacity(Packet::MAX_WIRE);
        if let Some(id) = self.sim_id {
            frame.push(id);
        }
        store.packet(handle).to_wire(&mut frame);
        if frame.len() > Packet::MAX_WIRE {
            error!(len = frame.len(), "encoded frame too large, dropping");
            store.release(handle);
            return false;
        }

        let est_ms = self.radio.est_airtime_ms(frame.len());
        self.outbound = Some(handle);
        self.outbound_start = now;
        self.outbound_expiry = future_millis(now, est_ms.saturating_mul(3) / 2);
        self.radio.start_send_raw(&frame);
        debug!(
            slot = handle.index(),
            len = frame.len(),
            est_ms,
            "send started"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::packet::PacketType;
    use crate::pool::ArenaPacketStore;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct RadioState {
        rx: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        complete: bool,
        receiving: bool,
    }

    #[derive(Clone, Default)]
    struct TestRadio(Rc<RefCell<RadioState>>);

    impl Radio for TestRadio {
        fn recv_raw(&mut self, buf: &mut [u8]) -> usize {
            match self.0.borrow_mut().rx.pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    frame.len()
                }
                None => 0,
            }
        }

        fn est_airtime_ms(&self, len: usize) -> u32 {
            len as u32
        }

        fn start_send_raw(&mut self, data: &[u8]) {
            let mut state = self.0.borrow_mut();
            state.sent.push(data.to_vec());
            state.complete = false;
        }

        fn is_send_complete(&self) -> bool {
            self.0.borrow().complete
        }

        fn is_receiving(&self) -> bool {
            self.0.borrow().receiving
        }
    }

    #[derive(Clone, Default)]
    struct TestClock(Rc<Cell<u32>>);

    impl MillisClock for TestClock {
        fn millis(&self) -> u32 {
            self.0.get()
        }
    }

    fn data_packet(dest: u8, payload: &[u8]) -> Packet {
        let mut pkt = Packet::new(PacketType::Data);
        pkt.destination = Destination::from_bytes([dest; 8]);
        pkt.set_payload(payload).unwrap();
        pkt
    }

    fn setup() -> (Dispatcher<TestRadio, TestClock>, TestRadio, TestClock) {
        let radio = TestRadio::default();
        let clock = TestClock::default();
        let dispatcher = Dispatcher::new(radio.clone(), clock.clone());
        (dispatcher, radio, clock)
    }

    #[test]
    fn millis_helpers_wrap() {
        assert!(millis_has_passed(10, 5));
        assert!(!millis_has_passed(5, 10));
        assert!(!millis_has_passed(5, 5));
        // just past a schedule set before rollover
        assert!(millis_has_passed(3, u32::MAX - 10));
        assert_eq!(future_millis(u32::MAX - 1, 4), 2);
    }

    #[test]
    fn idle_dispatcher_does_nothing() {
        let (mut d, _radio, _clock) = setup();
        let mut store = ArenaPacketStore::new();
        assert_eq!(d.poll_send(&mut store, 5.0), SendPoll::Idle);
        assert!(d.poll_recv(&mut store).is_none());
        assert!(!d.start_next_send(&mut store));
    }

    #[test]
    fn receives_a_frame_into_the_pool() {
        let (mut d, radio, _clock) = setup();
        let mut store = ArenaPacketStore::new();

        let pkt = data_packet(1, b"ping");
        let mut raw = Vec::new();
        pkt.to_wire(&mut raw);
        radio.0.borrow_mut().rx.push_back(raw);

        let h = d.poll_recv(&mut store).unwrap();
        assert_eq!(*store.packet(h), pkt);
        assert_eq!(d.stats().packets_received, 1);
    }

    #[test]
    fn strips_simulated_sender_byte() {
        let (mut d, radio, _clock) = setup();
        d.set_sim_id(7);
        let mut store = ArenaPacketStore::new();

        let pkt = data_packet(2, b"x");
        let mut raw = vec![3u8];
        pkt.to_wire(&mut raw);
        radio.0.borrow_mut().rx.push_back(raw);

        let h = d.poll_recv(&mut store).unwrap();
        assert_eq!(*store.packet(h), pkt);
    }

    #[test]
    fn malformed_and_overflow_frames_drop() {
        let (mut d, radio, _clock) = setup();
        let mut store = ArenaPacketStore::with_capacity(1, 1);

        radio.0.borrow_mut().rx.push_back(vec![0x07, 0, 1, 2]);
        assert!(d.poll_recv(&mut store).is_none());
        assert_eq!(d.stats().malformed_drops, 1);

        // pool exhausted
        let taken = store.alloc().unwrap();
        let pkt = data_packet(1, b"");
        let mut raw = Vec::new();
        pkt.to_wire(&mut raw);
        radio.0.borrow_mut().rx.push_back(raw);
        assert!(d.poll_recv(&mut store).is_none());
        assert_eq!(d.stats().recv_pool_drops, 1);
        store.release(taken);
    }

    #[test]
    fn send_cycle_tracks_airtime_budget() {
        let (mut d, radio, clock) = setup();
        let mut store = ArenaPacketStore::new();

        let h = store.alloc().unwrap();
        *store.packet_mut(h) = data_packet(1, b"hello");
        assert!(store.queue_outbound(h, 0, 0));

        // the clock starts at 0 and nothing may send until it moves
        assert!(!d.start_next_send(&mut store));
        clock.0.set(1);
        assert!(d.start_next_send(&mut store));
        assert!(d.is_sending());
        assert_eq!(radio.0.borrow().sent.len(), 1);

        assert_eq!(d.poll_send(&mut store, 5.0), SendPoll::InFlight);

        // 10 ms on air, then complete
        clock.0.set(11);
        radio.0.borrow_mut().complete = true;
        assert_eq!(d.poll_send(&mut store, 5.0), SendPoll::Sent(h));
        assert_eq!(d.stats().packets_sent, 1);
        assert_eq!(d.stats().total_air_time_ms, 10);
        store.release(h);

        // budget factor 5: quiet until 11 + 50 has passed
        let h2 = store.alloc().unwrap();
        *store.packet_mut(h2) = data_packet(2, b"again");
        store.queue_outbound(h2, 0, 0);
        clock.0.set(61);
        assert!(!d.start_next_send(&mut store));
        clock.0.set(62);
        assert!(d.start_next_send(&mut store));
    }

    #[test]
    fn stuck_send_times_out_and_releases() {
        let (mut d, _radio, clock) = setup();
        let mut store = ArenaPacketStore::new();
        let free_before = store.free_count();

        let h = store.alloc().unwrap();
        *store.packet_mut(h) = data_packet(1, b"stuck");
        store.queue_outbound(h, 0, 0);
        clock.0.set(1);
        assert!(d.start_next_send(&mut store));

        // est airtime = frame len; expiry is 1.5x that
        let expiry = 1 + (2 + 8 + 5) * 3 / 2;
        clock.0.set(expiry);
        assert_eq!(d.poll_send(&mut store, 5.0), SendPoll::InFlight);
        clock.0.set(expiry + 1);
        assert_eq!(d.poll_send(&mut store, 5.0), SendPoll::TimedOut);
        assert_eq!(d.stats().send_timeouts, 1);
        assert_eq!(store.free_count(), free_before);
    }

    #[test]
    fn collapses_transport_equal_to_destination() {
        let (mut d, radio, clock) = setup();
        let mut store = ArenaPacketStore::new();

        let h = store.alloc().unwrap();
        let mut pkt = data_packet(4, b"direct");
        pkt.set_transport(Destination::from_bytes([4; 8]));
        *store.packet_mut(h) = pkt;
        store.queue_outbound(h, 0, 0);

        clock.0.set(1);
        assert!(d.start_next_send(&mut store));
        let frame = radio.0.borrow().sent[0].clone();
        assert_eq!(frame[0] & 0x80, 0);
        assert_eq!(frame.len(), 2 + 8 + 6);
    }

    #[test]
    fn receiving_radio_defers_send() {
        let (mut d, radio, clock) = setup();
        let mut store = ArenaPacketStore::new();

        let h = store.alloc().unwrap();
        *store.packet_mut(h) = data_packet(1, b"wait");
        store.queue_outbound(h, 0, 0);

        clock.0.set(1);
        radio.0.borrow_mut().receiving = true;
        assert!(!d.start_next_send(&mut store));
        radio.0.borrow_mut().receiving = false;
        assert!(d.start_next_send(&mut store));
    }

    #[test]
    fn retransmit_verdict_queues_with_delay() {
        let (mut d, _radio, clock) = setup();
        let mut store = ArenaPacketStore::new();
        clock.0.set(100);

        let h = store.alloc().unwrap();
        d.apply_verdict(
            &mut store,
            h,
            Verdict::Retransmit {
                priority: 2,
                delay_ms: 50,
            },
        );
        assert_eq!(store.outbound_count(), 1);
        assert!(store.next_outbound(149).is_none());
        assert_eq!(store.next_outbound(150), Some(h));

        d.apply_verdict(&mut store, h, Verdict::Release);
        assert_eq!(store.free_count(), ArenaPacketStore::DEFAULT_CAPACITY);
    }

    #[test]
    fn retransmit_into_full_queue_releases() {
        let (mut d, _radio, _clock) = setup();
        let mut store = ArenaPacketStore::with_capacity(2, 1);

        let filler = store.alloc().unwrap();
        store.queue_outbound(filler, 0, 0);
        let h = store.alloc().unwrap();
        d.apply_verdict(
            &mut store,
            h,
            Verdict::Retransmit {
                priority: 0,
                delay_ms: 0,
            },
        );
        assert_eq!(store.outbound_count(), 1);
        assert_eq!(store.free_count(), 1);
        assert_eq!(d.stats().queue_drops, 1);
    }
}
