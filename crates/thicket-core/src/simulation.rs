//! Multi-node simulation harness.
//!
//! This module provides everything needed to run a mesh network without
//! hardware: a shared virtual millisecond clock, a deterministic entropy
//! source, a settable wall clock, and a radio bus that models airtime and
//! reachability. It models:
//!
//! - A shared clock that only moves when the test advances it
//! - Per-frame airtime (base cost plus a per-byte cost)
//! - Reachability as an explicit link set, or fully connected by default
//! - Frame injection from outside the bus, for crafting raw traffic
//!
//! Delivery is loss-free: collisions and fading are out of scope, which
//! keeps multi-node tests deterministic under a fixed seed.
//!
//! ## Example
//!
//! ```ignore
//! use thicket_core::simulation::{RadioBus, SharedClock};
//!
//! let clock = SharedClock::new();
//! let bus = RadioBus::new(clock.clone());
//! let mut a = bus.endpoint();
//! let mut b = bus.endpoint();
//!
//! a.start_send_raw(b"hello");
//! clock.advance(100);
//!
//! let mut buf = [0u8; 256];
//! let n = b.recv_raw(&mut buf);
//! assert_eq!(&buf[..n], b"hello");
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::traits::{MillisClock, Radio, RandomSource, RtcClock};

/// Whether virtual time `now` has reached `t`, wraparound-safe.
fn reached(now: u32, t: u32) -> bool {
    now.wrapping_sub(t) as i32 >= 0
}

/// Virtual millisecond clock shared by every node in a simulation.
///
/// Clones observe the same instant. Time only moves through
/// [`SharedClock::advance`], so a test controls exactly when deadlines
/// fire and when frames land.
#[derive(Clone, Default)]
pub struct SharedClock(Rc<Cell<u32>>);

impl SharedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward by `ms`.
    pub fn advance(&self, ms: u32) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

impl MillisClock for SharedClock {
    fn millis(&self) -> u32 {
        self.0.get()
    }
}

/// Wall clock derived from a [`SharedClock`].
///
/// Seconds advance at one per 1000 virtual milliseconds from a configured
/// epoch base. Good for runs shorter than the 32-bit millisecond wrap.
pub struct SimRtc {
    clock: SharedClock,
    base_secs: i64,
}

impl SimRtc {
    /// An RTC reading `epoch_secs` at the clock's current instant.
    pub fn new(clock: SharedClock, epoch_secs: u32) -> Self {
        let base_secs = i64::from(epoch_secs) - i64::from(clock.millis() / 1000);
        Self { clock, base_secs }
    }
}

impl RtcClock for SimRtc {
    fn current_time(&self) -> u32 {
        (self.base_secs + i64::from(self.clock.millis() / 1000)).max(0) as u32
    }

    fn set_current_time(&mut self, secs: u32) {
        self.base_secs = i64::from(secs) - i64::from(self.clock.millis() / 1000);
    }
}

/// Deterministic entropy source for reproducible runs.
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for SeededRandom {
    fn fill(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

/// A frame in flight on the bus.
struct Flight {
    /// Endpoint index of the transmitter.
    from: usize,
    /// Wire-format bytes, delivered when `done_at` is reached.
    frame: Vec<u8>,
    /// Virtual instant the transmission completes.
    done_at: u32,
}

struct BusState {
    clock: SharedClock,
    airtime_base_ms: u32,
    airtime_per_byte_ms: u32,
    /// Reachability pairs between endpoint indices. Empty means fully
    /// connected.
    links: Vec<(usize, usize)>,
    /// One receive queue per endpoint.
    rx: Vec<VecDeque<Vec<u8>>>,
    flights: Vec<Flight>,
}

impl BusState {
    fn hears(&self, from: usize, to: usize) -> bool {
        if self.links.is_empty() {
            return true;
        }
        self.links
            .iter()
            .any(|&(a, b)| (a, b) == (from, to) || (b, a) == (from, to))
    }

    fn airtime_ms(&self, len: usize) -> u32 {
        self.airtime_base_ms + self.airtime_per_byte_ms * len as u32
    }

    /// Land every flight whose airtime has elapsed in the receive queues
    /// of the endpoints that can hear the transmitter.
    fn settle(&mut self) {
        let now = self.clock.millis();
        let (landed, pending): (Vec<Flight>, Vec<Flight>) = self
            .flights
            .drain(..)
            .partition(|f| reached(now, f.done_at));
        self.flights = pending;

        for flight in landed {
            for to in 0..self.rx.len() {
                if to != flight.from && self.hears(flight.from, to) {
                    self.rx[to].push_back(flight.frame.clone());
                }
            }
        }
    }
}

/// Shared medium connecting [`SimRadio`] endpoints.
///
/// Frames occupy the transmitter for their modeled airtime and then land
/// in the receive queue of every endpoint linked to it. By default every
/// endpoint hears every other; [`RadioBus::connect`] switches the bus to
/// an explicit topology.
pub struct RadioBus {
    state: Rc<RefCell<BusState>>,
}

impl RadioBus {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Rc::new(RefCell::new(BusState {
                clock,
                airtime_base_ms: 5,
                airtime_per_byte_ms: 1,
                links: Vec::new(),
                rx: Vec::new(),
                flights: Vec::new(),
            })),
        }
    }

    /// Replace the default airtime model (5 ms base, 1 ms per byte).
    pub fn with_airtime_model(self, base_ms: u32, per_byte_ms: u32) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.airtime_base_ms = base_ms;
            state.airtime_per_byte_ms = per_byte_ms;
        }
        self
    }

    /// Attach a new endpoint and return its radio.
    ///
    /// Endpoints are numbered in creation order, starting at 0. Those
    /// indices name the ends of a [`RadioBus::connect`] link.
    pub fn endpoint(&self) -> SimRadio {
        let mut state = self.state.borrow_mut();
        state.rx.push(VecDeque::new());
        SimRadio {
            state: Rc::clone(&self.state),
            index: state.rx.len() - 1,
        }
    }

    /// Declare that endpoints `a` and `b` hear each other.
    ///
    /// The first call switches the bus from fully connected to the
    /// explicit link set.
    pub fn connect(&self, a: usize, b: usize) {
        self.state.borrow_mut().links.push((a, b));
    }

    /// Put a raw frame on the air as if node `from` had sent it.
    ///
    /// The frame lands immediately in the queue of every endpoint that
    /// can hear `from` under the current link set.
    pub fn inject(&self, from: u8, frame: Vec<u8>) {
        let mut state = self.state.borrow_mut();
        for to in 0..state.rx.len() {
            if state.hears(usize::from(from), to) {
                state.rx[to].push_back(frame.clone());
            }
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.borrow().rx.len()
    }
}

/// A radio endpoint on a [`RadioBus`].
pub struct SimRadio {
    state: Rc<RefCell<BusState>>,
    index: usize,
}

impl SimRadio {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Radio for SimRadio {
    fn recv_raw(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.state.borrow_mut();
        state.settle();
        let Some(frame) = state.rx[self.index].pop_front() else {
            return 0;
        };
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        len
    }

    fn est_airtime_ms(&self, len: usize) -> u32 {
        self.state.borrow().airtime_ms(len)
    }

    fn start_send_raw(&mut self, raw: &[u8]) {
        let mut state = self.state.borrow_mut();
        let now = state.clock.millis();
        let done_at = now.wrapping_add(state.airtime_ms(raw.len()));
        state.flights.push(Flight {
            from: self.index,
            frame: raw.to_vec(),
            done_at,
        });
    }

    fn is_send_complete(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.settle();
        state.flights.iter().all(|f| f.from != self.index)
    }

    fn is_receiving(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.settle();
        state
            .flights
            .iter()
            .any(|f| f.from != self.index && state.hears(f.from, self.index))
    }
}
