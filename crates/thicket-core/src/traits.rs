//! Collaborator traits for the mesh engine.
//!
//! The engine never talks to hardware or the OS directly. Radios, clocks and
//! entropy come in through these traits, so the same protocol logic runs on
//! real transceivers, in unit tests, and on the simulated bus in
//! [`crate::simulation`].

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use thiserror::Error;

/// Errors that can occur in mesh engine operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    /// No free packet slot in the pool.
    #[error("packet pool exhausted")]
    PoolExhausted,
    /// The outbound queue rejected a submission. The caller keeps the packet.
    #[error("outbound queue full")]
    QueueFull,
    /// A payload exceeds what the frame format can carry.
    #[error("payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },
    /// A received frame does not decode to a packet.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    /// Key material that does not parse as a valid key.
    #[error("invalid key material")]
    InvalidKey,
    /// Hex input that does not decode.
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// A half-duplex packet radio.
///
/// All methods are non-blocking; the dispatcher polls readiness once per
/// tick. A radio is either idle, receiving, or carrying exactly one
/// outbound frame at a time.
pub trait Radio {
    /// One-time hardware bring-up. Defaults to a no-op.
    fn begin(&mut self) {}

    /// Copy a pending received frame into `buf`.
    ///
    /// Returns the frame length, or 0 when nothing is pending.
    fn recv_raw(&mut self, buf: &mut [u8]) -> usize;

    /// Estimated on-air time in milliseconds for a frame of `len` bytes.
    fn est_airtime_ms(&self, len: usize) -> u32;

    /// Begin transmitting a frame. Completion is polled via
    /// [`Radio::is_send_complete`].
    fn start_send_raw(&mut self, raw: &[u8]);

    /// Whether the in-flight transmission has finished.
    fn is_send_complete(&self) -> bool;

    /// Called once after a transmission completes or is abandoned.
    fn on_send_finished(&mut self) {}

    /// Whether a frame is currently being received. Transmissions are
    /// deferred while this is true.
    fn is_receiving(&self) -> bool {
        false
    }
}

/// Monotonic millisecond clock.
///
/// The value wraps at `u32::MAX`; all deadline arithmetic in the engine
/// uses the wraparound-safe helpers in [`crate::dispatcher`].
pub trait MillisClock {
    fn millis(&self) -> u32;
}

/// Wall clock in whole seconds since the Unix epoch.
pub trait RtcClock {
    fn current_time(&self) -> u32;

    /// Adjust the clock, e.g. from time carried in an announce.
    fn set_current_time(&mut self, secs: u32);
}

/// Source of random bytes.
pub trait RandomSource {
    fn fill(&mut self, dest: &mut [u8]);

    /// Uniform random value in `[min, max)`.
    fn next_in_range(&mut self, min: u32, max: u32) -> u32 {
        if max <= min {
            return min;
        }
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes);
        min + u32::from_le_bytes(bytes) % (max - min)
    }
}

/// Millisecond clock backed by [`Instant`].
pub struct SystemMillis {
    start: Instant,
}

impl SystemMillis {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemMillis {
    fn default() -> Self {
        Self::new()
    }
}

impl MillisClock for SystemMillis {
    fn millis(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

/// Wall clock backed by [`SystemTime`], with a settable offset.
#[derive(Default)]
pub struct SystemRtc {
    offset_secs: i64,
}

impl SystemRtc {
    pub fn new() -> Self {
        Self::default()
    }

    fn host_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl RtcClock for SystemRtc {
    fn current_time(&self) -> u32 {
        (Self::host_secs() + self.offset_secs).max(0) as u32
    }

    fn set_current_time(&mut self, secs: u32) {
        self.offset_secs = secs as i64 - Self::host_secs();
    }
}

/// OS-backed entropy source.
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&mut self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }
}
