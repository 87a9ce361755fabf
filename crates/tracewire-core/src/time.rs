//! Timestamp sources and delta compression.
//!
//! Every event carries exact timing, but emitting 16 bytes of timestamp per
//! event would dwarf most payloads. [`DeltaEncoder`] keeps the last emitted
//! absolute timestamp and picks the cheapest encoding for each new sample:
//!
//! - delta fits in 4 bits → folded into the data token header, zero extra bytes
//! - delta fits in up to 6 bytes → a time-delta token before the data token
//! - otherwise (no baseline, backward time, or ≥ 2⁴⁸ ticks) → a full
//!   timestamp token, and the baseline resets
//!
//! Decoders replay the same state machine, so reconstruction is exact for
//! any delta magnitude from 0 to 2⁴⁸ − 1.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::token::{MAX_SMALL_DELTA, MAX_TIME_DELTA_BYTES};

/// Largest delta expressible by a time-delta token (6 bytes).
const MAX_DELTA_TICKS: u64 = (1 << (MAX_TIME_DELTA_BYTES as u32 * 8)) - 1;

// ---------------------------------------------------------------------------
// Time sources
// ---------------------------------------------------------------------------

/// A monotonic tick counter with a fixed frequency.
///
/// Providers stamp every event through one of these; the frequency travels
/// with full timestamp tokens so consumers can convert ticks to wall time.
pub trait TimeSource: Send + Sync {
    /// Current value of the counter, in ticks.
    fn now_ticks(&self) -> u64;

    /// Number of ticks per second.
    fn frequency(&self) -> u64;
}

/// Process-monotonic nanosecond clock.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose tick zero is "now".
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_ticks(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn frequency(&self) -> u64 {
        1_000_000_000
    }
}

/// Manually advanced clock for deterministic tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    /// Creates a clock starting at `ticks`.
    #[must_use]
    pub fn new(ticks: u64) -> Self {
        Self {
            ticks: AtomicU64::new(ticks),
        }
    }

    /// Moves the clock forward by `delta` ticks.
    pub fn advance(&self, delta: u64) {
        self.ticks.fetch_add(delta, Ordering::Relaxed);
    }

    /// Sets the clock to an absolute tick value.
    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }
}

impl TimeSource for ManualClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn frequency(&self) -> u64 {
        1_000_000_000
    }
}

// ---------------------------------------------------------------------------
// Delta encoding
// ---------------------------------------------------------------------------

/// The encoding chosen for one timestamp sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampEncoding {
    /// Delta small enough for the data token header nibble.
    Small(u8),
    /// Delta for a time-delta token, with the minimum byte width holding it.
    Delta {
        /// Delta value in ticks.
        value: u64,
        /// Encoded width, 1..=6 bytes.
        num_bytes: u8,
    },
    /// A full timestamp token is required; the baseline was reset.
    Full,
}

/// Chooses per-sample timestamp encodings against a running baseline.
#[derive(Debug, Default)]
pub struct DeltaEncoder {
    last: Option<u64>,
}

impl DeltaEncoder {
    /// Creates an encoder with no baseline; the first sample is always
    /// [`TimestampEncoding::Full`].
    #[must_use]
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Decides the encoding for `now` and commits it as the new baseline.
    pub fn encode(&mut self, now: u64) -> TimestampEncoding {
        let encoding = match self.last {
            Some(last) if now >= last => {
                let delta = now - last;
                if delta <= MAX_SMALL_DELTA {
                    #[allow(clippy::cast_possible_truncation)]
                    TimestampEncoding::Small(delta as u8)
                } else if delta <= MAX_DELTA_TICKS {
                    TimestampEncoding::Delta {
                        value: delta,
                        num_bytes: delta_width(delta),
                    }
                } else {
                    TimestampEncoding::Full
                }
            }
            // No baseline, or time moved backward: resynchronize.
            _ => TimestampEncoding::Full,
        };
        self.last = Some(now);
        encoding
    }

    /// Sets the baseline without emitting anything. Used after a provider
    /// token, which already carries the absolute timestamp.
    pub fn rebase(&mut self, now: u64) {
        self.last = Some(now);
    }

    /// Clears the baseline; the next sample re-emits a full timestamp.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Minimum number of bytes needed to hold `delta` (1..=6).
fn delta_width(delta: u64) -> u8 {
    debug_assert!(delta <= MAX_DELTA_TICKS);
    let bits = 64 - delta.leading_zeros();
    #[allow(clippy::cast_possible_truncation)]
    let bytes = bits.div_ceil(8).max(1) as u8;
    bytes
}
