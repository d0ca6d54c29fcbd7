//! Extended write timestamps.
//!
//! Wall-clock milliseconds plus a strictly increasing fractional offset,
//! so writes landing within the same clock tick still get a total order.
//! The offset resets whenever the integral millisecond advances.

use chrono::Utc;
use parking_lot::Mutex;

// Epoch milliseconds sit near 2^41, where an f64 resolves ~2.4e-4.
// The step must stay well above that or sub-tick offsets round away.
const OFFSET_STEP: f64 = 1e-3;
const OFFSET_LIMIT: f64 = 1.0 - OFFSET_STEP;

/// Synchronized extended-timestamp generator.
///
/// One instance is shared per storage backend; concurrent writers never
/// observe a repeated or decreasing timestamp.
#[derive(Debug)]
pub struct ExtendedClock {
    state: Mutex<ClockState>,
}

#[derive(Debug)]
struct ClockState {
    millis: i64,
    offset: f64,
}

impl ExtendedClock {
    pub fn new() -> Self {
        ExtendedClock {
            state: Mutex::new(ClockState { millis: 0, offset: 0.0 }),
        }
    }

    /// Produce the next timestamp. Monotonic even if the wall clock
    /// stalls or steps backwards.
    pub fn next(&self) -> f64 {
        let now = Utc::now().timestamp_millis();
        let mut state = self.state.lock();
        if now > state.millis {
            state.millis = now;
            state.offset = 0.0;
        } else {
            state.offset += OFFSET_STEP;
            if state.offset >= OFFSET_LIMIT {
                state.millis += 1;
                state.offset = 0.0;
            }
        }
        state.millis as f64 + state.offset
    }
}

impl Default for ExtendedClock {
    fn default() -> Self {
        Self::new()
    }
}
