// Engine clock
//
// Every timestamp the engine compares (sighting age, staleness cutoff, arm
// bookkeeping) lives in one clock domain: nanoseconds since the Unix epoch.
// Wall-clock time lets staleness self-heal across process suspension, where a
// monotonic counter would stall.

use parking_lot::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of engine-canonical time.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds since the Unix epoch
    fn now_nanos(&self) -> u64;

    /// Block the calling thread for `duration`.
    ///
    /// Only ever called on the cycle-tick thread to hold an active scan window open.
    fn sleep(&self, duration: Duration);

    /// Current time in milliseconds
    fn now_millis(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }
}

/// Wall clock backed by `SystemTime`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually driven clock for deterministic cycles.
///
/// `sleep` advances the clock instead of blocking, so a full active window
/// completes instantly while still moving time forward by the window length.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_nanos: Mutex<u64>,
}

impl ManualClock {
    /// Create a clock starting at `start_millis`
    pub fn new(start_millis: u64) -> Self {
        Self {
            now_nanos: Mutex::new(start_millis.saturating_mul(1_000_000)),
        }
    }

    /// Move time forward
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now_nanos.lock();
        *now = now.saturating_add(duration.as_nanos() as u64);
    }

    /// Jump to an absolute time in milliseconds
    pub fn set_millis(&self, millis: u64) {
        *self.now_nanos.lock() = millis.saturating_mul(1_000_000);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        *self.now_nanos.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Convert milliseconds into engine nanoseconds
pub fn millis_to_nanos(millis: u64) -> u64 {
    millis.saturating_mul(1_000_000)
}
