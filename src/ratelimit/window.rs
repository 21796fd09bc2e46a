//! Fixed-window entry: the count/expiry pair tracked per key.

use std::time::Duration;

/// One key's current counting window.
///
/// Created with a count of 1 on the first request, incremented in place for
/// every further request before expiry, and replaced outright once the reset
/// timestamp has passed. The count keeps growing past the limit; the limiter
/// reports a saturated `remaining` instead of rolling the increment back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Requests observed in the current window
    pub count: u64,
    /// Absolute expiry timestamp in milliseconds since the Unix epoch
    pub reset_at_ms: i64,
}

impl WindowEntry {
    /// Start a fresh window for a first request arriving at `now_ms`.
    pub fn new(now_ms: i64, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at_ms: now_ms + window.as_millis() as i64,
        }
    }

    /// Record one more request in this window.
    pub fn hit(&mut self) {
        self.count += 1;
    }

    /// Whether the window has expired and must be replaced.
    ///
    /// Strictly past the reset timestamp; a request landing exactly at
    /// `reset_at_ms` still counts into this window.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.reset_at_ms < now_ms
    }

    /// Seconds until this window resets, rounded up.
    ///
    /// Ceiling division keeps the reported value at 1 even with a single
    /// millisecond left, so clients never retry into a still-open window.
    pub fn reset_secs(&self, now_ms: i64) -> u64 {
        let remaining_ms = (self.reset_at_ms - now_ms).max(0) as u64;
        remaining_ms.div_ceil(1000)
    }
}
