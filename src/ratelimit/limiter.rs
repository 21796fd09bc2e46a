//! Core rate limiter implementation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::window::WindowEntry;

/// Default window duration when none is configured.
const DEFAULT_WINDOW: Duration = Duration::from_millis(60_000);
/// Default request ceiling per window.
const DEFAULT_MAX: u64 = 100;
/// Default rejection message.
const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Options for a rate limiter instance. Immutable once the limiter is built.
#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    /// Window duration
    pub window: Duration,
    /// Maximum allowed request count per window
    pub max: u64,
    /// Rejection message returned to over-limit clients
    pub message: String,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max: DEFAULT_MAX,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }
}

impl RateLimiterOptions {
    /// Set the window duration.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the per-window request ceiling.
    pub fn max(mut self, max: u64) -> Self {
        self.max = max;
        self
    }

    /// Set the rejection message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Quota state reported alongside every decision.
///
/// Maps directly onto the `x-ratelimit-limit` / `x-ratelimit-remaining` /
/// `x-ratelimit-reset` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// The configured ceiling
    pub limit: u64,
    /// Requests left in the current window, saturating at 0
    pub remaining: u64,
    /// Seconds until the window resets, rounded up
    pub reset_secs: u64,
}

/// The outcome of a rate limit check.
///
/// Rejection is a control-flow result, not an error: over-limit requests are
/// an expected outcome and must never surface as a failure of the check
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed to the next pipeline stage.
    Allow {
        /// Quota state after this request
        quota: Quota,
    },
    /// The request exceeds the quota and must be answered with HTTP 429.
    Reject {
        /// Quota state after this request (`remaining` is 0)
        quota: Quota,
        /// Seconds the client should wait before retrying
        retry_after_secs: u64,
        /// The configured rejection message
        message: String,
    },
}

impl Decision {
    /// Helper to check if the request was allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// The quota state carried by either variant.
    pub fn quota(&self) -> &Quota {
        match self {
            Decision::Allow { quota } => quota,
            Decision::Reject { quota, .. } => quota,
        }
    }
}

/// A fixed-window rate limiter with per-key counting.
///
/// Each instance owns its own window store, so limiters configured with
/// different policies never interfere even when they see the same key. The
/// store is shared state between request checks and the background sweeper;
/// the per-shard locking of the map makes each key's read-modify-write a
/// critical section, so concurrent checks for one key cannot lose updates.
pub struct RateLimiter {
    /// Immutable policy for this instance
    options: RateLimiterOptions,
    /// Window entries indexed by derived key
    windows: DashMap<String, WindowEntry>,
    /// Time source for window expiry
    clock: Arc<dyn Clock>,
    /// Handle of the background sweep task, if one is running
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a new rate limiter using wall-clock time.
    pub fn new(options: RateLimiterOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Create a new rate limiter with an injected clock.
    pub fn with_clock(options: RateLimiterOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            options,
            windows: DashMap::new(),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Get the options this limiter was built with.
    pub fn options(&self) -> &RateLimiterOptions {
        &self.options
    }

    /// Check the rate limit for a key, counting this request.
    ///
    /// Looks up the key's window, starting a fresh one if absent or expired,
    /// increments the count, and decides. The increment that crosses the
    /// ceiling is kept; the window never rolls back a rejected request.
    pub fn check(&self, key: &str) -> Decision {
        let now = self.clock.now_ms();

        trace!(key = %key, "Checking rate limit");

        let entry = match self.windows.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                if window.is_expired(now) {
                    *window = WindowEntry::new(now, self.options.window);
                } else {
                    window.hit();
                }
                *window
            }
            Entry::Vacant(vacant) => {
                debug!(
                    key = %key,
                    max = self.options.max,
                    window = ?self.options.window,
                    "Creating new rate limit window"
                );
                *vacant.insert(WindowEntry::new(now, self.options.window))
            }
        };

        let quota = Quota {
            limit: self.options.max,
            remaining: self.options.max.saturating_sub(entry.count),
            reset_secs: entry.reset_secs(now),
        };

        if entry.count > self.options.max {
            debug!(
                key = %key,
                count = entry.count,
                max = self.options.max,
                "Rate limit exceeded"
            );
            Decision::Reject {
                quota,
                retry_after_secs: quota.reset_secs,
                message: self.options.message.clone(),
            }
        } else {
            Decision::Allow { quota }
        }
    }

    /// Remove every expired window entry. Returns the number removed.
    ///
    /// Purely a memory bound for keys that stopped sending requests; the
    /// allow/reject decision never depends on it because `check` replaces
    /// expired windows lazily.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        let removed = before - self.windows.len();

        if removed > 0 {
            debug!(
                removed,
                remaining = self.windows.len(),
                "Swept expired rate limit windows"
            );
        }
        removed
    }

    /// Spawn the periodic sweep task for this limiter.
    ///
    /// The task holds only a weak reference and exits once the limiter is
    /// dropped; the handle is also aborted by [`stop_sweeper`](Self::stop_sweeper)
    /// and on drop, so discarded limiters never leak their timer. Calling this
    /// while a sweeper is already running is a no-op.
    pub fn start_sweeper(limiter: &Arc<RateLimiter>, every: Duration) {
        let mut guard = limiter.sweeper.lock();
        if guard.is_some() {
            return;
        }

        let weak: Weak<RateLimiter> = Arc::downgrade(limiter);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else { break };
                limiter.sweep();
            }
        });

        *guard = Some(handle);
    }

    /// Stop the periodic sweep task, if one is running.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Get the number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Clear all window entries.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterOptions::default())
    }
}
