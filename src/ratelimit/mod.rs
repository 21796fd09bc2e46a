//! Rate limiting logic and state management.

mod clock;
mod limiter;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Decision, Quota, RateLimiter, RateLimiterOptions};
pub use window::WindowEntry;
