//! Rate limiting logic and state management.

mod backend;
mod cache;
mod clock;
mod limiter;
mod subject;
mod sweeper;

pub use backend::{CounterStore, WindowCount};
pub use cache::{CacheSnapshot, LocalCache};
pub use clock::{Clock, MockClock, SystemClock};
pub use limiter::{Decision, DecisionSource, RateLimiter};
pub use subject::Subject;
pub use sweeper::Sweeper;
