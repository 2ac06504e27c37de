//! Counter store trait for abstracting the shared backend.

use async_trait::async_trait;
use std::time::Duration;

use crate::store::StoreError;

/// Authoritative state of a window counter right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the window, including this one
    pub count: u64,
    /// Time left before the counter expires
    pub ttl: Duration,
}

/// Trait for shared window counter stores.
///
/// This trait abstracts over the Redis adapter and the in-process store so the
/// coordinator can work with either.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Create `key` with a `window` expiry if it is absent, then increment it,
    /// as a single atomic unit, returning the new count and remaining TTL.
    ///
    /// Implementations must not retry internally.
    async fn increment_and_get(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Round-trip the backend and report the latency.
    async fn ping(&self) -> Result<Duration, StoreError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
