//! In-process counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::StoreError;
use crate::ratelimit::{Clock, CounterStore, WindowCount};

#[derive(Debug, Clone, Copy)]
struct StoredCounter {
    count: u64,
    expires_at: Instant,
}

/// Counter store kept in process memory.
///
/// Behaves like the Redis adapter for a single instance: keys are created with
/// an expiry on first use and read as absent once it passes. Expired keys are
/// evicted by an increment arriving at least one window after the previous
/// eviction pass, so the map stays bounded by the subjects active in roughly
/// the last two windows.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, StoredCounter>,
    clock: Arc<dyn Clock>,
    next_sweep: Mutex<Instant>,
}

impl InMemoryCounterStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            counters: DashMap::new(),
            clock,
            next_sweep: Mutex::new(now),
        }
    }

    /// Current count for `key`, if its window is still open.
    pub fn get(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|c| now < c.expires_at)
            .map(|c| c.count)
    }

    /// Remove every key whose window has closed.
    ///
    /// Returns the number of keys removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| now < counter.expires_at);
        before.saturating_sub(self.counters.len())
    }

    /// Sweep if a full `window` has passed since the last pass.
    ///
    /// Must not be called while holding a guard into `counters`.
    fn maybe_sweep(&self, now: Instant, window: Duration) {
        let Some(mut next_sweep) = self.next_sweep.try_lock() else {
            return;
        };
        if now < *next_sweep {
            return;
        }
        *next_sweep = now.checked_add(window).unwrap_or(now);
        drop(next_sweep);

        let removed = self.sweep_expired();
        if removed > 0 {
            debug!(removed, remaining = self.counters.len(), "Evicted expired in-memory counters");
        }
    }

    /// Number of keys held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no keys are held.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_get(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = self.clock.now();
        let fresh_expiry = now
            .checked_add(window)
            .ok_or_else(|| StoreError::Protocol(format!("window of {window:?} overflows the clock")))?;
        self.maybe_sweep(now, window);

        // The entry guard holds the shard lock, so create-with-expiry and
        // increment happen as one unit for this key.
        let mut counter = self.counters.entry(key.to_string()).or_insert(StoredCounter {
            count: 0,
            expires_at: fresh_expiry,
        });
        if now >= counter.expires_at {
            *counter = StoredCounter {
                count: 0,
                expires_at: fresh_expiry,
            };
        }
        counter.count += 1;

        let result = WindowCount {
            count: counter.count,
            ttl: counter.expires_at.saturating_duration_since(now),
        };
        trace!(key, count = result.count, "In-memory counter incremented");
        Ok(result)
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        Ok(Duration::ZERO)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
