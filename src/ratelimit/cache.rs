//! Process-local approximation of the shared window counters.
//!
//! The cache is a bounded-staleness replica of the store: on every successful
//! store round trip the coordinator overwrites the subject's entry with the
//! authoritative figures, and while the store is unreachable the cache counts
//! on its own.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::clock::Clock;
use crate::error::{Result, TierlimitError};

/// A single subject's local counter.
///
/// `count` and `limit` are atomics so the common increment path only needs a
/// shared shard guard; `reset_at` is only rewritten under the exclusive guard.
#[derive(Debug)]
pub struct CacheEntry {
    count: AtomicU64,
    limit: AtomicU64,
    reset_at: Instant,
}

impl CacheEntry {
    fn new(count: u64, limit: u64, reset_at: Instant) -> Self {
        Self {
            count: AtomicU64::new(count),
            limit: AtomicU64::new(limit),
            reset_at,
        }
    }

    /// Whether the entry's window is still open at `now`.
    fn is_live(&self, now: Instant) -> bool {
        now < self.reset_at
    }

    fn overwrite(&mut self, count: u64, limit: u64, reset_at: Instant) {
        *self.count.get_mut() = count;
        *self.limit.get_mut() = limit;
        self.reset_at = reset_at;
    }

    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            count: self.count.load(Ordering::Acquire),
            limit: self.limit.load(Ordering::Relaxed),
            reset_at: self.reset_at,
        }
    }
}

/// Point-in-time copy of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSnapshot {
    /// Requests counted in the current window
    pub count: u64,
    /// Limit in force when the entry was last written
    pub limit: u64,
    /// Instant at which the window closes
    pub reset_at: Instant,
}

impl CacheSnapshot {
    /// Time left in the window, zero once it has closed.
    pub fn reset_in(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }

    /// Whether the snapshot's count has reached `limit`.
    pub fn is_exhausted(&self, limit: u64) -> bool {
        self.count >= limit
    }
}

/// Concurrent subject -> counter table shared by all request tasks and the sweeper.
#[derive(Debug)]
pub struct LocalCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    /// Create an empty cache reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// The clock this cache evaluates expiry against.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Snapshot the live entry for `subject`.
    ///
    /// An entry whose window has closed is reported as absent even if the
    /// sweeper has not removed it yet.
    pub fn get(&self, subject: &str) -> Option<CacheSnapshot> {
        let now = self.clock.now();
        self.entries
            .get(subject)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.snapshot())
    }

    /// Overwrite the entry for `subject` with authoritative figures.
    ///
    /// `ttl` is the time left in the store's window and must be non-zero.
    pub fn upsert(&self, subject: &str, count: u64, limit: u64, ttl: Duration) -> Result<CacheSnapshot> {
        if ttl.is_zero() {
            return Err(TierlimitError::Invariant(format!(
                "refusing to cache subject {subject} with an already-closed window"
            )));
        }
        let reset_at = self.reset_instant(ttl)?;

        let snapshot = match self.entries.get_mut(subject) {
            Some(mut entry) => {
                entry.overwrite(count, limit, reset_at);
                entry.snapshot()
            }
            None => {
                let entry = CacheEntry::new(count, limit, reset_at);
                let snapshot = entry.snapshot();
                self.entries.insert(subject.to_string(), entry);
                snapshot
            }
        };

        trace!(subject, count, limit, ttl_ms = ttl.as_millis() as u64, "Local entry overwritten");
        Ok(snapshot)
    }

    /// Count one request locally, opening a fresh window if the current one
    /// is missing or closed. `window` must be non-zero.
    pub fn increment_or_reset(&self, subject: &str, limit: u64, window: Duration) -> Result<CacheSnapshot> {
        if window.is_zero() {
            return Err(TierlimitError::Invariant(format!(
                "refusing to count subject {subject} in a zero-length window"
            )));
        }
        let now = self.clock.now();

        // Fast path: live window, shared guard, atomic add.
        if let Some(entry) = self.entries.get(subject) {
            if entry.is_live(now) {
                let count = entry.count.fetch_add(1, Ordering::AcqRel) + 1;
                entry.limit.store(limit, Ordering::Relaxed);
                return Ok(CacheSnapshot {
                    count,
                    limit,
                    reset_at: entry.reset_at,
                });
            }
        }

        let reset_at = self.reset_instant(window)?;
        let mut entry = self
            .entries
            .entry(subject.to_string())
            .or_insert_with(|| CacheEntry::new(0, limit, reset_at));

        // Another task may have rolled the window over while we waited for the guard.
        if !entry.is_live(now) {
            entry.overwrite(0, limit, reset_at);
        }
        let count = entry.count.fetch_add(1, Ordering::AcqRel) + 1;
        entry.limit.store(limit, Ordering::Relaxed);

        trace!(subject, count, limit, "Local entry incremented");
        Ok(CacheSnapshot {
            count,
            limit,
            reset_at: entry.reset_at,
        })
    }

    /// Physically remove every entry whose window has closed.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.is_live(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of physically present entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn reset_instant(&self, ttl: Duration) -> Result<Instant> {
        self.clock.now().checked_add(ttl).ok_or_else(|| {
            TierlimitError::Invariant(format!("window of {ttl:?} overflows the clock"))
        })
    }
}
