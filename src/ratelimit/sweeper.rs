//! Background eviction of expired local cache entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::LocalCache;

/// Handle to the periodic sweep task.
///
/// Readers already treat expired entries as absent; the sweeper only bounds
/// memory held by subjects that stopped sending requests.
#[derive(Debug)]
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn a task that sweeps `cache` every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(cache: Arc<LocalCache>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        info!(interval_ms = interval.as_millis() as u64, "Starting cache sweeper");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing can have expired yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        debug!(removed, remaining = cache.len(), "Swept expired cache entries");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Cache sweeper stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop the sweep task and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Cache sweeper task ended abnormally");
        }
    }

    /// Whether the sweep task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;

    #[tokio::test]
    async fn test_sweeper_evicts_expired_entries() {
        let clock = MockClock::default();
        let cache = Arc::new(LocalCache::new(Arc::new(clock.clone())));
        cache.upsert("stale", 1, 10, Duration::from_secs(1)).unwrap();
        cache.upsert("fresh", 1, 10, Duration::from_secs(120)).unwrap();

        let sweeper = Sweeper::spawn(cache.clone(), Duration::from_millis(10));
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get("fresh").is_some());

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_keeps_live_entries() {
        let clock = MockClock::default();
        let cache = Arc::new(LocalCache::new(Arc::new(clock.clone())));
        cache.upsert("alice", 1, 10, Duration::from_secs(60)).unwrap();

        let sweeper = Sweeper::spawn(cache.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.len(), 1);
        assert!(!sweeper.is_finished());
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeping() {
        let clock = MockClock::default();
        let cache = Arc::new(LocalCache::new(Arc::new(clock.clone())));

        let sweeper = Sweeper::spawn(cache.clone(), Duration::from_millis(10));
        sweeper.shutdown().await;

        cache.upsert("stale", 1, 10, Duration::from_secs(1)).unwrap();
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Nobody left to evict it
        assert_eq!(cache.len(), 1);
    }
}
