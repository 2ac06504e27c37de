//! Redis-backed window counter store.
//!
//! Each increment is one `MULTI`/`EXEC` round trip:
//!
//! ```text
//! SET  key 0 NX PX <window_ms>   -- create with expiry only if absent
//! INCR key                       -- count this request
//! PTTL key                       -- time left in the window
//! ```
//!
//! Because the transaction executes atomically, no caller can observe a key
//! created without an expiry, and two callers racing on a fresh key cannot
//! both initialise it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::StoreError;
use crate::config::StoreConfig;
use crate::ratelimit::{CounterStore, WindowCount};

/// Counter store backed by a shared Redis instance.
///
/// Holds a fixed set of multiplexed connections and hands them out
/// round-robin. Every call is bounded by the configured timeout and never
/// retried here.
#[derive(Clone)]
pub struct RedisCounterStore {
    connections: Arc<Vec<ConnectionManager>>,
    next: Arc<AtomicUsize>,
    timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("connections", &self.connections.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Open `config.pool_size` connections to `config.url`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let timeout = config.timeout();
        info!(
            url = %config.url,
            pool_size = config.pool_size,
            timeout_ms = config.timeout_ms,
            "Connecting to Redis"
        );

        let client = Client::open(config.url.as_str())?;
        let mut connections = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let connection = bounded(timeout, client.get_connection_manager()).await?;
            connections.push(connection);
        }

        info!(connections = connections.len(), "Redis connections established");

        Ok(Self {
            connections: Arc::new(connections),
            next: Arc::new(AtomicUsize::new(0)),
            timeout,
        })
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.connections[index % self.connections.len()].clone()
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_get(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let mut connection = self.connection();
        let window_ms = window.as_millis().max(1) as u64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("NX")
            .arg("PX")
            .arg(window_ms)
            .ignore()
            .cmd("INCR")
            .arg(key)
            .cmd("PTTL")
            .arg(key);

        let (count, ttl_ms): (i64, i64) = bounded(self.timeout, pipe.query_async(&mut connection))
            .await
            .inspect_err(|e| error!(key, error = %e, "Redis increment failed"))?;

        let result = window_count_from_reply(count, ttl_ms)?;
        debug!(
            key,
            count = result.count,
            ttl_ms = result.ttl.as_millis() as u64,
            "Redis counter incremented"
        );
        Ok(result)
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        let mut connection = self.connection();
        let start = Instant::now();

        let reply: String = bounded(self.timeout, redis::cmd("PING").query_async(&mut connection)).await?;
        if reply != "PONG" {
            return Err(StoreError::Protocol(format!("PING answered with {reply:?}")));
        }

        let elapsed = start.elapsed();
        debug!(latency_ms = elapsed.as_millis() as u64, "Redis ping succeeded");
        Ok(elapsed)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Run a Redis future under `timeout`, mapping expiry to [`StoreError::Timeout`].
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Validate the `INCR`/`PTTL` pair returned by the transaction.
fn window_count_from_reply(count: i64, ttl_ms: i64) -> Result<WindowCount, StoreError> {
    if count <= 0 {
        return Err(StoreError::Protocol(format!("INCR returned non-positive count {count}")));
    }
    // -1: key without expiry, -2: key vanished, 0: expiring right now
    if ttl_ms <= 0 {
        return Err(StoreError::Protocol(format!("PTTL returned {ttl_ms} for a live counter")));
    }
    Ok(WindowCount {
        count: count as u64,
        ttl: Duration::from_millis(ttl_ms as u64),
    })
}
