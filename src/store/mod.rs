//! Shared window counter stores.
//!
//! The Redis adapter is the authoritative store shared by every coordinator
//! instance; the in-memory store offers the same contract inside one process.

mod memory;
mod redis_store;

pub use self::memory::InMemoryCounterStore;
pub use self::redis_store::RedisCounterStore;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::ratelimit::{Clock, CounterStore};

/// Errors that can occur talking to a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

/// Build the store selected by `config`.
///
/// Connection failures surface as [`TierlimitError::StoreUnavailable`](crate::error::TierlimitError::StoreUnavailable).
pub async fn connect(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.backend {
        StoreBackend::Redis => Arc::new(RedisCounterStore::connect(config).await?),
        StoreBackend::Memory => Arc::new(InMemoryCounterStore::new(clock)),
    };
    info!(backend = store.name(), "Counter store ready");
    Ok(store)
}
