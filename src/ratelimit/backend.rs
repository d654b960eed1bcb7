//! Window store trait for abstracting in-memory and Redis implementations.

use async_trait::async_trait;
use serde::Serialize;

use super::distributed::RedisStore;
use super::memory::MemoryStore;
use crate::error::StoreError;

/// Which backend a store is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Memory,
    Redis,
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Redis => write!(f, "redis"),
        }
    }
}

/// Summary of a store's contents for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub store_type: StoreType,
    /// Number of keys currently held
    pub active_keys: u64,
    /// Number of recorded events across all keys
    pub total_events: u64,
}

/// Counter of timestamped events per key.
///
/// `window_ms` is passed per call because one store serves every endpoint
/// class, each with its own window length.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Record one event for `key` now and return the number of events inside
    /// the trailing window, including this one.
    async fn increment(&self, key: &str, window_ms: u64) -> Result<u64, StoreError>;

    /// Clear one key's history. Unknown keys are a no-op.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Clear every key.
    async fn reset_all(&self) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    fn store_type(&self) -> StoreType;

    /// Stop any background work owned by the store.
    async fn shutdown(&self) {}
}

/// The store selected at startup.
pub enum Store {
    Memory(MemoryStore),
    Redis(RedisStore),
}

#[async_trait]
impl WindowStore for Store {
    async fn increment(&self, key: &str, window_ms: u64) -> Result<u64, StoreError> {
        match self {
            Store::Memory(store) => store.increment(key, window_ms).await,
            Store::Redis(store) => store.increment(key, window_ms).await,
        }
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.reset(key).await,
            Store::Redis(store) => store.reset(key).await,
        }
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.reset_all().await,
            Store::Redis(store) => store.reset_all().await,
        }
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        match self {
            Store::Memory(store) => store.stats().await,
            Store::Redis(store) => store.stats().await,
        }
    }

    fn store_type(&self) -> StoreType {
        match self {
            Store::Memory(store) => store.store_type(),
            Store::Redis(store) => store.store_type(),
        }
    }

    async fn shutdown(&self) {
        match self {
            Store::Memory(store) => store.shutdown().await,
            Store::Redis(store) => store.shutdown().await,
        }
    }
}

impl From<MemoryStore> for Store {
    fn from(store: MemoryStore) -> Self {
        Store::Memory(store)
    }
}

impl From<RedisStore> for Store {
    fn from(store: RedisStore) -> Self {
        Store::Redis(store)
    }
}
