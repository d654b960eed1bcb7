//! Shared sliding-window store backed by Redis.
//!
//! Each key is a sorted set of events scored by their timestamp. One
//! increment runs as a `MULTI`/`EXEC` transaction (trim, insert, count,
//! expire), so the count reflects this call's insert plus every insert that
//! committed before it. Two calls committed back to back at the same instant
//! may each observe the other; that imprecision is accepted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info, trace};

use super::backend::{StoreStats, StoreType, WindowStore};
use super::clock::{Clock, SystemClock};
use super::descriptor::KEY_PREFIX;
use crate::error::StoreError;

/// Keys requested per `SCAN` round trip and deleted per `DEL`.
const SCAN_BATCH: usize = 500;

/// Timeouts applied to the Redis connection.
#[derive(Debug, Clone, Copy)]
pub struct RedisOptions {
    /// Bound on connecting and the initial `PING`
    pub connect_timeout: Duration,
    /// Bound on each round trip after connecting
    pub command_timeout: Duration,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(500),
        }
    }
}

/// A window store shared by every service instance pointing at the same Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    command_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .field("clock", &self.clock)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a `PING`.
    ///
    /// Fails with [`StoreError::Unavailable`] if the server cannot be reached
    /// within `options.connect_timeout`.
    pub async fn connect(url: &str, options: RedisOptions) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis address: {}", e)))?;

        let connect = async {
            let mut conn = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };

        let conn = tokio::time::timeout(options.connect_timeout, connect)
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "no answer from Redis within {:?}",
                    options.connect_timeout
                ))
            })?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(
            command_timeout_ms = options.command_timeout.as_millis() as u64,
            "Connected to Redis window store"
        );

        Ok(Self {
            conn,
            command_timeout: options.command_timeout,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used to score events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one Redis round trip under the command timeout.
    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }

    /// Collect every rate limit key with `SCAN`.
    async fn scan_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", KEY_PREFIX);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

/// Expiry for a whole key, `ceil(window_ms / 1000)` and at least one second.
fn ttl_secs(window_ms: u64) -> u64 {
    window_ms.div_ceil(1000).max(1)
}

/// Sorted-set member for one event, unique across callers in the same millisecond.
fn event_member(now: u64) -> String {
    format!("{}-{:016x}", now, rand::random::<u64>())
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn increment(&self, key: &str, window_ms: u64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(window_ms);
        let member = event_member(now);
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now)
            .arg(&member)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(window_ms))
            .ignore();

        let (count,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;

        trace!(key = %key, count = count, window_ms = window_ms, "Recorded event in Redis");
        Ok(count)
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = self
            .bounded(redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        let keys = self.scan_keys().await?;
        let mut conn = self.conn.clone();

        for chunk in keys.chunks(SCAN_BATCH) {
            let _: () = self
                .bounded(redis::cmd("DEL").arg(chunk).query_async(&mut conn))
                .await?;
        }

        debug!(removed = keys.len(), "Cleared all Redis rate limit windows");
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let keys = self.scan_keys().await?;
        let mut conn = self.conn.clone();
        let mut total_events = 0u64;

        for chunk in keys.chunks(SCAN_BATCH) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.cmd("ZCARD").arg(key);
            }
            let counts: Vec<u64> = self.bounded(pipe.query_async(&mut conn)).await?;
            total_events += counts.iter().sum::<u64>();
        }

        Ok(StoreStats {
            store_type: StoreType::Redis,
            active_keys: keys.len() as u64,
            total_events,
        })
    }

    fn store_type(&self) -> StoreType {
        StoreType::Redis
    }
}
