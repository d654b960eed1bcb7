//! In-process sliding-window store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::backend::{StoreStats, StoreType, WindowStore};
use super::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Event history for one key.
#[derive(Debug, Default)]
struct WindowEntry {
    /// Event timestamps in epoch milliseconds
    timestamps: Vec<u64>,
    /// After this instant the whole entry is stale
    expires_at: u64,
}

impl WindowEntry {
    /// Drop timestamps outside the window, record `now`, return the count.
    fn record(&mut self, now: u64, window_ms: u64) -> u64 {
        let cutoff = now.saturating_sub(window_ms);
        self.timestamps.retain(|&ts| ts > cutoff);
        self.timestamps.push(now);
        self.expires_at = now.saturating_add(window_ms);
        self.timestamps.len() as u64
    }
}

/// Handle to the background task that drops abandoned keys.
struct Reaper {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Exact sliding-window counts within a single process.
///
/// Each key lives in a `DashMap` shard, so an `increment` holds only that
/// shard's lock for the duration of the filter and append. This store does not
/// coordinate across service instances; use the Redis store for that.
pub struct MemoryStore {
    entries: Arc<DashMap<String, WindowEntry>>,
    clock: Arc<dyn Clock>,
    reaper: Mutex<Option<Reaper>>,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            reaper: Mutex::new(None),
        }
    }

    /// Spawn the periodic task that removes expired keys.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while a
    /// reaper is running does nothing.
    pub fn start_reaper(&self, interval: Duration) {
        let mut slot = self.reaper.lock();
        if slot.is_some() {
            return;
        }

        let entries = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);
        let (stop, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let removed = reap_expired(&entries, clock.now_millis());
                        if removed > 0 {
                            debug!(removed = removed, "Reaped expired rate limit windows");
                        }
                    }
                }
            }
            debug!("Reaper stopped");
        });

        info!(interval_secs = interval.as_secs_f64(), "Started window reaper");
        *slot = Some(Reaper { stop, task });
    }

    /// Whether the background reaper is running.
    pub fn reaper_running(&self) -> bool {
        self.reaper.lock().is_some()
    }

    /// Run one reaper pass now and return the number of removed keys.
    pub fn reap(&self) -> usize {
        reap_expired(&self.entries, self.clock.now_millis())
    }

    /// Number of keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.task.abort();
        }
    }
}

/// Remove every entry whose `expires_at` has passed.
///
/// `retain` takes each shard's write lock, the same guard `increment` uses,
/// so a key cannot be reaped while an increment is extending it.
fn reap_expired(entries: &DashMap<String, WindowEntry>, now: u64) -> usize {
    let mut removed = 0;
    entries.retain(|_, entry| {
        let keep = entry.expires_at >= now;
        if !keep {
            removed += 1;
        }
        keep
    });
    removed
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn increment(&self, key: &str, window_ms: u64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let count = self
            .entries
            .entry(key.to_string())
            .or_default()
            .record(now, window_ms);

        trace!(key = %key, count = count, window_ms = window_ms, "Recorded event");
        Ok(count)
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let total_events = self
            .entries
            .iter()
            .map(|entry| entry.timestamps.len() as u64)
            .sum();

        Ok(StoreStats {
            store_type: StoreType::Memory,
            active_keys: self.entries.len() as u64,
            total_events,
        })
    }

    fn store_type(&self) -> StoreType {
        StoreType::Memory
    }

    async fn shutdown(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            let _ = reaper.stop.send(());
            let _ = reaper.task.await;
        }
    }
}
