//! Core rate limiter implementation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::backend::{Store, StoreStats, WindowStore};
use super::clock::{Clock, SystemClock};
use super::descriptor::RateKey;
use super::distributed::{RedisOptions, RedisStore};
use super::memory::MemoryStore;
use super::rules::{EndpointClass, PolicyTable, Tier};
use crate::config::GateConfig;
use crate::error::{Result, StoreError};

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the current window ends
    pub reset_at: u64,
    /// Seconds until `reset_at`
    pub reset_in: u64,
    pub identifier: String,
    /// Endpoint class as requested, trimmed and lowercased
    pub endpoint_class: String,
    /// Set when the store failed and the request was let through
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decides whether a caller may proceed, given its tier and endpoint class.
///
/// Construct one at startup and share it by `Arc`. The store is chosen when
/// the limiter is built and never changes afterwards.
pub struct RateLimiter<S: WindowStore = Store> {
    store: S,
    policy: PolicyTable,
    clock: Arc<dyn Clock>,
}

impl RateLimiter<Store> {
    /// Build a limiter from configuration.
    ///
    /// A configured Redis address is tried first. If Redis cannot be reached
    /// the limiter logs a warning and continues on the in-memory store; only a
    /// bad policy file is fatal.
    pub async fn from_config(config: &GateConfig) -> Result<Self> {
        let policy = match config.policy.path.as_deref() {
            Some(path) => PolicyTable::from_file(path)?,
            None => PolicyTable::default(),
        };

        let store = match config.store.redis_url.as_deref() {
            Some(url) => {
                let options = RedisOptions {
                    connect_timeout: config.store.connect_timeout(),
                    command_timeout: config.store.command_timeout(),
                };
                match RedisStore::connect(url, options).await {
                    Ok(store) => Store::Redis(store),
                    Err(e) => {
                        warn!(error = %e, "Redis window store unavailable, falling back to in-memory store");
                        Store::Memory(memory_store(config))
                    }
                }
            }
            None => Store::Memory(memory_store(config)),
        };

        info!(store = %store.store_type(), "Rate limiter initialized");
        Ok(Self::new(store, policy))
    }
}

fn memory_store(config: &GateConfig) -> MemoryStore {
    let store = MemoryStore::new();
    store.start_reaper(config.store.reaper_interval());
    store
}

impl<S: WindowStore> RateLimiter<S> {
    /// Create a limiter over an existing store.
    pub fn new(store: S, policy: PolicyTable) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    /// Create a limiter whose reset times come from `clock`.
    pub fn with_clock(store: S, policy: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    /// Record one request and decide whether it may proceed.
    ///
    /// An endpoint class missing from the policy table gets its own window
    /// under the `general` limit.
    ///
    /// Never fails: a store error produces an allowing decision that carries
    /// the error text.
    pub async fn check_limit(
        &self,
        identifier: &str,
        tier: impl Into<Tier>,
        endpoint_class: impl AsRef<str>,
    ) -> Decision {
        let tier = tier.into();
        let key = RateKey::new(identifier, endpoint_class.as_ref());
        let limit = self
            .policy
            .resolve(tier, EndpointClass::from_name(&key.endpoint_class));

        trace!(key = %key, tier = %tier, max = limit.max, window_ms = limit.window_ms, "Checking rate limit");

        let result = self.store.increment(&key.to_string_key(), limit.window_ms).await;
        let reset_at = self.clock.now_millis().saturating_add(limit.window_ms);
        let reset_in = limit.window_ms.div_ceil(1000);

        match result {
            Ok(count) => {
                let allowed = count <= limit.max;
                if !allowed {
                    debug!(key = %key, count = count, max = limit.max, "Rate limit exceeded");
                }
                Decision {
                    allowed,
                    limit: limit.max,
                    remaining: limit.max.saturating_sub(count),
                    reset_at,
                    reset_in,
                    identifier: identifier.to_string(),
                    endpoint_class: key.endpoint_class,
                    error: None,
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Window store failed, allowing request");
                Decision {
                    allowed: true,
                    limit: limit.max,
                    remaining: limit.max,
                    reset_at,
                    reset_in,
                    identifier: identifier.to_string(),
                    endpoint_class: key.endpoint_class,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Clear one caller's history for one endpoint class.
    pub async fn reset(
        &self,
        identifier: &str,
        endpoint_class: impl AsRef<str>,
    ) -> std::result::Result<(), StoreError> {
        let key = RateKey::new(identifier, endpoint_class.as_ref());
        self.store.reset(&key.to_string_key()).await?;
        info!(key = %key, "Rate limit reset");
        Ok(())
    }

    /// Clear every caller's history.
    pub async fn reset_all(&self) -> std::result::Result<(), StoreError> {
        self.store.reset_all().await?;
        info!("All rate limits reset");
        Ok(())
    }

    pub async fn stats(&self) -> std::result::Result<StoreStats, StoreError> {
        self.store.stats().await
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Stop the store's background work.
    pub async fn shutdown(&self) {
        self.store.shutdown().await;
        debug!("Rate limiter shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::StoreType;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::rules::Limit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Store that can be switched into a failing state.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> std::result::Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Timeout(Duration::from_millis(500)))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl WindowStore for FlakyStore {
        async fn increment(&self, key: &str, window_ms: u64) -> std::result::Result<u64, StoreError> {
            self.check()?;
            self.inner.increment(key, window_ms).await
        }

        async fn reset(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.check()?;
            self.inner.reset(key).await
        }

        async fn reset_all(&self) -> std::result::Result<(), StoreError> {
            self.check()?;
            self.inner.reset_all().await
        }

        async fn stats(&self) -> std::result::Result<StoreStats, StoreError> {
            self.check()?;
            self.inner.stats().await
        }

        fn store_type(&self) -> StoreType {
            StoreType::Redis
        }
    }

    const START: u64 = 1_700_000_000_000;

    fn manual_limiter() -> (Arc<ManualClock>, RateLimiter<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = MemoryStore::with_clock(clock.clone());
        let limiter = RateLimiter::with_clock(store, PolicyTable::default(), clock.clone());
        (clock, limiter)
    }

    #[tokio::test]
    async fn test_free_transfer_scenario() {
        let (_, limiter) = manual_limiter();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, 3);
            assert_eq!(decision.remaining, expected_remaining);
            assert!(decision.error.is_none());
        }

        let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, START + 60_000);
        assert_eq!(decision.reset_in, 60);
        assert_eq!(decision.identifier, "u1");
        assert_eq!(decision.endpoint_class, "transfer");
    }

    #[tokio::test]
    async fn test_denied_after_max_calls() {
        let (_, limiter) = manual_limiter();
        let max = limiter.policy().resolve(Tier::Free, EndpointClass::Auth).max;

        for _ in 0..max {
            assert!(limiter.check_limit("u1", "free", "auth").await.allowed);
        }

        let decision = limiter.check_limit("u1", "free", "auth").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_capacity_returns_after_window() {
        let (clock, limiter) = manual_limiter();

        for _ in 0..4 {
            limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
        }
        assert!(!limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await.allowed);

        clock.advance_millis(60_000);

        let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_at, START + 120_000);
    }

    #[tokio::test]
    async fn test_reset_restores_full_capacity() {
        let (_, limiter) = manual_limiter();

        for _ in 0..5 {
            limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
        }

        tokio_test::assert_ok!(limiter.reset("u1", EndpointClass::Transfer).await);

        let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_unknown_caller_is_noop() {
        let (_, limiter) = manual_limiter();
        tokio_test::assert_ok!(limiter.reset("nobody", "wallet").await);
    }

    #[tokio::test]
    async fn test_endpoint_classes_are_independent() {
        let (_, limiter) = manual_limiter();

        for _ in 0..3 {
            limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
        }
        assert!(!limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await.allowed);

        let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::Wallet).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 49);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let (_, limiter) = manual_limiter();

        for _ in 0..4 {
            limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
        }

        let decision = limiter.check_limit("u2", Tier::Free, EndpointClass::Transfer).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_tiers_get_different_limits() {
        let (_, limiter) = manual_limiter();

        let free = limiter.check_limit("a", Tier::Free, EndpointClass::General).await;
        let premium = limiter.check_limit("b", Tier::Premium, EndpointClass::General).await;
        let admin = limiter.check_limit("c", Tier::Admin, EndpointClass::General).await;

        assert_eq!((free.limit, free.remaining), (100, 99));
        assert_eq!((premium.limit, premium.remaining), (300, 299));
        assert_eq!((admin.limit, admin.remaining), (1000, 999));
    }

    #[tokio::test]
    async fn test_unknown_names_use_fallback_policy() {
        let (_, limiter) = manual_limiter();

        let decision = limiter.check_limit("u1", "gold", "Uploads").await;
        assert_eq!(decision.endpoint_class, "uploads");
        assert_eq!(decision.remaining, 99);
        assert_eq!(
            Limit::new(900_000, decision.limit),
            limiter.policy().resolve(Tier::Free, EndpointClass::General)
        );
    }

    #[tokio::test]
    async fn test_unknown_class_has_its_own_window() {
        let (_, limiter) = manual_limiter();

        for _ in 0..5 {
            limiter.check_limit("u1", "free", "general").await;
        }

        let uploads = limiter.check_limit("u1", "free", "uploads").await;
        assert_eq!(uploads.limit, 100);
        assert_eq!(uploads.remaining, 99);

        let general = limiter.check_limit("u1", "free", "general").await;
        assert_eq!(general.remaining, 94);

        // Resetting the unknown class leaves the general window alone.
        tokio_test::assert_ok!(limiter.reset("u1", "uploads").await);
        assert_eq!(limiter.check_limit("u1", "free", "general").await.remaining, 93);
        assert_eq!(limiter.check_limit("u1", "free", "uploads").await.remaining, 99);
    }

    #[tokio::test]
    async fn test_reset_all_is_idempotent() {
        let (_, limiter) = manual_limiter();

        limiter.check_limit("u1", Tier::Free, EndpointClass::General).await;
        limiter.check_limit("u2", Tier::Free, EndpointClass::Search).await;

        limiter.reset_all().await.unwrap();
        let once = limiter.stats().await.unwrap();
        limiter.reset_all().await.unwrap();
        let twice = limiter.stats().await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.active_keys, 0);

        let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::General).await;
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_on_fresh_key() {
        let limiter = Arc::new(RateLimiter::new(MemoryStore::new(), PolicyTable::default()));
        let n = 40u64;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.check_limit("burst", Tier::Free, EndpointClass::General).await
                })
            })
            .collect();

        let mut remaining = Vec::new();
        for handle in handles {
            let decision = handle.await.unwrap();
            assert!(decision.allowed);
            remaining.push(decision.remaining);
        }
        remaining.sort_unstable();

        let expected: Vec<u64> = (100 - n..100).collect();
        assert_eq!(remaining, expected);
        assert_eq!(remaining[0], 100 - n);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let store = FlakyStore::default();
        let limiter = RateLimiter::new(store, PolicyTable::default());

        // Exhaust the window while the store is healthy.
        for _ in 0..3 {
            limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
        }
        assert!(!limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await.allowed);

        limiter.store().failing.store(true, Ordering::SeqCst);
        for _ in 0..10 {
            let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 3);
            assert!(!decision.error.as_deref().unwrap_or_default().is_empty());
        }

        // Admin operations surface the failure instead.
        tokio_test::assert_err!(limiter.reset("u1", EndpointClass::Transfer).await);
        tokio_test::assert_err!(limiter.stats().await);

        // Accounting resumes where it left off once the store recovers.
        limiter.store().failing.store(false, Ordering::SeqCst);
        assert!(!limiter.check_limit("u1", Tier::Free, EndpointClass::Transfer).await.allowed);
    }

    #[tokio::test]
    async fn test_decision_serialization() {
        let (_, limiter) = manual_limiter();
        let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::Wallet).await;

        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["endpointClass"], "wallet");
        assert_eq!(json["resetAt"], START + 900_000);
        assert_eq!(json["resetIn"], 900);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_from_config_defaults_to_memory() {
        let limiter = RateLimiter::from_config(&GateConfig::default()).await.unwrap();
        assert_eq!(limiter.store().store_type(), StoreType::Memory);
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_config_falls_back_when_redis_unreachable() {
        let mut config = GateConfig::default();
        config.store.redis_url = Some("redis://127.0.0.1:1/".to_string());
        config.store.connect_timeout_ms = 200;

        let limiter = RateLimiter::from_config(&config).await.unwrap();
        assert_eq!(limiter.store().store_type(), StoreType::Memory);

        let decision = limiter.check_limit("u1", Tier::Free, EndpointClass::General).await;
        assert!(decision.allowed);
        assert!(decision.error.is_none());

        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.store_type, StoreType::Memory);
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_config_bad_policy_file_is_fatal() {
        let mut config = GateConfig::default();
        config.policy.path = Some("/nonexistent/rategate-policy.yaml".to_string());

        assert!(RateLimiter::from_config(&config).await.is_err());
    }
}
