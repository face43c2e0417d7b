//! Common test utilities for z-metering integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use z_metering_cache::{CacheBackend, CacheError, ChannelSubscription, MemoryCache};
use z_metering_core::{ProviderRateLimitConfig, ProviderScope, TransactionType, UserId};
use z_metering_service::{AddCredits, Metering, MeteringConfig};
use z_metering_store::MemoryStore;

/// Test harness wiring every component to in-memory backends.
pub struct TestHarness {
    /// The components under test.
    pub metering: Metering,
    /// The relational twin.
    pub store: Arc<MemoryStore>,
    /// The key-value twin.
    pub cache: Arc<MemoryCache>,
    /// Fault switchboard in front of `cache`; the components talk to this.
    pub faults: Arc<FaultyCache>,
    /// A test user.
    pub user_id: UserId,
}

impl TestHarness {
    /// Create a harness with empty backends.
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let faults = Arc::new(FaultyCache::new(cache.clone()));
        let metering = Metering::from_parts(
            faults.clone(),
            store.clone(),
            store.clone(),
            MeteringConfig::default(),
        )
        .expect("Failed to build metering");

        Self {
            metering,
            store,
            cache,
            faults,
            user_id: UserId::generate(),
        }
    }

    /// Give the test user `amount` purchased credits.
    pub async fn fund(&self, amount: i64) -> i64 {
        self.metering
            .ledger
            .add_credits(&self.user_id, AddCredits::new(amount, TransactionType::Purchase))
            .await
            .expect("Failed to fund account")
    }

    /// Configure a web provider's limits.
    pub fn configure_provider(&self, provider: &str, config: ProviderRateLimitConfig) {
        self.store
            .set_provider_config(ProviderScope::Web, provider, config)
            .expect("Failed to set provider config");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Fault injection
// ============================================================================

/// A [`MemoryCache`] front that fails chosen operations until healed.
pub struct FaultyCache {
    inner: Arc<MemoryCache>,
    faults: Mutex<Vec<(&'static str, String)>>,
}

impl FaultyCache {
    /// Wrap `inner` with no faults armed.
    pub fn new(inner: Arc<MemoryCache>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Fail every `op` call whose key contains `key_fragment`.
    pub fn fail(&self, op: &'static str, key_fragment: &str) {
        self.faults
            .lock()
            .unwrap()
            .push((op, key_fragment.to_string()));
    }

    /// Disarm every fault.
    pub fn heal(&self) {
        self.faults.lock().unwrap().clear();
    }

    fn check(&self, op: &str, key: &str) -> z_metering_cache::Result<()> {
        let armed = self
            .faults
            .lock()
            .unwrap()
            .iter()
            .any(|(name, fragment)| *name == op && key.contains(fragment.as_str()));
        if armed {
            Err(CacheError::Timeout(format!("injected {op} failure on {key}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for FaultyCache {
    async fn get(&self, key: &str) -> z_metering_cache::Result<Option<String>> {
        self.check("get", key)?;
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> z_metering_cache::Result<()> {
        self.check("set_ex", key)?;
        self.inner.set_ex(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> z_metering_cache::Result<()> {
        self.check("delete", key)?;
        self.inner.delete(key).await
    }

    async fn pttl(&self, key: &str) -> z_metering_cache::Result<Option<Duration>> {
        self.check("pttl", key)?;
        self.inner.pttl(key).await
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> z_metering_cache::Result<i64> {
        self.check("incr_with_ttl", key)?;
        self.inner.incr_with_ttl(key, ttl).await
    }

    async fn decr(&self, key: &str) -> z_metering_cache::Result<i64> {
        self.check("decr", key)?;
        self.inner.decr(key).await
    }

    async fn saturate_with_ttl(
        &self,
        key: &str,
        ceiling: i64,
        ttl: Duration,
    ) -> z_metering_cache::Result<i64> {
        self.check("saturate_with_ttl", key)?;
        self.inner.saturate_with_ttl(key, ceiling, ttl).await
    }

    async fn semaphore_acquire(
        &self,
        key: &str,
        member: &str,
        limit: u32,
        now_ms: i64,
        stale_after: Duration,
    ) -> z_metering_cache::Result<bool> {
        self.check("semaphore_acquire", key)?;
        self.inner
            .semaphore_acquire(key, member, limit, now_ms, stale_after)
            .await
    }

    async fn semaphore_release(&self, key: &str, member: &str) -> z_metering_cache::Result<bool> {
        self.check("semaphore_release", key)?;
        self.inner.semaphore_release(key, member).await
    }

    async fn semaphore_count(&self, key: &str) -> z_metering_cache::Result<u64> {
        self.check("semaphore_count", key)?;
        self.inner.semaphore_count(key).await
    }

    async fn stream_append(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
        ttl: Duration,
    ) -> z_metering_cache::Result<String> {
        self.check("stream_append", key)?;
        self.inner.stream_append(key, payload, max_len, ttl).await
    }

    async fn stream_read(&self, key: &str) -> z_metering_cache::Result<Vec<String>> {
        self.check("stream_read", key)?;
        self.inner.stream_read(key).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> z_metering_cache::Result<u64> {
        self.check("publish", channel)?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> z_metering_cache::Result<ChannelSubscription> {
        self.check("subscribe", channel)?;
        self.inner.subscribe(channel).await
    }

    async fn health_check(&self) -> z_metering_cache::Result<()> {
        self.inner.health_check().await
    }

    fn provider_name(&self) -> &'static str {
        "faulty-memory"
    }
}
