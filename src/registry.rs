//! Identifier to token bucket mapping, seeded from persisted state.

use moka::{future::Cache, notification::RemovalCause, policy::EvictionPolicy};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::{
    bucket::TokenBucket,
    config::{LimiterOptions, RateLimitConfig},
    store::StateStore,
    utils::TimeSource,
};

/// Balances of evicted buckets whose write-back has not completed yet
#[derive(Clone, Default)]
struct PendingWrites {
    balances: Arc<Mutex<HashMap<String, u64>>>,
}

impl PendingWrites {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.balances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, identifier: &str, remaining: u64) {
        self.lock().insert(identifier.to_string(), remaining);
    }

    fn get(&self, identifier: &str) -> Option<u64> {
        self.lock().get(identifier).copied()
    }

    /// Drop the entry unless a later eviction replaced it with another balance
    fn complete(&self, identifier: &str, remaining: u64) {
        let mut balances = self.lock();
        if balances.get(identifier) == Some(&remaining) {
            balances.remove(identifier);
        }
    }
}

/// In-process buckets, bounded by size and idle time.
///
/// A bucket evicted from memory has its balance written back to the store so
/// the next request for that identifier reseeds from it. Until that write
/// lands, reseeding reads the balance from memory instead of the store.
#[derive(Clone)]
pub struct LimiterRegistry {
    buckets: Cache<String, Arc<TokenBucket>>,
    pending: PendingWrites,
    state: StateStore,
    config: RateLimitConfig,
    time_source: Arc<dyn TimeSource>,
}

impl LimiterRegistry {
    pub fn new(
        config: RateLimitConfig,
        state: StateStore,
        options: &LimiterOptions,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let pending = PendingWrites::default();
        let eviction_pending = pending.clone();
        let eviction_state = state.clone();

        // Plain LRU: a freshly created (already debited) bucket is never the victim.
        let buckets = Cache::builder()
            .max_capacity(options.max_buckets)
            .time_to_idle(options.bucket_idle_timeout)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |identifier: Arc<String>, bucket: Arc<TokenBucket>, cause: RemovalCause| {
                if !cause.was_evicted() {
                    return;
                }
                let remaining = bucket.tokens_remaining().floor() as u64;
                trace!(identifier = %identifier, remaining, ?cause, "Evicting bucket");
                let Ok(handle) = Handle::try_current() else {
                    return;
                };

                eviction_pending.insert(&identifier, remaining);
                let pending = eviction_pending.clone();
                let state = eviction_state.clone();
                handle.spawn(async move {
                    if let Err(e) = state.save(&identifier, remaining).await {
                        warn!(identifier = %identifier, error = %e, "Failed to persist evicted bucket");
                    }
                    pending.complete(&identifier, remaining);
                });
            })
            .build();

        Self {
            buckets,
            pending,
            state,
            config,
            time_source,
        }
    }

    /// Return the bucket for `identifier`, creating and seeding it on first use.
    ///
    /// Concurrent first requests for the same identifier share one seeding
    /// read and one bucket.
    pub async fn get_or_create(&self, identifier: &str) -> Arc<TokenBucket> {
        self.buckets
            .get_with(identifier.to_string(), self.seed(identifier))
            .await
    }

    /// Return the bucket for `identifier` without creating one
    pub async fn get(&self, identifier: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.get(identifier).await
    }

    /// Approximate number of buckets held in memory
    pub fn len(&self) -> u64 {
        self.buckets.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply pending evictions and refresh [`len`](Self::len)
    pub async fn run_pending_tasks(&self) {
        self.buckets.run_pending_tasks().await;
    }

    async fn seed(&self, identifier: &str) -> Arc<TokenBucket> {
        let capacity = self.config.tokens_per_interval;
        let bucket = TokenBucket::new(
            capacity,
            self.config.refill_interval_ms(),
            self.time_source.clone(),
        );

        let persisted = match self.pending.get(identifier) {
            Some(remaining) => Some(remaining),
            None => self.state.load(identifier).await,
        };

        match persisted {
            Some(persisted) => {
                let debit = capacity - persisted.min(capacity);
                if debit > 0 {
                    bucket.try_remove_tokens(debit);
                }
                debug!(identifier, persisted, debit, "Seeded bucket from persisted state");
            }
            None => trace!(identifier, "Created full bucket"),
        }

        Arc::new(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Interval,
        error::Result,
        metrics::Metrics,
        store::{MemoryStore, PersistenceStore},
        utils::ManualTimeSource,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    /// Memory store whose writes land only after a delay
    struct DelayedWrites {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl PersistenceStore for DelayedWrites {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, expire_seconds: u64) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.set(key, value, expire_seconds).await
        }
    }

    fn registry(store: Arc<MemoryStore>, tokens: u64) -> LimiterRegistry {
        registry_with(store, tokens, Interval::Minute, LimiterOptions::default())
    }

    fn registry_with(
        store: Arc<dyn PersistenceStore>,
        tokens: u64,
        interval: Interval,
        options: LimiterOptions,
    ) -> LimiterRegistry {
        let state = StateStore::new(store, &options, Arc::new(Metrics::new().unwrap()));
        let config = RateLimitConfig::new(tokens, interval).unwrap();
        LimiterRegistry::new(config, state, &options, Arc::new(ManualTimeSource::new(0)))
    }

    fn bounded(max_buckets: u64) -> LimiterOptions {
        LimiterOptions {
            max_buckets,
            ..Default::default()
        }
    }

    async fn wait_for_value(store: &MemoryStore, key: &str) -> Option<String> {
        for _ in 0..100 {
            if let Some(value) = store.get(key).await.unwrap() {
                return Some(value);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_creates_full_bucket_on_miss() {
        let registry = registry(Arc::new(MemoryStore::new()), 10);
        assert!(registry.get("u1").await.is_none());

        let bucket = registry.get_or_create("u1").await;
        assert_eq!(bucket.capacity(), 10);
        assert_eq!(bucket.refill_interval_ms(), 60_000);
        assert_eq!(bucket.tokens_remaining(), 10.0);
    }

    #[tokio::test]
    async fn test_returns_existing_bucket() {
        let registry = registry(Arc::new(MemoryStore::new()), 10);

        let first = registry.get_or_create("u1").await;
        assert!(first.try_remove_tokens(4));

        let second = registry.get_or_create("u1").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.tokens_remaining(), 6.0);
    }

    #[tokio::test]
    async fn test_seeds_from_persisted_remainder() {
        let store = Arc::new(MemoryStore::new());
        store.set("rate-limit:u1", "3", 3600).await.unwrap();

        let registry = registry(store, 10);
        let bucket = registry.get_or_create("u1").await;
        assert_eq!(bucket.tokens_remaining(), 3.0);
    }

    #[tokio::test]
    async fn test_persisted_value_above_capacity_starts_full() {
        let store = Arc::new(MemoryStore::new());
        store.set("rate-limit:u1", "250", 3600).await.unwrap();

        let registry = registry(store, 10);
        let bucket = registry.get_or_create("u1").await;
        assert_eq!(bucket.tokens_remaining(), 10.0);
    }

    #[tokio::test]
    async fn test_persisted_zero_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set("rate-limit:u1", "0", 3600).await.unwrap();

        let registry = registry(store, 10);
        let bucket = registry.get_or_create("u1").await;
        assert!(!bucket.try_remove_tokens(1));
    }

    #[tokio::test]
    async fn test_len_counts_buckets() {
        let registry = registry(Arc::new(MemoryStore::new()), 10);
        assert!(registry.is_empty());

        registry.get_or_create("a").await;
        registry.get_or_create("b").await;
        registry.get_or_create("a").await;
        registry.run_pending_tasks().await;

        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_evicted_bucket_is_written_back_and_reseeded() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(store.clone(), 10, Interval::Hour, bounded(1));

        let a = registry.get_or_create("a").await;
        assert!(a.try_remove_tokens(3));
        registry.run_pending_tasks().await;

        registry.get_or_create("b").await;
        registry.run_pending_tasks().await;
        assert!(registry.get("a").await.is_none());

        assert_eq!(wait_for_value(&store, "rate-limit:a").await, Some("7".to_string()));

        let reseeded = registry.get_or_create("a").await;
        assert!(!Arc::ptr_eq(&a, &reseeded));
        assert_eq!(reseeded.tokens_remaining(), 7.0);
    }

    #[tokio::test]
    async fn test_reseed_sees_write_back_still_in_flight() {
        let store = Arc::new(DelayedWrites {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(300),
        });
        let registry = registry_with(store, 10, Interval::Hour, bounded(1));

        let a = registry.get_or_create("a").await;
        assert!(a.try_remove_tokens(6));
        registry.run_pending_tasks().await;

        registry.get_or_create("b").await;
        registry.run_pending_tasks().await;
        assert!(registry.get("a").await.is_none());

        // The delayed write has not landed in the store yet.
        let reseeded = registry.get_or_create("a").await;
        assert_eq!(reseeded.tokens_remaining(), 4.0);
    }

    #[tokio::test]
    async fn test_bound_never_over_admits_new_identifier() {
        let registry = registry_with(Arc::new(MemoryStore::new()), 2, Interval::Hour, bounded(1));

        for _ in 0..20 {
            registry.get_or_create("hot").await.try_remove_tokens(1);
            registry.run_pending_tasks().await;
        }

        let mut admitted = 0;
        for _ in 0..10 {
            if registry.get_or_create("cold").await.try_remove_tokens(1) {
                admitted += 1;
            }
            registry.run_pending_tasks().await;
        }
        assert_eq!(admitted, 2);
    }

    #[tokio::test]
    async fn test_alternating_evictions_never_over_admit() {
        let store = Arc::new(DelayedWrites {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(5),
        });
        let registry = registry_with(store, 2, Interval::Hour, bounded(1));

        let mut admitted = HashMap::new();
        for _ in 0..10 {
            for identifier in ["a", "b"] {
                if registry.get_or_create(identifier).await.try_remove_tokens(1) {
                    *admitted.entry(identifier).or_insert(0) += 1;
                }
                registry.run_pending_tasks().await;
            }
        }
        assert_eq!(admitted.get("a"), Some(&2));
        assert_eq!(admitted.get("b"), Some(&2));
    }

    #[tokio::test]
    async fn test_idle_bucket_is_evicted_and_written_back() {
        let store = Arc::new(MemoryStore::new());
        let options = LimiterOptions {
            bucket_idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let registry = registry_with(store.clone(), 5, Interval::Hour, options);

        assert!(registry.get_or_create("idle").await.try_remove_tokens(2));
        tokio::time::sleep(Duration::from_millis(150)).await;
        registry.run_pending_tasks().await;

        assert!(registry.get("idle").await.is_none());
        assert_eq!(registry.len(), 0);
        assert_eq!(wait_for_value(&store, "rate-limit:idle").await, Some("3".to_string()));
    }
}
