use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    config::{LimiterOptions, RateLimitConfig},
    error::Result,
    metrics::Metrics,
    redis::{shared_store, RedisConfig},
    registry::LimiterRegistry,
    store::{MemoryStore, PersistenceStore, StateStore},
    utils::{SystemTimeSource, TimeSource},
};

/// Admission decisions and best-effort persistence of per-identifier state
#[derive(Clone)]
pub struct RateLimitManager {
    config: RateLimitConfig,
    registry: LimiterRegistry,
    state: StateStore,
    metrics: Arc<Metrics>,
}

impl RateLimitManager {
    /// Create a manager over `store` with default options
    pub fn new(config: RateLimitConfig, store: Arc<dyn PersistenceStore>) -> Result<Self> {
        Self::builder(config).store(store).build()
    }

    pub fn builder(config: RateLimitConfig) -> ManagerBuilder {
        ManagerBuilder {
            config,
            store: None,
            options: LimiterOptions::default(),
            time_source: None,
            metrics: None,
        }
    }

    /// Decide whether a request from `identifier` must be rejected.
    ///
    /// Returns `false` when admitted, in which case one token was consumed.
    pub async fn is_rate_limited(&self, identifier: &str) -> bool {
        let _timer = self.metrics.start_decision_timer();
        let bucket = self.registry.get_or_create(identifier).await;

        if bucket.try_remove_tokens(1) {
            self.metrics.record_admitted();
            false
        } else {
            debug!(identifier, "Rate limit exceeded");
            self.metrics.record_rejected();
            true
        }
    }

    /// Persist the current balance of `identifier`, if it has a bucket
    pub async fn save_state(&self, identifier: &str) -> Result<()> {
        let Some(bucket) = self.registry.get(identifier).await else {
            return Ok(());
        };

        let remaining = bucket.tokens_remaining().floor() as u64;
        self.state.save(identifier, remaining).await
    }

    /// Fire-and-forget [`save_state`](Self::save_state); failures are logged
    pub fn spawn_save_state(&self, identifier: impl Into<String>) {
        let manager = self.clone();
        let identifier = identifier.into();
        tokio::spawn(async move {
            if let Err(e) = manager.save_state(&identifier).await {
                warn!(identifier = %identifier, error = %e, "Failed to save rate limit state");
            }
        });
    }

    /// Current balance of `identifier`, `None` if it has no bucket yet
    pub async fn tokens_remaining(&self, identifier: &str) -> Option<f64> {
        self.registry
            .get(identifier)
            .await
            .map(|bucket| bucket.tokens_remaining())
    }

    /// Number of buckets held in memory
    pub async fn bucket_count(&self) -> u64 {
        self.registry.run_pending_tasks().await;
        let count = self.registry.len();
        self.metrics.set_buckets_active(count);
        count
    }

    pub async fn health_check(&self) -> Result<()> {
        self.state.health_check().await
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Builder for [`RateLimitManager`]
pub struct ManagerBuilder {
    config: RateLimitConfig,
    store: Option<Arc<dyn PersistenceStore>>,
    options: LimiterOptions,
    time_source: Option<Arc<dyn TimeSource>>,
    metrics: Option<Arc<Metrics>>,
}

impl ManagerBuilder {
    pub fn store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(mut self, options: LimiterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(time_source);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the manager, falling back to an in-memory store
    pub fn build(self) -> Result<RateLimitManager> {
        let store: Arc<dyn PersistenceStore> = match self.store.clone() {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        self.assemble(store)
    }

    /// Build the manager, falling back to the process-wide Redis connection
    pub async fn build_with_shared_redis(self, redis: RedisConfig) -> Result<RateLimitManager> {
        self.config.validate()?;
        let store: Arc<dyn PersistenceStore> = match self.store.clone() {
            Some(store) => store,
            None => shared_store(redis).await?,
        };
        self.assemble(store)
    }

    fn assemble(self, store: Arc<dyn PersistenceStore>) -> Result<RateLimitManager> {
        self.config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new()?),
        };
        let time_source = self
            .time_source
            .unwrap_or_else(|| Arc::new(SystemTimeSource::new()));

        let state = StateStore::new(store, &self.options, metrics.clone());
        let registry = LimiterRegistry::new(
            self.config.clone(),
            state.clone(),
            &self.options,
            time_source,
        );

        Ok(RateLimitManager {
            config: self.config,
            registry,
            state,
            metrics,
        })
    }
}
