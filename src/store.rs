use async_trait::async_trait;
use moka::{future::Cache, Expiry};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    config::LimiterOptions,
    error::{AdmissionError, Result},
    metrics::Metrics,
};

/// Prefix of every persisted remaining-token key
pub const STATE_KEY_PREFIX: &str = "rate-limit:";

/// Build the persistence key for an identifier
pub fn state_key(identifier: &str) -> String {
    format!("{}{}", STATE_KEY_PREFIX, identifier)
}

/// Keyed storage with expiry, shared across restarts and instances
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Fetch the last value stored under `key`, `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key` for `expire_seconds`, replacing any prior value
    async fn set(&self, key: &str, value: &str, expire_seconds: u64) -> Result<()>;

    /// Health check for the backing store
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process store with per-entry expiry
#[derive(Clone)]
pub struct MemoryStore {
    entries: Cache<String, (Duration, String)>,
}

struct EntryExpiry;

impl Expiry<String, (Duration, String)> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &(Duration, String),
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(value.0)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &(Duration, String),
        _current_time: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.0)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry)
            .build();
        Self { entries }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).await.map(|(_, value)| value))
    }

    async fn set(&self, key: &str, value: &str, expire_seconds: u64) -> Result<()> {
        self.entries
            .insert(
                key.to_string(),
                (Duration::from_secs(expire_seconds), value.to_string()),
            )
            .await;
        Ok(())
    }
}

/// Remaining-token persistence protocol on top of a [`PersistenceStore`].
///
/// Owns key formatting, the TTL, the per-call timeout, and failure logging.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn PersistenceStore>,
    ttl_secs: u64,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl StateStore {
    pub fn new(store: Arc<dyn PersistenceStore>, options: &LimiterOptions, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            ttl_secs: options.state_ttl_secs,
            timeout: options.store_timeout,
            metrics,
        }
    }

    /// Read the persisted remaining-token count for `identifier`.
    ///
    /// Absent, malformed, failed and timed-out reads all yield `None`.
    pub async fn load(&self, identifier: &str) -> Option<u64> {
        let key = state_key(identifier);
        let result = self.timed("get", self.store.get(&key)).await;

        match result {
            Ok(Some(raw)) => match parse_remaining(&raw) {
                Some(remaining) => {
                    debug!(key = %key, remaining, "Loaded persisted rate limit state");
                    Some(remaining)
                }
                None => {
                    warn!(key = %key, value = %raw, "Ignoring malformed persisted rate limit state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to load rate limit state, starting full");
                None
            }
        }
    }

    /// Persist `remaining` whole tokens for `identifier`
    pub async fn save(&self, identifier: &str, remaining: u64) -> Result<()> {
        let key = state_key(identifier);
        let value = remaining.to_string();
        self.timed("set", self.store.set(&key, &value, self.ttl_secs))
            .await?;
        debug!(key = %key, remaining, ttl_secs = self.ttl_secs, "Persisted rate limit state");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        self.timed("ping", self.store.health_check()).await
    }

    async fn timed<T>(&self, operation: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::StoreTimeout(self.timeout)),
        };

        self.metrics
            .record_store_operation_duration(operation, started.elapsed().as_secs_f64());
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics.record_store_operation(operation, outcome);
        result
    }
}

/// Parse a persisted count, accepting integer or decimal text
fn parse_remaining(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<u64>() {
        return Some(value);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value.max(0.0).floor() as u64),
        _ => None,
    }
}
