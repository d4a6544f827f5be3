use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::{sync::Arc, time::Duration};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{
    error::{AdmissionError, Result},
    store::PersistenceStore,
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
        }
    }
}

impl RedisConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Redis-backed [`PersistenceStore`]
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with PING
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting to Redis");

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            AdmissionError::Redis(e)
        })?;

        let connection_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connection_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(AdmissionError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}s)",
                    connection_timeout.as_secs()
                );
                return Err(AdmissionError::StoreTimeout(connection_timeout));
            }
        };

        let store = Self { connection, config };
        store.ping().await?;

        info!("Redis store initialized successfully");
        Ok(store)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.with_timeout(redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await?;
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        command: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match self.config.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, command).await {
                Ok(result) => result.map_err(AdmissionError::Redis),
                Err(_) => Err(AdmissionError::StoreTimeout(limit)),
            },
            None => command.await.map_err(AdmissionError::Redis),
        }
    }
}

#[async_trait]
impl PersistenceStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value = self
            .with_timeout(
                redis::cmd("GET")
                    .arg(key)
                    .query_async::<_, Option<String>>(&mut conn),
            )
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, expire_seconds: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        self.with_timeout(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(expire_seconds.max(1))
                .query_async::<_, ()>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }
}

static SHARED_STORE: OnceCell<Arc<RedisStore>> = OnceCell::const_new();

/// Process-wide Redis connection, created on first use and shared afterwards.
///
/// Only the configuration passed to the first successful call is used. A failed
/// attempt leaves the cell empty so a later call can retry.
pub async fn shared_store(config: RedisConfig) -> Result<Arc<RedisStore>> {
    SHARED_STORE
        .get_or_try_init(|| async move { RedisStore::connect(config).await.map(Arc::new) })
        .await
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.command_timeout, Some(Duration::from_secs(1)));

        let config = RedisConfig::with_url("redis://cache:6380");
        assert_eq!(config.url, "redis://cache:6380");
        assert_eq!(config.connection_timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisStore::connect(RedisConfig::with_url("not a redis url")).await;
        assert!(matches!(result, Err(AdmissionError::Redis(_))));
    }

    // Requires a Redis server on localhost:6379
    #[tokio::test]
    #[ignore]
    async fn test_redis_store_round_trip() {
        let store = RedisStore::connect(RedisConfig::default()).await.unwrap();
        store.set("rate-limit:redis-test", "3", 60).await.unwrap();
        assert_eq!(
            store.get("rate-limit:redis-test").await.unwrap(),
            Some("3".to_string())
        );
        assert_eq!(store.get("rate-limit:redis-missing").await.unwrap(), None);
        store.health_check().await.unwrap();
    }
}
