use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// No connection to the cache could be obtained at all.
    #[error("cache is unavailable: {0}")]
    Unavailable(String),
    #[error("cache command failed: {0}")]
    Command(String),
    #[error("cache command timed out")]
    Timeout,
}

impl CacheError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::Unavailable(_))
    }
}

/// A key/value cache with per-entry expiry. Best effort: callers treat every
/// error as a miss.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, ttl: Duration, value: &str) -> Result<(), CacheError>;
}

pub struct RedisCache {
    client: redis::Client,
    response_timeout: Duration,
}

impl RedisCache {
    pub fn new(addr: String, response_timeout: Duration) -> Result<RedisCache, CacheError> {
        let client =
            redis::Client::open(addr).map_err(|e| CacheError::Unavailable(e.to_string()))?;

        Ok(RedisCache {
            client,
            response_timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        match timeout(
            self.response_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(CacheError::Unavailable(e.to_string())),
            Err(_) => Err(CacheError::Unavailable(
                "timed out while connecting".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;

        let results = conn.get::<_, Option<String>>(key);
        let value = timeout(self.response_timeout, results)
            .await
            .map_err(|_| CacheError::Timeout)?
            .map_err(|e| CacheError::Command(e.to_string()))?;

        Ok(value)
    }

    async fn set(&self, key: &str, ttl: Duration, value: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let seconds = usize::try_from(ttl.as_secs()).unwrap_or(usize::MAX);

        let results = conn.set_ex::<_, _, ()>(key, value, seconds);
        timeout(self.response_timeout, results)
            .await
            .map_err(|_| CacheError::Timeout)?
            .map_err(|e| CacheError::Command(e.to_string()))?;

        Ok(())
    }
}
