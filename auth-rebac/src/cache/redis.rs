//! Redis-backed L2 cache store

use crate::{cache::CacheStore, error::RebacError};
use ::redis::{aio::ConnectionManager, AsyncCommands};
use async_trait::async_trait;
use std::time::Duration;

/// L2 store over a multiplexed Redis connection. Cloning the manager is cheap;
/// every call works on its own handle.
#[derive(Clone)]
pub struct RedisCacheStore {
    redis: ConnectionManager,
}

impl RedisCacheStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, RebacError> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| RebacError::CacheError(format!("Failed to create Redis client: {}", e)))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| RebacError::CacheError(format!("Failed to connect to Redis: {}", e)))?;
        Ok(Self::new(redis))
    }

    pub async fn health_check(&self) -> Result<(), RebacError> {
        let mut conn = self.redis.clone();
        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| RebacError::CacheError(format!("Redis health check failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RebacError> {
        let mut conn = self.redis.clone();
        conn.get(key)
            .await
            .map_err(|e| RebacError::CacheError(format!("Redis GET failed: {}", e)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RebacError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| RebacError::CacheError(format!("Redis SET failed: {}", e)))
    }

    async fn delete(&self, key: &str) -> Result<(), RebacError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| RebacError::CacheError(format!("Redis DEL failed: {}", e)))
    }
}
