//! Redis-backed lock store.

use crate::error::JobsError;
use crate::lock::LockStore;
use async_trait::async_trait;
use bytes::Bytes;
use core_config::redis::RedisConfig;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::info;

/// Lock store on a Redis connection manager, which reconnects on failure.
#[derive(Clone)]
pub struct RedisLockStore {
    manager: ConnectionManager,
}

impl RedisLockStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Connect and verify the connection with a PING.
    pub async fn connect(url: &str) -> Result<Self, JobsError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!("Connected to Redis");
        Ok(Self { manager })
    }

    pub async fn from_config(config: &RedisConfig) -> Result<Self, JobsError> {
        Self::connect(&config.uri).await
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, JobsError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &[u8]) -> Result<u64, JobsError> {
        let mut conn = self.manager.clone();
        let added: u64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added)
    }

    async fn sorted_set_range_by_score(&self, key: &str, upper: i64) -> Result<Vec<Bytes>, JobsError> {
        let mut conn = self.manager.clone();
        let members: Vec<Vec<u8>> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(upper)
            .query_async(&mut conn)
            .await?;
        Ok(members.into_iter().map(Bytes::from).collect())
    }

    async fn sorted_set_remove_range_by_score(&self, key: &str, upper: i64) -> Result<u64, JobsError> {
        let mut conn = self.manager.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(upper)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}
