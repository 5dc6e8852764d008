//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that creates a Redis container for testing.

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
/// use redis::AsyncCommands;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
///
/// let mut conn = redis.connection();
/// conn.set::<_, _, ()>("key", "value").await.unwrap();
///
/// // Or hand the URL to a lock store
/// let url = redis.connection_string();
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Start a Redis 8 Alpine container and connect to it.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Get a cloned multiplexed connection for direct assertions
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use test_utils::TestRedis;
    /// # use redis::AsyncCommands;
    /// # async fn example() {
    /// let redis = TestRedis::new().await;
    /// let mut conn = redis.connection();
    /// let owner: Option<String> = conn.get("schedulingLock:report:1000").await.unwrap();
    /// # }
    /// ```
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_set_nx_px_only_first_wins() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let first: Option<String> = redis::cmd("SET")
            .arg("lock")
            .arg("a")
            .arg("PX")
            .arg(60_000)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .unwrap();
        let second: Option<String> = redis::cmd("SET")
            .arg("lock")
            .arg("b")
            .arg("PX")
            .arg(60_000)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .unwrap();

        assert_eq!(first.as_deref(), Some("OK"));
        assert!(second.is_none());
        let value: String = conn.get("lock").await.unwrap();
        assert_eq!(value, "a");
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_sorted_set_range_by_score() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.zadd::<_, _, _, ()>("delayed", "late", 200).await.unwrap();
        conn.zadd::<_, _, _, ()>("delayed", "early", 100).await.unwrap();

        let due: Vec<String> = conn.zrangebyscore("delayed", "-inf", 150).await.unwrap();
        assert_eq!(due, vec!["early".to_string()]);
    }
}
