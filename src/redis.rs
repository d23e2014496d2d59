use redis::{aio::ConnectionManager, RedisResult};
use std::{future::Future, time::Duration};
use tracing::{info, warn};

use crate::{
    error::{RateLimitError, Result},
    utils::window_millis,
};

/// Decrements a counter only while its window is still alive, so an expired
/// key is never recreated without a TTL.
const DECREMENT_IF_PRESENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    local current = redis.call('DECR', KEYS[1])
    if current < 0 then
        redis.call('SET', KEYS[1], 0, 'KEEPTTL')
        return 0
    end
    return current
end
return 0
"#;

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// Redis connection shared by the counter stores and the cache.
///
/// Cloning is cheap: every clone multiplexes over the same `ConnectionManager`,
/// which reconnects on its own after the server comes back.
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisClient {
    /// Open a connection and verify it with a `PING` handshake
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Connecting to Redis at {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Invalid Redis URL {}: {}", config.url, e);
            RateLimitError::BackendUnavailable(format!("invalid Redis URL: {}", e))
        })?;

        let connection = match tokio::time::timeout(
            config.connection_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::BackendUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!(
                    "Timeout while connecting to Redis ({}ms)",
                    config.connection_timeout.as_millis()
                );
                return Err(RateLimitError::BackendUnavailable(
                    "timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let client = Self { connection, config };
        client.health_check().await.map_err(|e| {
            warn!("Redis handshake failed: {}", e);
            RateLimitError::BackendUnavailable(format!("handshake failed: {}", e))
        })?;

        info!("Redis connection ready");
        Ok(client)
    }

    /// Configuration this client was built with
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Timeout(self.config.command_timeout)),
        }
    }

    /// Increment a window counter and start its expiry if the key is new.
    ///
    /// Runs `INCR`, `PEXPIRE .. NX` and `PTTL` as one `MULTI`/`EXEC` round trip
    /// and returns the post-increment count with the remaining TTL in
    /// milliseconds. `PEXPIRE NX` requires Redis 7.
    pub async fn increment_window(&self, key: &str, window: Duration) -> Result<(u64, i64)> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_millis(window))
            .arg("NX")
            .ignore()
            .cmd("PTTL")
            .arg(key);

        self.bounded(pipe.query_async::<_, (u64, i64)>(&mut conn))
            .await
    }

    /// Decrement a counter that still exists, never going below zero
    pub async fn decrement(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let script = redis::Script::new(DECREMENT_IF_PRESENT);
        let invocation = script.key(key);
        self.bounded(invocation.invoke_async::<_, i64>(&mut conn))
            .await
    }

    /// Delete a key
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.bounded(cmd.query_async::<_, ()>(&mut conn)).await
    }

    /// Read a string value
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.bounded(cmd.query_async::<_, Option<String>>(&mut conn))
            .await
    }

    /// Write a string value with an expiry in whole seconds
    pub async fn set_string_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs);
        self.bounded(cmd.query_async::<_, ()>(&mut conn)).await
    }

    /// Remaining time to live of a key, `None` when missing or persistent
    pub async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let millis = self.bounded(cmd.query_async::<_, i64>(&mut conn)).await?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let cmd = redis::cmd("PING");
        self.bounded(cmd.query_async::<_, ()>(&mut conn)).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.command_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_invalid_url_is_backend_unavailable() {
        let config = RedisConfig {
            url: "not a redis url".to_string(),
            ..Default::default()
        };

        match RedisClient::connect(config).await {
            Err(RateLimitError::BackendUnavailable(msg)) => assert!(msg.contains("invalid")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connecting to an invalid URL should fail"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_is_backend_unavailable() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(200),
        };

        let result = RedisClient::connect(config).await;
        assert!(matches!(result, Err(RateLimitError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_dropped_connection_surfaces_errors() {
        let client = RedisClient::connect(flaky_server::hang_up_after_ping().await)
            .await
            .unwrap();

        assert!(client
            .increment_window("k", Duration::from_secs(60))
            .await
            .is_err());
        assert!(client.decrement("k").await.is_err());
        assert!(client.health_check().await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires a Redis 7 server at REDIS_URL"]
    async fn test_increment_window_against_live_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let client = RedisClient::connect(RedisConfig {
            url,
            ..Default::default()
        })
        .await
        .unwrap();

        let key = format!(
            "test:increment_window:{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap()
        );
        let (first, ttl) = client.increment_window(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first, 1);
        assert!(ttl > 0 && ttl <= 60_000);

        let (second, _) = client.increment_window(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(second, 2);

        assert_eq!(client.decrement(&key).await.unwrap(), 1);
        client.delete(&key).await.unwrap();
        assert_eq!(client.decrement(&key).await.unwrap(), 0);
        assert!(client.pttl(&key).await.unwrap().is_none());
    }
}
