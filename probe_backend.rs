// Checks that the configured Redis backend is reachable and behaves like a
// fixed-window counter store, without starting the HTTP server.
// Run this with: cargo run --bin probe_backend

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use news_ratelimit::{
    config::Settings,
    redis::{RedisClient, RedisConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Probing rate limit backend...");
    let start_time = Instant::now();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let mut settings = Settings::load(config_path.as_deref())?;
    if let Ok(url) = std::env::var("REDIS_URL") {
        settings.redis.url = Some(url);
    }

    let Some(config) = settings.redis.client_config() else {
        warn!("No Redis URL configured; the service would run with per-instance counters");
        return Ok(());
    };

    probe_redis(config, &settings.redis.key_prefix).await?;

    info!("Backend probe completed in {:?}", start_time.elapsed());
    Ok(())
}

async fn probe_redis(config: RedisConfig, key_prefix: &str) -> Result<()> {
    info!("Using Redis URL: {}", config.url);
    let deadline = config.connection_timeout * 2;

    let connection_start = Instant::now();
    let client = match tokio::time::timeout(deadline, RedisClient::connect(config)).await {
        Ok(Ok(client)) => {
            info!("Connected in {:?}", connection_start.elapsed());
            client
        }
        Ok(Err(e)) => {
            error!("Redis connection failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("Redis connection timed out after {:?}", deadline);
            error!("This suggests a network connectivity issue or Redis server is not responding");
            return Err(anyhow::anyhow!("Redis connection timeout"));
        }
    };

    let health_start = Instant::now();
    client.health_check().await?;
    info!("Health check passed in {:?}", health_start.elapsed());

    // one short window, counted twice
    let key = format!(
        "{}probe:{}",
        key_prefix,
        chrono::Utc::now().timestamp_millis()
    );
    let window = Duration::from_secs(5);

    let (first, ttl_ms) = client.increment_window(&key, window).await?;
    let (second, _) = client.increment_window(&key, window).await?;
    if first != 1 || second != 2 {
        return Err(anyhow::anyhow!(
            "unexpected counts from {}: {} then {}",
            key,
            first,
            second
        ));
    }
    if ttl_ms <= 0 {
        return Err(anyhow::anyhow!(
            "window key {} has no expiry (PTTL {}); PEXPIRE NX needs Redis 7 or newer",
            key,
            ttl_ms
        ));
    }
    info!("Window counter ok ({} ms left)", ttl_ms);

    client.delete(&key).await?;
    Ok(())
}
