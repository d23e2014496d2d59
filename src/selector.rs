use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{
    config::Settings,
    error::{RateLimitError, Result},
    metrics::Metrics,
    redis::{RedisClient, RedisConfig},
    store::{BackendKind, CounterStore, DistributedStore, LocalStore},
};

/// Hands out counter stores, preferring Redis and degrading to in-process
/// stores when Redis cannot be reached.
///
/// The connection is attempted once, on first use, and its outcome holds for
/// the rest of the process lifetime.
pub struct StoreSelector {
    redis: Option<RedisConfig>,
    key_prefix: String,
    local_max_keys: u64,
    connection: OnceCell<Option<RedisClient>>,
    metrics: Arc<Metrics>,
}

impl StoreSelector {
    pub fn new(settings: &Settings, metrics: Arc<Metrics>) -> Self {
        Self {
            redis: settings.redis.client_config(),
            key_prefix: settings.redis.key_prefix.clone(),
            local_max_keys: settings.local.max_keys,
            connection: OnceCell::new(),
            metrics,
        }
    }

    /// A selector that never tries Redis
    pub fn local_only(metrics: Arc<Metrics>) -> Self {
        Self::new(&Settings::default(), metrics)
    }

    async fn connection(&self) -> Option<&RedisClient> {
        self.connection
            .get_or_init(|| async {
                let Some(config) = self.redis.clone() else {
                    info!("No Redis URL configured, rate limiting in local-only mode");
                    return None;
                };

                match RedisClient::connect(config).await {
                    Ok(client) => Some(client),
                    Err(e) => {
                        warn!(
                            "Redis unavailable ({}), falling back to in-process counters; \
                             quotas are now enforced per instance",
                            e
                        );
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    /// Backend the selector settled on
    pub async fn backend(&self) -> BackendKind {
        match self.connection().await {
            Some(_) => BackendKind::Redis,
            None => BackendKind::Local,
        }
    }

    /// Store for one policy. Called once per policy at catalog construction.
    pub async fn counter_store(&self) -> Arc<dyn CounterStore> {
        match self.connection().await {
            Some(client) => Arc::new(DistributedStore::new(
                client.clone(),
                self.key_prefix.clone(),
                self.metrics.clone(),
            )),
            None => {
                if self.redis.is_some() {
                    self.metrics.record_store_fallback();
                }
                Arc::new(LocalStore::new(self.local_max_keys))
            }
        }
    }

    /// Shared connection for the cache, if Redis is in use
    pub async fn cache_backend(&self) -> Option<RedisClient> {
        self.connection().await.cloned()
    }

    /// Ping Redis when it is the active backend; local mode is always healthy
    pub async fn health_check(&self) -> Result<BackendKind> {
        match self.connection().await {
            Some(client) => {
                client.health_check().await.map_err(|e| {
                    RateLimitError::BackendUnavailable(format!("Redis ping failed: {}", e))
                })?;
                Ok(BackendKind::Redis)
            }
            None => Ok(BackendKind::Local),
        }
    }
}
