use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{config::CacheSettings, metrics::Metrics, redis::RedisClient, utils::ceil_secs};

/// Read-through cache for derived values such as aggregate feeds.
///
/// Never fails: an unreachable backend turns every `get` into a miss and every
/// `set` into a no-op, so callers always fall back to computing fresh values.
/// Concurrent writers race and the last write wins.
pub struct CacheService {
    backend: Option<RedisClient>,
    key_prefix: String,
    default_ttl: Duration,
    degraded: AtomicBool,
    metrics: Arc<Metrics>,
}

impl CacheService {
    pub fn new(
        backend: Option<RedisClient>,
        settings: &CacheSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        if backend.is_none() {
            info!("No cache backend available, every cache lookup will miss");
        }

        Self {
            backend,
            key_prefix: settings.key_prefix.clone(),
            default_ttl: Duration::from_secs(settings.default_ttl_secs),
            degraded: AtomicBool::new(false),
            metrics,
        }
    }

    /// A cache with no backend
    pub fn disabled(metrics: Arc<Metrics>) -> Self {
        Self::new(None, &CacheSettings::default(), metrics)
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("Cache backend recovered");
        }
    }

    fn mark_degraded(&self, operation: &str, error: &dyn fmt::Display) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!("Cache backend unavailable during {}, bypassing cache: {}", operation, error);
        } else {
            debug!("Cache {} failed while degraded: {}", operation, error);
        }
    }

    /// Cached value for `key`, or `None` on miss, decode failure or backend error
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(backend) = &self.backend else {
            self.metrics.record_cache_lookup("miss");
            return None;
        };

        let raw = match backend.get_string(&self.cache_key(key)).await {
            Ok(raw) => {
                self.mark_healthy();
                raw
            }
            Err(e) => {
                self.metrics.record_cache_lookup("error");
                self.mark_degraded("get", &e);
                return None;
            }
        };

        let Some(raw) = raw else {
            self.metrics.record_cache_lookup("miss");
            return None;
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.metrics.record_cache_lookup("hit");
                Some(value)
            }
            Err(e) => {
                self.metrics.record_cache_lookup("miss");
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`. A zero TTL stores nothing.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(backend) = &self.backend else {
            return;
        };

        let ttl_secs = ceil_secs(ttl);
        if ttl_secs == 0 {
            debug!("Not caching {} with a zero TTL", key);
            return;
        }

        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize cache entry {}: {}", key, e);
                return;
            }
        };

        match backend
            .set_string_ex(&self.cache_key(key), &payload, ttl_secs)
            .await
        {
            Ok(()) => self.mark_healthy(),
            Err(e) => self.mark_degraded("set", &e),
        }
    }

    /// Remaining lifetime of a cached entry
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let backend = self.backend.as_ref()?;
        match backend.pttl(&self.cache_key(key)).await {
            Ok(ttl) => {
                self.mark_healthy();
                ttl
            }
            Err(e) => {
                self.mark_degraded("ttl", &e);
                None
            }
        }
    }

    /// Drop a cached entry, e.g. after the underlying data changed
    pub async fn invalidate(&self, key: &str) {
        let Some(backend) = &self.backend else {
            return;
        };
        match backend.delete(&self.cache_key(key)).await {
            Ok(()) => self.mark_healthy(),
            Err(e) => self.mark_degraded("invalidate", &e),
        }
    }

    /// Cache-aside: return the cached value or compute, store and return it.
    ///
    /// Errors from `compute` are returned as-is and nothing is cached.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}
