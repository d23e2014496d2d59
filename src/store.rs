use async_trait::async_trait;
use moka::{
    future::Cache,
    ops::compute::{CompResult, Op},
    Expiry,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant as StdInstant},
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{error::Result, metrics::Metrics, redis::RedisClient};

/// Result of a counter increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hits {
    /// Count for the key after this increment
    pub total_hits: u64,
    /// Time until the current window closes
    pub time_remaining: Duration,
}

impl Hits {
    /// The result reported when the store cannot answer: count this request as
    /// the first of a fresh window so the caller is allowed through.
    pub fn fail_open(window: Duration) -> Self {
        Self {
            total_hits: 1,
            time_remaining: window,
        }
    }
}

/// Which backend a store talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Redis,
    Local,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Redis => "redis",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic fixed-window counter storage
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one hit against `key`, opening a new window of length `window`
    /// if none is active. Never fails: backend errors yield [`Hits::fail_open`].
    async fn increment(&self, key: &str, window: Duration) -> Hits;

    /// Take back one hit from the active window of `key`
    async fn decrement(&self, key: &str) -> Result<()>;

    /// Forget the window of `key`
    async fn reset(&self, key: &str) -> Result<()>;

    /// Backend this store is bound to
    fn backend(&self) -> BackendKind;
}

/// Counter store backed by the shared Redis instance
pub struct DistributedStore {
    client: RedisClient,
    key_prefix: String,
    degraded: AtomicBool,
    metrics: Arc<Metrics>,
}

impl DistributedStore {
    pub fn new(client: RedisClient, key_prefix: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            degraded: AtomicBool::new(false),
            metrics,
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("Redis counter store recovered");
        }
    }

    fn mark_degraded(&self, operation: &str, error: &dyn fmt::Display) {
        self.metrics
            .record_store_error(BackendKind::Redis.as_str(), operation);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                "Redis counter store unavailable during {}, failing open: {}",
                operation, error
            );
        } else {
            debug!("Redis {} failed while degraded: {}", operation, error);
        }
    }
}

#[async_trait]
impl CounterStore for DistributedStore {
    async fn increment(&self, key: &str, window: Duration) -> Hits {
        let start = StdInstant::now();
        let result = self
            .client
            .increment_window(&self.redis_key(key), window)
            .await;
        self.metrics.record_store_operation_duration(
            BackendKind::Redis.as_str(),
            "increment",
            start.elapsed().as_secs_f64(),
        );

        match result {
            Ok((total_hits, pttl_ms)) => {
                self.mark_healthy();
                let time_remaining = if pttl_ms > 0 {
                    Duration::from_millis(pttl_ms as u64)
                } else {
                    window
                };
                Hits {
                    total_hits,
                    time_remaining,
                }
            }
            Err(e) => {
                self.mark_degraded("increment", &e);
                Hits::fail_open(window)
            }
        }
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        match self.client.decrement(&self.redis_key(key)).await {
            Ok(_) => {
                self.mark_healthy();
                Ok(())
            }
            Err(e) => {
                self.mark_degraded("decrement", &e);
                Err(e)
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<()> {
        match self.client.delete(&self.redis_key(key)).await {
            Ok(()) => {
                self.mark_healthy();
                Ok(())
            }
            Err(e) => {
                self.mark_degraded("reset", &e);
                Err(e)
            }
        }
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Redis
    }
}

/// A single window's count in the in-process store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    pub count: u64,
    pub expires_at: Instant,
}

impl CounterRecord {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            expires_at: now + window,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Evicts a record from the local map once its window has closed
struct WindowExpiry;

impl WindowExpiry {
    fn remaining(record: &CounterRecord, at: StdInstant) -> Option<Duration> {
        Some(record.expires_at.into_std().saturating_duration_since(at))
    }
}

impl Expiry<String, CounterRecord> for WindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CounterRecord,
        created_at: StdInstant,
    ) -> Option<Duration> {
        Self::remaining(value, created_at)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CounterRecord,
        updated_at: StdInstant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Self::remaining(value, updated_at)
    }
}

/// In-process counter store.
///
/// Consistent within one process only. Behind a load balancer every instance
/// keeps its own counts, so the effective quota is multiplied by the number of
/// instances.
pub struct LocalStore {
    records: Cache<String, CounterRecord>,
}

impl LocalStore {
    /// Create a store holding at most `max_keys` live windows
    pub fn new(max_keys: u64) -> Self {
        let records = Cache::builder()
            .max_capacity(max_keys)
            .expire_after(WindowExpiry)
            .build();

        Self { records }
    }

    /// Current record for a key, if its window is still open
    pub async fn get(&self, key: &str) -> Option<CounterRecord> {
        let now = Instant::now();
        self.records
            .get(key)
            .await
            .filter(|record| !record.is_expired(now))
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    async fn increment(&self, key: &str, window: Duration) -> Hits {
        let now = Instant::now();
        let result = self
            .records
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let next = match current.map(|entry| entry.into_value()) {
                    Some(record) if !record.is_expired(now) => CounterRecord {
                        count: record.count + 1,
                        ..record
                    },
                    _ => CounterRecord::fresh(now, window),
                };
                std::future::ready(Op::Put(next))
            })
            .await;

        let record = match result {
            CompResult::Inserted(entry)
            | CompResult::ReplacedWith(entry)
            | CompResult::Unchanged(entry) => entry.into_value(),
            CompResult::Removed(_) | CompResult::StillNone(_) => CounterRecord::fresh(now, window),
        };

        Hits {
            total_hits: record.count,
            time_remaining: record.expires_at.saturating_duration_since(now),
        }
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let now = Instant::now();
        self.records
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current.map(|entry| entry.into_value()) {
                    Some(record) if !record.is_expired(now) => Op::Put(CounterRecord {
                        count: record.count.saturating_sub(1),
                        ..record
                    }),
                    Some(_) => Op::Remove,
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.records.invalidate(key).await;
        Ok(())
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Local
    }
}
