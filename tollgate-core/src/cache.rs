// ============================================================================
// CACHE FACADE
// ============================================================================

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::tiered::TieredStore;

pub const DEFAULT_SLOW_PRODUCER: Duration = Duration::from_secs(1);

/// Typed cache over a [`TieredStore`]. Values are stored as JSON.
///
/// No operation fails: backend trouble shows up as a miss, never as an error.
#[derive(Clone)]
pub struct Cache {
    store: TieredStore,
    slow_producer: Duration,
}

impl Cache {
    pub fn new(store: TieredStore) -> Self {
        Self {
            store,
            slow_producer: DEFAULT_SLOW_PRODUCER,
        }
    }

    /// Producers slower than `threshold` are reported at warn level.
    pub fn with_slow_producer_threshold(mut self, threshold: Duration) -> Self {
        self.slow_producer = threshold;
        self
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.store.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    key,
                    error = %e,
                    "Cached value could not be decoded, treating as miss"
                );
                None
            }
        }
    }

    /// Stores `value` for `ttl` (`None` keeps it until deleted).
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.store.set(key, raw, ttl).await,
            Err(e) => {
                tracing::warn!(key, error = %e, "Value could not be encoded, not cached");
            }
        }
    }

    pub async fn del(&self, key: &str) {
        self.store.delete(key).await;
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.store.exists(key).await
    }

    /// Drops every entry in the active backend. Maintenance and tests only.
    pub async fn clear(&self) {
        tracing::warn!(backend = self.store.active_backend(), "Clearing cache");
        self.store.clear().await;
    }

    /// Read-through memoization.
    ///
    /// On a hit the stored value is returned and `producer` is not called. On a miss the
    /// produced value is stored for `ttl` and returned. Concurrent misses on the same key
    /// are not coalesced; each caller may run `producer`.
    pub async fn cached<T, F, Fut>(&self, key: &str, producer: F, ttl: Duration) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            tracing::trace!(key, "Cache hit");
            return hit;
        }

        let value = self.produce(key, producer()).await;
        self.set(key, &value, Some(ttl)).await;
        value
    }

    /// Like [`Cache::cached`] for fallible producers. Errors are returned and never stored.
    pub async fn try_cached<T, E, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Duration,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            tracing::trace!(key, "Cache hit");
            return Ok(hit);
        }

        let value = self.produce(key, producer()).await?;
        self.set(key, &value, Some(ttl)).await;
        Ok(value)
    }

    async fn produce<O>(&self, key: &str, work: impl Future<Output = O>) -> O {
        let started = Instant::now();
        let output = work.await;
        let elapsed = started.elapsed();
        if elapsed > self.slow_producer {
            tracing::warn!(
                key,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_producer.as_millis() as u64,
                "Slow cache producer"
            );
        }
        output
    }
}
