use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

// ============================================================================
// STORAGE BACKEND ABSTRACTION
// ============================================================================

/// Key-value store with atomic counters, shared by the cache and the limiter.
///
/// Values are opaque strings. Entries expire after their TTL; `None` means no expiry.
/// Remote implementations report every I/O failure as
/// [`TollgateError::BackendUnavailable`](crate::TollgateError::BackendUnavailable).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Adds one to the counter at `key` and returns the new count.
    ///
    /// An absent counter starts at 1 and expires after `ttl`. Later increments keep the
    /// original expiry. Must be a single atomic step, never a get followed by a set.
    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Result<u64>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Drops every entry this backend owns.
    async fn clear(&self) -> Result<()>;
}
