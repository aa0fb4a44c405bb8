// ============================================================================
// TIERED STORE (distributed first, local fallback)
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::StorageBackend;
use crate::error::Result;
use crate::memory::MemoryBackend;

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Routes each operation to the distributed backend and falls back to the local store.
///
/// Each call makes a single attempt against the primary under `timeout`. Any error or
/// timeout is logged at warn and the same operation runs on the local store instead.
///
/// The two backends are alternatives, not replicas. Nothing is dual-written and nothing
/// is migrated on failover, so a switch mid-window restarts counts at whatever the newly
/// active backend holds. While the primary is down each process counts on its own,
/// which lets up to `max_requests x process_count` through per window.
#[derive(Clone)]
pub struct TieredStore {
    primary: Option<Arc<dyn StorageBackend>>,
    local: Arc<MemoryBackend>,
    timeout: Duration,
}

impl TieredStore {
    pub fn new(primary: Option<Arc<dyn StorageBackend>>, local: Arc<MemoryBackend>) -> Self {
        Self {
            primary,
            local,
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    /// Single-instance deployment: the local store is the only backend.
    pub fn local_only(local: Arc<MemoryBackend>) -> Self {
        Self::new(None, local)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local(&self) -> &Arc<MemoryBackend> {
        &self.local
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Name of the backend that would serve the next call if it succeeds.
    pub fn active_backend(&self) -> &'static str {
        match &self.primary {
            Some(primary) => primary.name(),
            None => self.local.name(),
        }
    }

    /// Runs `call` under the timeout. `None` means "use the local store".
    async fn attempt<T, F>(
        &self,
        backend: &'static str,
        op: &'static str,
        key: &str,
        call: F,
    ) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!(
                    backend,
                    op,
                    key,
                    error = %e,
                    "Distributed backend failed, falling back to local store"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    backend,
                    op,
                    key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Distributed backend timed out, falling back to local store"
                );
                None
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(primary) = &self.primary {
            if let Some(value) = self.attempt(primary.name(), "get", key, primary.get(key)).await {
                return value;
            }
        }
        self.local.read(key)
    }

    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        if let Some(primary) = &self.primary {
            let call = primary.set(key, value.clone(), ttl);
            if self.attempt(primary.name(), "set", key, call).await.is_some() {
                return;
            }
        }
        self.local.write(key, value, ttl);
    }

    pub async fn increment_and_expire(&self, key: &str, ttl: Duration) -> u64 {
        if let Some(primary) = &self.primary {
            let call = primary.increment_and_expire(key, ttl);
            if let Some(count) = self.attempt(primary.name(), "incr", key, call).await {
                return count;
            }
        }
        self.local.increment(key, ttl)
    }

    pub async fn delete(&self, key: &str) {
        if let Some(primary) = &self.primary {
            if self
                .attempt(primary.name(), "delete", key, primary.delete(key))
                .await
                .is_some()
            {
                return;
            }
        }
        self.local.remove(key);
    }

    pub async fn exists(&self, key: &str) -> bool {
        if let Some(primary) = &self.primary {
            let call = primary.exists(key);
            if let Some(found) = self.attempt(primary.name(), "exists", key, call).await {
                return found;
            }
        }
        self.local.contains(key)
    }

    /// Clears the active backend only.
    pub async fn clear(&self) {
        if let Some(primary) = &self.primary {
            if self
                .attempt(primary.name(), "clear", "*", primary.clear())
                .await
                .is_some()
            {
                return;
            }
        }
        self.local.purge();
    }
}
