// ============================================================================
// IN-MEMORY BACKEND (Local Fallback Store)
// ============================================================================

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::StorageBackend;
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::Result;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Expiry stored for entries written without a TTL.
const NEVER_EXPIRES: u64 = u64::MAX;

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    Counter(u64),
}

impl Slot {
    fn render(&self) -> String {
        match self {
            Slot::Text(text) => text.clone(),
            Slot::Counter(count) => count.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: u64,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at < now
    }
}

/// Process-local store over a sharded map. Cannot fail.
///
/// Every operation locks only the shard holding its key. Expired entries are dropped
/// lazily on read and in bulk by the sweeper (see [`MemoryBackend::start_sweeper`]).
/// Counts held here are private to this process.
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expiry(&self, now: u64, ttl: Option<Duration>) -> u64 {
        match ttl {
            Some(ttl) => now.saturating_add(duration_millis(ttl)),
            None => NEVER_EXPIRES,
        }
    }

    /// Removes every expired entry and returns how many were dropped.
    ///
    /// Walks the map one shard at a time, so writers to other shards are never blocked.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Starts the background sweep task for this store.
    ///
    /// Meant to be called once during process start-up and left running until shutdown.
    /// Returns `false` when a sweeper is already running. The task holds only a weak
    /// reference, so it also ends once the store is dropped. Intervals below 1ms are
    /// raised to 1ms.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> bool {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let mut slot = self.sweeper.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        let store: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = store.len(),
                        "Swept expired local entries"
                    );
                }
            }
        }));
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            "Local store sweeper started"
        );
        true
    }

    /// Stops the sweep task. Only used at process shutdown.
    pub fn stop_sweeper(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
            tracing::info!("Local store sweeper stopped");
        }
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

impl MemoryBackend {
    pub fn read(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.slot.render()),
            Some(_) => {}
        }
        // Shard guard released above; re-check under the write lock in case of a fresh set.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    pub fn write(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = self.expiry(self.clock.now_millis(), ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value),
                expires_at,
            },
        );
    }

    /// Atomic increment, see [`StorageBackend::increment_and_expire`].
    pub fn increment(&self, key: &str, ttl: Duration) -> u64 {
        let now = self.clock.now_millis();
        let fresh = Entry {
            slot: Slot::Counter(0),
            expires_at: self.expiry(now, Some(ttl)),
        };

        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| fresh.clone());
        if entry.is_expired(now) {
            *entry = fresh.clone();
        }

        let current = match &entry.slot {
            Slot::Counter(count) => Some(*count),
            Slot::Text(text) => text.parse::<u64>().ok(),
        };
        let next = match current {
            Some(count) => count.saturating_add(1),
            // Non-numeric text: restart as a fresh counter.
            None => {
                entry.expires_at = fresh.expires_at;
                1
            }
        };
        entry.slot = Slot::Counter(next);
        next
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read(key).is_some()
    }

    pub fn purge(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.write(key, value, ttl);
        Ok(())
    }

    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        Ok(self.increment(key, ttl))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.contains(key))
    }

    async fn clear(&self) -> Result<()> {
        self.purge();
        Ok(())
    }
}
