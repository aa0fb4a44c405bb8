// Tollgate - Fixed-Window Rate Limiting & Tiered Caching
// File: tollgate-core/src/lib.rs

//! Request throttling and result caching for stateless API workers.
//!
//! Both the [`Cache`] and the [`RateLimiter`] go through a [`TieredStore`]: a distributed
//! [`StorageBackend`] when one is configured, and the process-local [`MemoryBackend`]
//! whenever it is absent or failing. Neither surfaces backend errors to callers.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod error;
pub mod keys;
pub mod limiter;
pub mod memory;
pub mod policy;
pub mod tiered;

pub use backend::StorageBackend;
pub use cache::Cache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TollgateError};
pub use keys::{cache_key, derive_key};
pub use limiter::{Decision, Guarded, RateLimiter, Rejection, RejectionBody};
pub use memory::{MemoryBackend, DEFAULT_SWEEP_INTERVAL};
pub use policy::{PolicyRegistry, RateLimitPolicy};
pub use tiered::{TieredStore, DEFAULT_BACKEND_TIMEOUT};
