// ============================================================================
// RATE LIMITER FACADE (fixed window)
// ============================================================================

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::keys::{derive_key, window_end};
use crate::policy::RateLimitPolicy;
use crate::tiered::TieredStore;

pub const COUNTER_PREFIX: &str = "ratelimit";

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Outcome of one `allow` call. Derived per call, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch-ms at which the current window ends.
    pub reset_at_ms: u64,
    pub total_so_far: u64,
}

impl Decision {
    fn new(policy: &RateLimitPolicy, total_so_far: u64, reset_at_ms: u64) -> Self {
        let limit = policy.max_requests();
        Self {
            allowed: total_so_far <= limit,
            limit,
            remaining: limit.saturating_sub(total_so_far),
            reset_at_ms,
            total_so_far,
        }
    }

    /// Whole seconds until the window resets, rounded up, never negative.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
    }

    /// `X-RateLimit-*` headers describing this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at_ms.to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
}

/// The 429 a caller should send when a decision denies the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub decision: Decision,
    pub retry_after_secs: u64,
    pub headers: Vec<(&'static str, String)>,
    pub body: RejectionBody,
}

impl Rejection {
    pub fn new(decision: Decision, now_ms: u64) -> Self {
        let retry_after_secs = decision.retry_after_secs(now_ms);
        let mut headers = decision.headers();
        headers.push((HEADER_RETRY_AFTER, retry_after_secs.to_string()));
        Self {
            status: STATUS_TOO_MANY_REQUESTS,
            decision,
            retry_after_secs,
            headers,
            body: RejectionBody {
                error: "Too many requests".to_string(),
                message: format!(
                    "Rate limit exceeded. Retry after {} seconds",
                    retry_after_secs
                ),
            },
        }
    }
}

/// Handler output from an admitted request, with the headers to attach to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guarded<T> {
    pub decision: Decision,
    pub headers: Vec<(&'static str, String)>,
    pub output: T,
}

/// Fixed-window limiter over a [`TieredStore`].
///
/// Each `(identifier, window)` pair gets its own counter. Bursts of up to twice the
/// limit can pass around a window boundary.
#[derive(Clone)]
pub struct RateLimiter {
    store: TieredStore,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: TieredStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: TieredStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn counter_key(&self, identifier: &str, policy: &RateLimitPolicy, now_ms: u64) -> String {
        derive_key(COUNTER_PREFIX, identifier, policy.window(), now_ms)
    }

    /// Counts this request against `identifier` and decides whether it may proceed.
    ///
    /// `identifier` must be non-empty; [`RateLimiter::guard`] enforces that.
    pub async fn allow(&self, identifier: &str, policy: &RateLimitPolicy) -> Decision {
        let now = self.clock.now_millis();
        let key = self.counter_key(identifier, policy, now);
        let total = self
            .store
            .increment_and_expire(&key, policy.window())
            .await;
        let decision = Decision::new(policy, total, window_end(now, policy.window()));

        if decision.allowed {
            tracing::debug!(
                identifier,
                total = decision.total_so_far,
                remaining = decision.remaining,
                "Request allowed"
            );
        } else {
            tracing::info!(
                identifier,
                total = decision.total_so_far,
                limit = decision.limit,
                reset_at_ms = decision.reset_at_ms,
                "Request rate limited"
            );
        }
        decision
    }

    /// Requests counted so far in the current window, without counting a new one.
    pub async fn usage(&self, identifier: &str, policy: &RateLimitPolicy) -> u64 {
        let key = self.counter_key(identifier, policy, self.clock.now_millis());
        self.store
            .get(&key)
            .await
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    /// Forgets the current window's count for `identifier` (admin operation).
    pub async fn reset(&self, identifier: &str, policy: &RateLimitPolicy) {
        let key = self.counter_key(identifier, policy, self.clock.now_millis());
        self.store.delete(&key).await;
        tracing::info!(identifier, "Rate limit counter reset");
    }

    /// Admits `handler` only if the limiter allows it.
    ///
    /// Headers are computed before `handler` runs, so whatever the handler returns can
    /// still carry them. A denied request never runs `handler`.
    pub async fn guard<T, F, Fut>(
        &self,
        identifier: &str,
        policy: &RateLimitPolicy,
        handler: F,
    ) -> Result<Guarded<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if identifier.trim().is_empty() {
            return Err(TollgateError::InvalidIdentifier);
        }

        let decision = self.allow(identifier, policy).await;
        if !decision.allowed {
            let rejection = Rejection::new(decision, self.clock.now_millis());
            return Err(TollgateError::RateLimited(Box::new(rejection)));
        }

        let headers = decision.headers();
        let output = handler().await;
        Ok(Guarded {
            decision,
            headers,
            output,
        })
    }
}
