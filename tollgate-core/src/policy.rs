use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Fixed-window limit: at most `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    window: Duration,
    max_requests: u64,
}

impl RateLimitPolicy {
    pub fn new(window: Duration, max_requests: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(TollgateError::InvalidPolicy(
                "max_requests must be at least 1".to_string(),
            ));
        }
        if window.as_millis() == 0 {
            return Err(TollgateError::InvalidPolicy(
                "window must be at least 1ms".to_string(),
            ));
        }
        Ok(Self {
            window,
            max_requests,
        })
    }

    /// For the built-in table, where both values are known to be valid.
    const fn preset(window_secs: u64, max_requests: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}

pub const STRICT: RateLimitPolicy = RateLimitPolicy::preset(60, 10);
pub const STANDARD: RateLimitPolicy = RateLimitPolicy::preset(60, 100);
pub const GENEROUS: RateLimitPolicy = RateLimitPolicy::preset(60, 1000);
pub const UPLOAD: RateLimitPolicy = RateLimitPolicy::preset(3600, 20);
pub const SEARCH: RateLimitPolicy = RateLimitPolicy::preset(60, 30);
pub const ADMIN: RateLimitPolicy = RateLimitPolicy::preset(60, 300);

/// Named policies, assembled once at start-up.
///
/// Look policies up while wiring routes so an unknown name stops the process before it
/// serves traffic.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, RateLimitPolicy>,
}

impl PolicyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for (name, policy) in [
            ("strict", STRICT),
            ("standard", STANDARD),
            ("generous", GENEROUS),
            ("upload", UPLOAD),
            ("search", SEARCH),
            ("admin", ADMIN),
        ] {
            registry.insert(name, policy);
        }
        registry
    }

    /// Adds or replaces a policy.
    pub fn insert(&mut self, name: impl Into<String>, policy: RateLimitPolicy) -> &mut Self {
        self.policies.insert(name.into(), policy);
        self
    }

    pub fn get(&self, name: &str) -> Result<RateLimitPolicy> {
        self.policies
            .get(name)
            .copied()
            .ok_or_else(|| TollgateError::PolicyNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
