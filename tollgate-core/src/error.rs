use thiserror::Error;

use crate::limiter::Rejection;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TollgateError {
    /// The distributed backend could not serve the call (network, auth, timeout).
    #[error("Backend `{backend}` unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),
    #[error("Rate limit policy not found: {0}")]
    PolicyNotFound(String),
    #[error("Rate limit identifier is empty; callers must resolve a stable identity")]
    InvalidIdentifier,
    /// Expected outcome of a denied request, carrying the response to send.
    #[error(
        "Rate limit exceeded: {} of {} requests used",
        .0.decision.total_so_far,
        .0.decision.limit
    )]
    RateLimited(Box<Rejection>),
}

impl TollgateError {
    pub fn unavailable(backend: &'static str, reason: impl ToString) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, TollgateError>;
