//! axum wrapper around [`RateLimiter::guard`].

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tollgate_core::{PolicyRegistry, RateLimitPolicy, RateLimiter, Rejection, TollgateError};

/// Identity set by an upstream authentication layer. Preferred over network addresses,
/// which many clients behind one NAT can share.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

/// A limiter bound to one policy, resolved while wiring routes.
///
/// Counters are scoped by policy name, so two routes whose policies share a window length
/// still count separately.
#[derive(Clone)]
pub struct RouteGuard {
    limiter: RateLimiter,
    policy_name: Arc<str>,
    policy: RateLimitPolicy,
    trust_proxy_headers: bool,
}

impl RouteGuard {
    /// Fails with `PolicyNotFound` for an unknown name, so a typo stops start-up.
    pub fn new(
        limiter: RateLimiter,
        policies: &PolicyRegistry,
        policy_name: &str,
    ) -> tollgate_core::Result<Self> {
        let policy = policies.get(policy_name)?;
        Ok(Self {
            limiter,
            policy_name: Arc::from(policy_name),
            policy,
            trust_proxy_headers: false,
        })
    }

    /// Honour `x-real-ip` / `x-forwarded-for`. Only safe behind a proxy that overwrites
    /// them; otherwise every forged value gets a fresh bucket.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}

/// `user:{id}` for authenticated callers, otherwise `ip:{addr}` from the socket, or from
/// proxy headers when `trust_proxy_headers` is set.
fn resolve_identifier(req: &Request, trust_proxy_headers: bool) -> Option<String> {
    if let Some(user) = req
        .extensions()
        .get::<AuthenticatedUser>()
        .filter(|user| !user.0.trim().is_empty())
    {
        return Some(format!("user:{}", user.0.trim()));
    }

    if trust_proxy_headers {
        if let Some(ip) = proxied_ip(req.headers()) {
            return Some(format!("ip:{ip}"));
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| format!("ip:{}", addr.ip()))
}

fn proxied_ip(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        })
}

fn apply_headers(target: &mut HeaderMap, headers: &[(&'static str, String)]) {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            target.insert(name, value);
        }
    }
}

fn rejection_response(rejection: &Rejection) -> Response {
    let status = StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    let mut response = (status, Json(&rejection.body)).into_response();
    apply_headers(response.headers_mut(), &rejection.headers);
    response
}

fn configuration_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Rate limiter misconfigured",
            "message": message,
        })),
    )
        .into_response()
}

/// Counts the request against the route's policy.
///
/// Admitted requests run the handler and get `X-RateLimit-*` headers on whatever it
/// returns, error responses included. Denied requests get a 429 with `Retry-After`.
pub async fn enforce_rate_limit(
    State(guard): State<RouteGuard>,
    req: Request,
    next: Next,
) -> Response {
    // An unresolved caller stays empty so `guard` rejects it instead of sharing a bucket.
    let identifier = resolve_identifier(&req, guard.trust_proxy_headers)
        .map(|client| format!("{}:{client}", guard.policy_name))
        .unwrap_or_default();
    let path = req.uri().path().to_string();

    match guard
        .limiter
        .guard(&identifier, &guard.policy, move || next.run(req))
        .await
    {
        Ok(guarded) => {
            let mut response = guarded.output;
            apply_headers(response.headers_mut(), &guarded.headers);
            response
        }
        Err(TollgateError::RateLimited(rejection)) => rejection_response(&rejection),
        Err(TollgateError::InvalidIdentifier) => {
            tracing::error!(
                policy = %guard.policy_name,
                path = %path,
                "No client identifier: need an authenticated user or connect info"
            );
            configuration_error("No client identifier could be resolved for rate limiting")
        }
        Err(e) => {
            tracing::error!(policy = %guard.policy_name, error = %e, "Rate limit check failed");
            configuration_error("Rate limit check failed")
        }
    }
}
