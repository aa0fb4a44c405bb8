mod middleware;
mod settings;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tollgate_core::{
    cache_key, Cache, MemoryBackend, PolicyRegistry, RateLimiter, StorageBackend, TieredStore,
};
use tollgate_redis::RedisBackend;
use tracing_subscriber::EnvFilter;

use crate::middleware::{enforce_rate_limit, RouteGuard};
use crate::settings::TollgateConfig;

const SEARCH_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    cache: Cache,
    store: TieredStore,
}

/// One guard per limited route, resolved before the server starts.
struct Guards {
    search: RouteGuard,
    upload: RouteGuard,
}

impl Guards {
    fn resolve(
        config: &TollgateConfig,
        limiter: &RateLimiter,
        policies: &PolicyRegistry,
    ) -> anyhow::Result<Self> {
        // Every configured route must name a real policy, even ones this binary doesn't serve.
        for (route, policy) in &config.routes {
            policies
                .get(policy)
                .with_context(|| format!("route `{route}`"))?;
        }

        let guard = |route: &str| -> anyhow::Result<RouteGuard> {
            let name = config.route_policy(route);
            let guard = RouteGuard::new(limiter.clone(), policies, name)
                .with_context(|| format!("route `{route}`"))?
                .trust_proxy_headers(config.trust_proxy_headers);
            tracing::info!(
                route,
                policy = name,
                window_secs = guard.policy().window().as_secs(),
                max_requests = guard.policy().max_requests(),
                trust_proxy_headers = config.trust_proxy_headers,
                "Rate limit attached"
            );
            Ok(guard)
        };

        Ok(Self {
            search: guard("search")?,
            upload: guard("upload")?,
        })
    }
}

fn router(state: AppState, guards: Guards) -> Router {
    let search_routes = Router::new()
        .route("/search", get(search))
        .route_layer(from_fn_with_state(guards.search, enforce_rate_limit));
    let upload_routes = Router::new()
        .route("/upload", post(upload))
        .route_layer(from_fn_with_state(guards.upload, enforce_rate_limit));

    Router::new()
        .route("/health", get(health))
        .merge(search_routes)
        .merge(upload_routes)
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    backend: &'static str,
    local_entries: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        backend: state.store.active_backend(),
        local_entries: state.store.local().len(),
    })
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Serialize, Deserialize)]
struct SearchResults {
    query: String,
    hits: Vec<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Json<SearchResults> {
    let key = cache_key!("search", params.q, params.limit);
    let results = state
        .cache
        .cached(&key, || run_search(&params.q, params.limit), SEARCH_TTL)
        .await;
    Json(results)
}

/// Stand-in for the expensive lookup the cache sits in front of.
async fn run_search(query: &str, limit: usize) -> SearchResults {
    tokio::time::sleep(Duration::from_millis(50)).await;
    SearchResults {
        query: query.to_string(),
        hits: (1..=limit.min(100)).map(|i| format!("{query}-{i}")).collect(),
    }
}

async fn upload() -> StatusCode {
    StatusCode::ACCEPTED
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = TollgateConfig::load(config_path.as_deref())?;
    tracing::debug!(?config, "Configuration loaded");

    let policies = config.policy_registry()?;

    // Process-wide sweeper: started once here, stopped only at shutdown.
    let local = Arc::new(MemoryBackend::new());
    local.start_sweeper(config.sweep_interval());

    let primary: Option<Arc<dyn StorageBackend>> = RedisBackend::new(&config.redis_settings())
        .context("invalid redis settings")?
        .map(|backend| Arc::new(backend) as Arc<dyn StorageBackend>);
    if primary.is_none() {
        tracing::warn!(
            "No distributed backend: counts are per process, each instance admits the full limit"
        );
    }

    let store =
        TieredStore::new(primary, Arc::clone(&local)).with_timeout(config.backend_timeout());
    let limiter = RateLimiter::new(store.clone());
    let cache =
        Cache::new(store.clone()).with_slow_producer_threshold(config.slow_producer_threshold());

    let guards = Guards::resolve(&config, &limiter, &policies)?;
    let app = router(AppState { cache, store: store.clone() }, guards);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, backend = store.active_backend(), "Tollgate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    local.stop_sweeper();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Request;
    use tower::ServiceExt;

    fn app(config: &TollgateConfig) -> anyhow::Result<Router> {
        let store = TieredStore::local_only(Arc::new(MemoryBackend::new()));
        let limiter = RateLimiter::new(store.clone());
        let policies = config.policy_registry()?;
        let guards = Guards::resolve(config, &limiter, &policies)?;
        Ok(router(
            AppState {
                cache: Cache::new(store.clone()),
                store,
            },
            guards,
        ))
    }

    fn search_request(ip: &str) -> Request {
        Request::builder()
            .uri("/search?q=rust&limit=3")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_unknown_route_policy_stops_startup() {
        let mut config = TollgateConfig::default();
        config
            .routes
            .insert("search".to_string(), "nonexistent".to_string());
        let err = app(&config).err().expect("wiring must fail");
        assert!(format!("{err:#}").contains("nonexistent"));
    }

    #[tokio::test]
    async fn test_search_is_limited_and_cached() {
        let mut config = TollgateConfig {
            trust_proxy_headers: true,
            ..TollgateConfig::default()
        };
        config.policies.insert(
            "search".to_string(),
            settings::PolicyConfig {
                window_secs: 3600,
                max_requests: 2,
            },
        );
        let app = app(&config).unwrap();

        let first = app.clone().oneshot(search_request("4.4.4.4")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-limit"], "2");
        let bytes = axum::body::to_bytes(first.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: SearchResults = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.hits, vec!["rust-1", "rust-2", "rust-3"]);

        let second = app.clone().oneshot(search_request("4.4.4.4")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let third = app.oneshot(search_request("4.4.4.4")).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(third.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_health_is_not_limited() {
        let app = app(&TollgateConfig::default()).unwrap();
        for _ in 0..20 {
            let response = app
                .clone()
                .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
    }
}
