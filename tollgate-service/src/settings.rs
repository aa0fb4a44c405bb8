//! Service configuration.
//!
//! Sources, later ones winning: built-in defaults, an optional `tollgate.{yaml,toml,json}`
//! file (or the path given on the command line), then `TOLLGATE_*` environment variables
//! with `__` between nested keys, e.g. `TOLLGATE_REDIS__URL` and `TOLLGATE_REDIS__TOKEN`.

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tollgate_core::{PolicyRegistry, RateLimitPolicy};
use tollgate_redis::RedisSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TollgateConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    /// Per-call budget for the distributed backend before falling back.
    pub backend_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub slow_producer_ms: u64,
    /// Key clients by `x-real-ip` / `x-forwarded-for` instead of the socket address.
    /// Enable only behind a proxy that sets these headers itself.
    pub trust_proxy_headers: bool,
    /// Added to, or replacing, the built-in policies.
    pub policies: BTreeMap<String, PolicyConfig>,
    /// Route name to policy name. Routes not listed use the policy of the same name.
    pub routes: BTreeMap<String, String>,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            backend_timeout_ms: 250,
            sweep_interval_secs: 300,
            slow_producer_ms: 1000,
            trust_proxy_headers: false,
            policies: BTreeMap::new(),
            routes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub namespace: String,
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            namespace: tollgate_redis::DEFAULT_NAMESPACE.to_string(),
            connect_timeout_ms: 500,
        }
    }
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("namespace", &self.namespace)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    pub window_secs: u64,
    pub max_requests: u64,
}

impl TollgateConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name("tollgate").required(false),
        };
        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("TOLLGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;
        config
            .try_deserialize()
            .context("failed to parse configuration")
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            url: self.redis.url.clone(),
            token: self.redis.token.clone(),
            namespace: self.redis.namespace.clone(),
            connect_timeout: Duration::from_millis(self.redis.connect_timeout_ms),
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn slow_producer_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_producer_ms)
    }

    /// Built-in policies plus the configured ones, each validated.
    pub fn policy_registry(&self) -> anyhow::Result<PolicyRegistry> {
        let mut registry = PolicyRegistry::with_defaults();
        for (name, policy) in &self.policies {
            let policy =
                RateLimitPolicy::new(Duration::from_secs(policy.window_secs), policy.max_requests)
                    .with_context(|| format!("policy `{name}`"))?;
            registry.insert(name.clone(), policy);
        }
        Ok(registry)
    }

    /// Policy name guarding `route`.
    pub fn route_policy<'a>(&'a self, route: &'a str) -> &'a str {
        self.routes.get(route).map(String::as_str).unwrap_or(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str) -> TollgateConfig {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.backend_timeout(), Duration::from_millis(250));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert!(config.redis.url.is_none());
        assert!(!config.trust_proxy_headers);
        assert_eq!(config.route_policy("search"), "search");
    }

    #[test]
    fn test_proxy_trust_is_opt_in() {
        assert!(parse("trust_proxy_headers = true").trust_proxy_headers);
    }

    #[test]
    fn test_policy_overrides() {
        let config = parse(
            r#"
            [policies.search]
            window_secs = 10
            max_requests = 3

            [policies.export]
            window_secs = 3600
            max_requests = 5

            [routes]
            upload = "strict"
            "#,
        );
        let registry = config.policy_registry().unwrap();
        let search = registry.get("search").unwrap();
        assert_eq!(search.window(), Duration::from_secs(10));
        assert_eq!(search.max_requests(), 3);
        assert_eq!(registry.get("export").unwrap().max_requests(), 5);
        assert_eq!(registry.get("standard").unwrap().max_requests(), 100);
        assert_eq!(config.route_policy("upload"), "strict");
    }

    #[test]
    fn test_zero_limit_policy_fails() {
        let config = parse(
            r#"
            [policies.broken]
            window_secs = 60
            max_requests = 0
            "#,
        );
        let err = config.policy_registry().unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
    }

    #[test]
    fn test_redis_settings_carry_credentials() {
        let config = parse(
            r#"
            [redis]
            url = "redis://cache.internal:6379"
            token = "s3cret"
            connect_timeout_ms = 100
            "#,
        );
        let settings = config.redis_settings();
        assert_eq!(settings.url.as_deref(), Some("redis://cache.internal:6379"));
        assert_eq!(settings.token.as_deref(), Some("s3cret"));
        assert_eq!(settings.namespace, "tollgate");
        assert_eq!(settings.connect_timeout, Duration::from_millis(100));
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
