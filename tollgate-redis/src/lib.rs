//! Redis implementation of [`StorageBackend`].
//!
//! A translation layer only: every Redis or connection failure becomes
//! [`TollgateError::BackendUnavailable`] so the tiered store can fall back.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, IntoConnectionInfo, Script};
use std::fmt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tollgate_core::{StorageBackend, TollgateError};

const BACKEND_NAME: &str = "redis";

pub const DEFAULT_NAMESPACE: &str = "tollgate";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Characters a namespace may not contain: the key delimiter and SCAN glob syntax.
const RESERVED_NAMESPACE_CHARS: &[char] = &[':', '*', '?', '[', ']', '\\'];

/// Keys deleted per SCAN page during `clear`.
const SCAN_PAGE: usize = 500;

/// Connection settings. Both `url` and `token` must be present for the adapter to exist.
#[derive(Clone)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub token: Option<String>,
    /// Prefix for every key. Must be non-empty and free of `:` and the SCAN glob
    /// characters `*?[]\`, so `clear` can never reach into another namespace.
    pub namespace: String,
    pub connect_timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSettings")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("namespace", &self.namespace)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn unavailable(reason: impl ToString) -> TollgateError {
    TollgateError::unavailable(BACKEND_NAME, reason)
}

pub struct RedisBackend {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    namespace: String,
    connect_timeout: Duration,
    incr_script: Script,
}

impl RedisBackend {
    /// Builds the adapter without touching the network.
    ///
    /// Returns `Ok(None)` when the URL or token is missing: the deployment simply has no
    /// distributed store. A URL that does not parse is a configuration error.
    pub fn new(settings: &RedisSettings) -> Result<Option<Self>, TollgateError> {
        let (Some(url), Some(token)) = (
            settings.url.as_deref().filter(|u| !u.trim().is_empty()),
            settings.token.as_deref().filter(|t| !t.is_empty()),
        ) else {
            tracing::info!("Redis not configured, using the local store only");
            return Ok(None);
        };

        let namespace = settings.namespace.as_str();
        if namespace.is_empty() || namespace.contains(RESERVED_NAMESPACE_CHARS) {
            return Err(TollgateError::InvalidConfig(format!(
                "Redis namespace `{namespace}` must be non-empty without any of : * ? [ ] \\"
            )));
        }

        let mut info = url
            .into_connection_info()
            .map_err(|e| TollgateError::InvalidConfig(format!("Redis URL: {e}")))?;
        info.redis.password = Some(token.to_string());

        let client = Client::open(info)
            .map_err(|e| TollgateError::InvalidConfig(format!("Redis client: {e}")))?;

        Ok(Some(Self {
            client,
            connection: OnceCell::new(),
            namespace: namespace.to_string(),
            connect_timeout: settings.connect_timeout,
            incr_script: Self::create_incr_script(),
        }))
    }

    /// INCR plus PEXPIRE on the first increment, in one server-side step.
    fn create_incr_script() -> Script {
        Script::new(
            r#"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
                redis.call('PEXPIRE', KEYS[1], ARGV[1])
            end
            return count
            "#,
        )
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// The shared connection, established on first use under `connect_timeout`.
    ///
    /// A failed attempt leaves the cell empty so the next call tries again.
    async fn connection(&self) -> Result<ConnectionManager, TollgateError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let connect = self.client.get_connection_manager();
                match tokio::time::timeout(self.connect_timeout, connect).await {
                    Ok(Ok(manager)) => {
                        tracing::info!(namespace = %self.namespace, "Connected to Redis");
                        Ok(manager)
                    }
                    Ok(Err(e)) => Err(unavailable(e)),
                    Err(_) => Err(unavailable(format!(
                        "connect timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ))),
                }
            })
            .await?;
        Ok(manager.clone())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl StorageBackend for RedisBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TollgateError> {
        let mut conn = self.connection().await?;
        conn.get(self.namespaced(key)).await.map_err(unavailable)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), TollgateError> {
        let mut conn = self.connection().await?;
        let key = self.namespaced(key);
        match ttl {
            Some(ttl) => conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await,
            None => conn.set::<_, _, ()>(key, value).await,
        }
        .map_err(unavailable)
    }

    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Result<u64, TollgateError> {
        let mut conn = self.connection().await?;
        let count: u64 = self
            .incr_script
            .key(self.namespaced(key))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<(), TollgateError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.namespaced(key))
            .await
            .map_err(unavailable)
    }

    async fn exists(&self, key: &str) -> Result<bool, TollgateError> {
        let mut conn = self.connection().await?;
        conn.exists(self.namespaced(key)).await.map_err(unavailable)
    }

    /// Deletes every key under this adapter's namespace. Other keys are left alone.
    ///
    /// The namespace holds no delimiter or glob characters, so `{namespace}:*` matches
    /// exactly this adapter's keys.
    async fn clear(&self) -> Result<(), TollgateError> {
        let mut conn = self.connection().await?;
        let pattern = self.namespaced("*");
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if !keys.is_empty() {
                removed += keys.len();
                conn.del::<_, ()>(keys).await.map_err(unavailable)?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        tracing::warn!(namespace = %self.namespace, removed, "Cleared Redis namespace");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: Option<&str>, token: Option<&str>) -> RedisSettings {
        RedisSettings {
            url: url.map(str::to_string),
            token: token.map(str::to_string),
            ..RedisSettings::default()
        }
    }

    #[test]
    fn test_missing_url_or_token_is_not_configured() {
        assert!(RedisBackend::new(&settings(None, None)).unwrap().is_none());
        assert!(RedisBackend::new(&settings(Some("redis://127.0.0.1"), None))
            .unwrap()
            .is_none());
        assert!(RedisBackend::new(&settings(None, Some("secret"))).unwrap().is_none());
        assert!(RedisBackend::new(&settings(Some("  "), Some("secret")))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bad_url_is_invalid_config() {
        let result = RedisBackend::new(&settings(Some("not a url"), Some("secret")));
        assert!(matches!(result, Err(TollgateError::InvalidConfig(_))));
    }

    #[test]
    fn test_keys_are_namespaced() {
        let backend = RedisBackend::new(&RedisSettings {
            namespace: "api".to_string(),
            ..settings(Some("redis://127.0.0.1:6379"), Some("secret"))
        })
        .unwrap()
        .unwrap();
        assert_eq!(backend.namespaced("ratelimit:u:7"), "api:ratelimit:u:7");
        assert_eq!(backend.name(), "redis");
    }

    #[test]
    fn test_namespace_cannot_overlap_or_glob() {
        for namespace in ["", "tollgate:x", "api*", "a?b", "[ab]", "a\\b"] {
            let result = RedisBackend::new(&RedisSettings {
                namespace: namespace.to_string(),
                ..settings(Some("redis://127.0.0.1:6379"), Some("secret"))
            });
            assert!(
                matches!(result, Err(TollgateError::InvalidConfig(_))),
                "namespace {namespace:?} was accepted"
            );
        }
        // Not configured wins over a bad namespace: nothing would be written anyway.
        let unconfigured = RedisBackend::new(&RedisSettings {
            namespace: "bad:ns".to_string(),
            ..settings(None, None)
        });
        assert!(unconfigured.unwrap().is_none());
    }

    #[test]
    fn test_debug_hides_token() {
        let rendered = format!("{:?}", settings(Some("redis://h"), Some("hunter2")));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_unavailable() {
        let backend = RedisBackend::new(&RedisSettings {
            connect_timeout: Duration::from_millis(200),
            ..settings(Some("redis://127.0.0.1:1"), Some("secret"))
        })
        .unwrap()
        .unwrap();

        let err = backend.get("k").await.unwrap_err();
        assert!(err.is_backend_unavailable(), "unexpected error: {err:?}");
        let err = backend
            .increment_and_expire("c", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_backend_unavailable());
    }

    #[tokio::test]
    #[ignore] // Requires Redis instance with requirepass set to $REDIS_TOKEN
    async fn test_redis_backend() {
        let backend = RedisBackend::new(&RedisSettings {
            namespace: "tollgate-test".to_string(),
            ..settings(
                Some("redis://127.0.0.1"),
                std::env::var("REDIS_TOKEN").ok().as_deref(),
            )
        })
        .unwrap()
        .expect("REDIS_TOKEN must be set");

        backend.clear().await.unwrap();
        let ttl = Duration::from_secs(60);
        assert_eq!(backend.increment_and_expire("c", ttl).await.unwrap(), 1);
        assert_eq!(backend.increment_and_expire("c", ttl).await.unwrap(), 2);

        backend
            .set("k", "v".to_string(), Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!backend.exists("k").await.unwrap());

        backend.set("p", "1".to_string(), None).await.unwrap();
        backend.delete("p").await.unwrap();
        assert_eq!(backend.get("p").await.unwrap(), None);

        backend.clear().await.unwrap();
        assert!(!backend.exists("c").await.unwrap());
    }
}
