//! Advisory result cache
//!
//! Keys are `<view>:<scope>:<filterHash>`, where the filter hash is the first
//! 8 hex chars of a SHA-256 over the serialized query parameters. Each view
//! has a TTL class; entries are never invalidated when new clicks arrive, so
//! staleness is bounded by the TTL alone.
//!
//! The cache can never fail a caller: backend errors, timeouts and
//! undecodable payloads are logged and treated as misses.

use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::AnalyticsResult;
use crate::models::Granularity;

/// Result category, each with its own freshness budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Summary,
    Geographic,
    Device,
    Referrer,
    Timeline(Granularity),
    UserAggregate,
    Compare,
    Trending,
    Performance,
    CustomReport,
    Alerts,
}

impl ViewKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ViewKind::Summary => "summary",
            ViewKind::Geographic => "geographic",
            ViewKind::Device => "device",
            ViewKind::Referrer => "referrer",
            ViewKind::Timeline(_) => "timeline",
            ViewKind::UserAggregate => "user",
            ViewKind::Compare => "compare",
            ViewKind::Trending => "trending",
            ViewKind::Performance => "performance",
            ViewKind::CustomReport => "report",
            ViewKind::Alerts => "alerts",
        }
    }

    pub fn ttl(&self) -> Duration {
        let secs = match self {
            ViewKind::Summary => 600,
            ViewKind::Geographic | ViewKind::Device | ViewKind::Referrer => 900,
            ViewKind::Timeline(Granularity::Hour) => 60,
            ViewKind::Timeline(Granularity::Day) => 300,
            ViewKind::Timeline(Granularity::Week) | ViewKind::Timeline(Granularity::Month) => 1800,
            ViewKind::Timeline(Granularity::Year) => 3600,
            ViewKind::UserAggregate => 600,
            ViewKind::Compare => 900,
            ViewKind::Trending => 3600,
            ViewKind::Performance => 1800,
            ViewKind::CustomReport => 900,
            ViewKind::Alerts => 300,
        };
        Duration::from_secs(secs)
    }
}

/// Stable short hash of query parameters
pub fn fingerprint<P: Serialize + ?Sized>(params: &P) -> String {
    // serde_json output for our param structs is deterministic (no maps)
    let bytes = serde_json::to_vec(params).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<P: Serialize + ?Sized>(view: ViewKind, scope: &str, params: &P) -> Self {
        Self(format!("{}:{}:{}", view.prefix(), scope, fingerprint(params)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw key/value backend behind the cache layer
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn invalidate(&self, key: &str) -> Result<()>;
}

#[derive(Clone)]
struct CachedPayload {
    body: Arc<str>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with
struct PerEntryTtl;

impl Expiry<String, CachedPayload> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedPayload,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedPayload,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process backend (Moka cache)
pub struct MokaBackend {
    cache: Cache<String, CachedPayload>,
}

impl MokaBackend {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).await.map(|p| p.body.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.cache
            .insert(
                key.to_string(),
                CachedPayload {
                    body: Arc::from(value),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

/// Typed, fail-open front for a [`CacheBackend`]
pub struct CacheLayer {
    backend: Option<Arc<dyn CacheBackend>>,
    op_timeout: Duration,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, op_timeout: Duration) -> Self {
        Self {
            backend: Some(backend),
            op_timeout,
        }
    }

    /// A cache that always misses
    pub fn disabled() -> Self {
        Self {
            backend: None,
            op_timeout: Duration::ZERO,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self::new(
            Arc::new(MokaBackend::new(config.max_entries)),
            Duration::from_millis(config.op_timeout_ms),
        )
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let backend = self.backend.as_ref()?;
        let raw = match tokio::time::timeout(self.op_timeout, backend.get(key.as_str())).await {
            Ok(Ok(raw)) => raw?,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Cache read failed, falling back to computation");
                return None;
            }
            Err(_) => {
                warn!(key = %key, "Cache read timed out, falling back to computation");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache entry");
                return;
            }
        };

        match tokio::time::timeout(self.op_timeout, backend.set(key.as_str(), payload, ttl)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %key, error = %e, "Cache write failed"),
            Err(_) => warn!(key = %key, "Cache write timed out"),
        }
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        match tokio::time::timeout(self.op_timeout, backend.invalidate(key.as_str())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %key, error = %e, "Cache invalidation failed"),
            Err(_) => warn!(key = %key, "Cache invalidation timed out"),
        }
    }

    /// Return the cached value or compute, write through and return it.
    /// Errors from `compute` are returned as-is and never cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> AnalyticsResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AnalyticsResult<T>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalyticsError;
    use anyhow::anyhow;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct View {
        total: u64,
    }

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(anyhow!("connection refused"))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
            Err(anyhow!("connection refused"))
        }

        async fn invalidate(&self, _key: &str) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    struct StalledBackend;

    #[async_trait]
    impl CacheBackend for StalledBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn invalidate(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn moka_layer() -> CacheLayer {
        CacheLayer::new(Arc::new(MokaBackend::new(100)), Duration::from_millis(200))
    }

    #[test]
    fn test_key_format_and_stability() {
        let a = CacheKey::new(ViewKind::Summary, "abc", &("2024-01-01", "2024-02-01"));
        let b = CacheKey::new(ViewKind::Summary, "abc", &("2024-01-01", "2024-02-01"));
        let c = CacheKey::new(ViewKind::Summary, "abc", &("2024-01-01", "2024-03-01"));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let parts: Vec<&str> = a.as_str().split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "summary");
        assert_eq!(parts[1], "abc");
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_ttl_classes() {
        assert_eq!(ViewKind::Summary.ttl(), Duration::from_secs(600));
        assert_eq!(ViewKind::Timeline(Granularity::Hour).ttl(), Duration::from_secs(60));
        assert_eq!(ViewKind::Timeline(Granularity::Year).ttl(), Duration::from_secs(3600));
        assert_eq!(ViewKind::Alerts.ttl(), Duration::from_secs(300));
        assert_eq!(ViewKind::Trending.ttl(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_get_or_compute_writes_through() {
        let cache = moka_layer();
        let key = CacheKey::new(ViewKind::Summary, "abc", &());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let view = cache
                .get_or_compute(&key, Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(View { total: 7 })
                })
                .await
                .unwrap();
            assert_eq!(view, View { total: 7 });
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = moka_layer();
        let key = CacheKey::new(ViewKind::Timeline(Granularity::Hour), "abc", &());
        cache
            .set(&key, &View { total: 1 }, Duration::from_millis(50))
            .await;
        assert!(cache.get::<View>(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get::<View>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = moka_layer();
        let key = CacheKey::new(ViewKind::Device, "abc", &());
        cache.set(&key, &View { total: 1 }, Duration::from_secs(60)).await;
        cache.invalidate(&key).await;
        assert!(cache.get::<View>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_failing_backend_falls_back_to_compute() {
        let cache = CacheLayer::new(Arc::new(FailingBackend), Duration::from_millis(50));
        let key = CacheKey::new(ViewKind::Summary, "abc", &());

        let view = cache
            .get_or_compute(&key, Duration::from_secs(60), || async { Ok(View { total: 3 }) })
            .await
            .unwrap();
        assert_eq!(view.total, 3);
    }

    #[tokio::test]
    async fn test_stalled_backend_times_out() {
        let cache = CacheLayer::new(Arc::new(StalledBackend), Duration::from_millis(20));
        let key = CacheKey::new(ViewKind::Summary, "abc", &());

        let started = Instant::now();
        let view = cache
            .get_or_compute(&key, Duration::from_secs(60), || async { Ok(View { total: 5 }) })
            .await
            .unwrap();

        assert_eq!(view.total, 5);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = moka_layer();
        let key = CacheKey::new(ViewKind::Summary, "abc", &());

        let result: AnalyticsResult<View> = cache
            .get_or_compute(&key, Duration::from_secs(60), || async {
                Err(AnalyticsError::NotFound("abc".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.get::<View>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let cache = CacheLayer::disabled();
        let key = CacheKey::new(ViewKind::Summary, "abc", &());
        cache.set(&key, &View { total: 1 }, Duration::from_secs(60)).await;
        assert!(cache.get::<View>(&key).await.is_none());
    }
}
