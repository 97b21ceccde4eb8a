//! Provider Gateway: cached, rate-limited, deadline-bounded provider lookups.
//!
//! A lookup fingerprints `(provider, query)`, serves a live cache entry when
//! there is one, and otherwise calls the provider and caches a successful
//! answer for the configured TTL. Failures are never cached. A cache backend
//! that cannot be reached is logged and bypassed so the lookup still
//! succeeds.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rk_cache::{fingerprint, CacheStore, QueryParams};
use rk_core::config::Config;
use rk_core::Deadline;

use crate::metrics::{Counter, Metrics, Op};
use crate::provider::{Metadata, MetadataProvider, ProviderError};
use crate::registry::ProviderRegistry;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct ProviderGateway {
    registry: ProviderRegistry,
    cache: Arc<dyn CacheStore>,
    ttl: Option<Duration>,
    timeout: Duration,
    limiters: HashMap<String, Arc<DirectLimiter>>,
    metrics: Arc<Metrics>,
}

impl ProviderGateway {
    pub fn new(
        registry: ProviderRegistry,
        cache: Arc<dyn CacheStore>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Self {
        let limiters = config
            .providers
            .rate_limits
            .iter()
            .filter_map(|(name, rps)| {
                let quota = Quota::per_second(NonZeroU32::new(*rps)?);
                Some((name.to_lowercase(), Arc::new(RateLimiter::direct(quota))))
            })
            .collect();

        let ttl = config.cache.default_ttl();
        if ttl.is_none() {
            tracing::info!("Provider result caching disabled (non-positive TTL)");
        }

        Self {
            registry,
            cache,
            ttl,
            timeout: config.workers.provider_timeout(),
            limiters,
            metrics,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Pick the provider for a job: the requested one, else the primary.
    pub fn resolve(&self, requested: Option<&str>) -> Result<String, ProviderError> {
        match requested {
            Some(name) if self.registry.get(name).is_some() => Ok(name.to_lowercase()),
            Some(name) => Err(ProviderError::InvalidQuery(format!("unknown provider: {name}"))),
            None => self
                .registry
                .primary()
                .map(str::to_string)
                .ok_or_else(|| ProviderError::InvalidQuery("no metadata provider configured".into())),
        }
    }

    /// Look up `query` with the configured provider timeout.
    pub async fn lookup(&self, provider: &str, query: &QueryParams) -> Result<Metadata, ProviderError> {
        self.lookup_within(provider, query, Deadline::after(self.timeout))
            .await
    }

    /// Look up `query`, giving up with `Unavailable` at `deadline`.
    pub async fn lookup_within(
        &self,
        provider: &str,
        query: &QueryParams,
        deadline: Deadline,
    ) -> Result<Metadata, ProviderError> {
        let source = self.source(provider, query)?;
        let key = fingerprint(source.name(), query);

        if let Some(metadata) = self.cached(&key).await {
            return Ok(metadata);
        }

        let metadata = self.call(source.as_ref(), query, deadline).await?;
        self.store(&key, &metadata).await;
        Ok(metadata)
    }

    /// Drop any cached answer for `query` and ask the provider again.
    pub async fn refresh(&self, provider: &str, query: &QueryParams) -> Result<Metadata, ProviderError> {
        self.refresh_within(provider, query, Deadline::after(self.timeout))
            .await
    }

    pub async fn refresh_within(
        &self,
        provider: &str,
        query: &QueryParams,
        deadline: Deadline,
    ) -> Result<Metadata, ProviderError> {
        let source = self.source(provider, query)?;
        let key = fingerprint(source.name(), query);
        if let Err(e) = self.cache.invalidate(&key).await {
            self.metrics.incr(Counter::CacheErrors);
            tracing::warn!(%key, error = %e, "Cache invalidate failed during refresh");
        }
        self.lookup_within(provider, query, deadline).await
    }

    fn source(
        &self,
        provider: &str,
        query: &QueryParams,
    ) -> Result<Arc<dyn MetadataProvider>, ProviderError> {
        if query.is_empty() {
            return Err(ProviderError::InvalidQuery("empty query".into()));
        }
        self.registry
            .get(provider)
            .ok_or_else(|| ProviderError::InvalidQuery(format!("unknown provider: {provider}")))
    }

    async fn cached(&self, key: &str) -> Option<Metadata> {
        self.ttl?;

        let result = {
            let _t = self.metrics.timer(Op::CacheGet);
            self.cache.get(key).await
        };

        match result {
            Ok(Some(hit)) => match serde_json::from_slice::<Metadata>(&hit.value) {
                Ok(metadata) => {
                    self.metrics.incr(Counter::CacheHits);
                    tracing::debug!(%key, hits = hit.hit_count, "Provider cache hit");
                    Some(metadata)
                }
                Err(e) => {
                    self.metrics.incr(Counter::CacheMisses);
                    tracing::warn!(%key, error = %e, "Dropping undecodable cache entry");
                    let _ = self.cache.invalidate(key).await;
                    None
                }
            },
            Ok(None) => {
                self.metrics.incr(Counter::CacheMisses);
                tracing::debug!(%key, "Provider cache miss");
                None
            }
            Err(e) => {
                self.metrics.incr(Counter::CacheErrors);
                tracing::warn!(
                    backend = self.cache.backend(),
                    error = %e,
                    "Cache unavailable, calling provider directly"
                );
                None
            }
        }
    }

    async fn call(
        &self,
        source: &dyn MetadataProvider,
        query: &QueryParams,
        deadline: Deadline,
    ) -> Result<Metadata, ProviderError> {
        let limiter = self.limiters.get(&source.name().to_lowercase()).cloned();
        let attempt = async {
            if let Some(limiter) = limiter {
                limiter.until_ready().await;
            }
            self.metrics.incr(Counter::ProviderCalls);
            let _t = self.metrics.timer(Op::ProviderCall);
            source.lookup(query).await
        };

        let result = match tokio::time::timeout(deadline.remaining(), attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Unavailable(format!(
                "{}: deadline exceeded",
                source.name()
            ))),
        };

        if let Err(e) = &result {
            self.metrics.incr(Counter::ProviderFailures);
            tracing::warn!(provider = source.name(), %query, error = %e, "Provider lookup failed");
        }
        result
    }

    async fn store(&self, key: &str, metadata: &Metadata) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let value = match serde_json::to_vec(metadata) {
            Ok(v) => Bytes::from(v),
            Err(e) => {
                tracing::warn!(%key, error = %e, "Failed to encode provider result");
                return;
            }
        };

        let result = {
            let _t = self.metrics.timer(Op::CacheSet);
            self.cache.set(key, value, ttl).await
        };
        match result {
            Ok(()) => self.metrics.incr(Counter::CacheWrites),
            Err(e) => {
                self.metrics.incr(Counter::CacheErrors);
                tracing::warn!(%key, error = %e, "Failed to cache provider result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rk_cache::{CacheHit, MemoryCache};
    use rk_core::{Error, SystemClock};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted answers, then succeeds with the queried title.
    struct Scripted {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<Metadata, ProviderError>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(script: Vec<Result<Metadata, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into()),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataProvider for Scripted {
        fn name(&self) -> &str {
            "stub"
        }

        async fn lookup(&self, query: &QueryParams) -> Result<Metadata, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(next) = self.script.lock().pop_front() {
                return next;
            }
            Ok(Metadata {
                title: query.get("title").unwrap_or_default().to_string(),
                ..Default::default()
            })
        }
    }

    struct DownCache;

    #[async_trait]
    impl CacheStore for DownCache {
        fn backend(&self) -> &'static str {
            "down"
        }
        async fn get(&self, _key: &str) -> rk_core::Result<Option<CacheHit>> {
            Err(Error::CacheUnavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> rk_core::Result<()> {
            Err(Error::CacheUnavailable("connection refused".into()))
        }
        async fn invalidate(&self, _key: &str) -> rk_core::Result<bool> {
            Err(Error::CacheUnavailable("connection refused".into()))
        }
        async fn sweep(&self) -> rk_core::Result<usize> {
            Err(Error::CacheUnavailable("connection refused".into()))
        }
    }

    fn gateway_with(
        provider: Arc<Scripted>,
        cache: Arc<dyn CacheStore>,
        config: Config,
    ) -> (ProviderGateway, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let registry = ProviderRegistry::new().with(provider);
        (
            ProviderGateway::new(registry, cache, metrics.clone(), &config),
            metrics,
        )
    }

    fn memory_cache() -> Arc<MemoryCache> {
        Arc::new(MemoryCache::new(100, Arc::new(SystemClock)))
    }

    fn heat() -> QueryParams {
        QueryParams::new().with("title", "Heat").with("year", "1995")
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let provider = Scripted::new(vec![]);
        let cache = memory_cache();
        let (gw, metrics) = gateway_with(provider.clone(), cache.clone(), Config::default());

        let first = gw.lookup("stub", &heat()).await.unwrap();
        let reordered = QueryParams::new().with("year", "1995").with("TITLE", "heat");
        let second = gw.lookup("stub", &reordered).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
        assert_eq!(cache.len(), 1);

        let snap = metrics.snapshot();
        assert_eq!((snap.cache_hits, snap.cache_misses, snap.cache_writes), (1, 1, 1));
        assert_eq!(snap.provider_calls, 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let provider = Scripted::new(vec![Err(ProviderError::Unavailable("503".into()))]);
        let cache = memory_cache();
        let (gw, metrics) = gateway_with(provider.clone(), cache.clone(), Config::default());

        assert_matches!(
            gw.lookup("stub", &heat()).await,
            Err(ProviderError::Unavailable(_))
        );
        assert!(cache.is_empty());

        assert_eq!(gw.lookup("stub", &heat()).await.unwrap().title, "Heat");
        assert_eq!(provider.calls(), 2);
        assert_eq!(metrics.snapshot().provider_failures, 1);
    }

    #[tokio::test]
    async fn non_positive_ttl_disables_caching() {
        let provider = Scripted::new(vec![]);
        let cache = memory_cache();
        let mut config = Config::default();
        config.cache.default_ttl_secs = 0;
        let (gw, _) = gateway_with(provider.clone(), cache.clone(), config);

        gw.lookup("stub", &heat()).await.unwrap();
        gw.lookup("stub", &heat()).await.unwrap();
        assert_eq!(provider.calls(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unavailable_cache_degrades_to_direct_calls() {
        let provider = Scripted::new(vec![]);
        let (gw, metrics) = gateway_with(provider.clone(), Arc::new(DownCache), Config::default());

        let md = gw.lookup("stub", &heat()).await.unwrap();
        assert_eq!(md.title, "Heat");
        assert_eq!(provider.calls(), 1);
        // Read and write both failed.
        assert_eq!(metrics.snapshot().cache_errors, 2);
    }

    #[tokio::test]
    async fn refresh_bypasses_a_live_entry() {
        let provider = Scripted::new(vec![]);
        let (gw, _) = gateway_with(provider.clone(), memory_cache(), Config::default());

        gw.lookup("stub", &heat()).await.unwrap();
        gw.refresh("stub", &heat()).await.unwrap();
        gw.lookup("stub", &heat()).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_provider_and_empty_query_are_invalid() {
        let provider = Scripted::new(vec![]);
        let (gw, _) = gateway_with(provider.clone(), memory_cache(), Config::default());

        assert_matches!(
            gw.lookup("nope", &heat()).await,
            Err(ProviderError::InvalidQuery(_))
        );
        assert_matches!(
            gw.lookup("stub", &QueryParams::new()).await,
            Err(ProviderError::InvalidQuery(_))
        );
        assert_matches!(gw.resolve(Some("nope")), Err(ProviderError::InvalidQuery(_)));
        assert_eq!(gw.resolve(None).unwrap(), "stub");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn deadline_surfaces_as_unavailable() {
        let provider = Scripted::slow(Duration::from_millis(500));
        let (gw, _) = gateway_with(provider.clone(), memory_cache(), Config::default());

        let result = gw
            .lookup_within("stub", &heat(), Deadline::after(Duration::from_millis(20)))
            .await;
        assert_matches!(result, Err(ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn rate_limit_spaces_out_real_calls_only() {
        let provider = Scripted::new(vec![]);
        let mut config = Config::default();
        config.providers.rate_limits.insert("stub".into(), 1);
        let (gw, _) = gateway_with(provider.clone(), memory_cache(), config);

        let started = std::time::Instant::now();
        gw.lookup("stub", &heat()).await.unwrap();
        // Cache hit: no limiter wait.
        gw.lookup("stub", &heat()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        gw.lookup("stub", &QueryParams::new().with("title", "Ronin"))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(provider.calls(), 2);
    }
}
