//! Request interception routing.
//!
//! Every intercepted request walks an ordered, auditable rule list:
//!
//! ```text
//! request ──► 1. synthetic      path matches a mock route? fabricate
//!             2. cache-first    fingerprint hit in the generation? serve
//!             3. network        live fetch, optionally populating cache
//! ```
//!
//! Exactly one response (or one failure) leaves the router per request.
//! Cache writes on the network path are best-effort: a full store is
//! logged and the in-flight response is returned regardless.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use offkit_cache::CacheStore;
use offkit_common::retry::with_timeout;

use crate::{EngineError, EngineRequest, EngineResponse, NetworkBackend};

// ==================== Populate Policy ====================

/// Whether successful network fetches populate the cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PopulatePolicy {
    /// Only install-time pre-population writes to the cache.
    #[default]
    Static,
    /// Every cacheable network response is written back.
    OnFetch,
}

// ==================== Synthetic Routes ====================

/// A mock endpoint answered without touching cache or network.
pub struct SyntheticRoute {
    path: String,
    respond: Box<dyn Fn(&EngineRequest) -> EngineResponse + Send + Sync>,
}

impl SyntheticRoute {
    /// Create a route matching an exact URL path.
    pub fn new<F>(path: impl Into<String>, respond: F) -> Self
    where
        F: Fn(&EngineRequest) -> EngineResponse + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            respond: Box::new(respond),
        }
    }

    /// Path this route answers.
    pub fn path(&self) -> &str {
        &self.path
    }
}

// ==================== Interception Router ====================

/// Routes intercepted requests through the ordered rule list.
pub struct InterceptionRouter {
    cache: Arc<CacheStore>,
    generation: String,
    policy: PopulatePolicy,
    backend: Arc<dyn NetworkBackend>,
    fetch_timeout: Duration,
    synthetic: Vec<SyntheticRoute>,
}

impl InterceptionRouter {
    /// Create a router over one cache generation.
    pub fn new(
        cache: Arc<CacheStore>,
        generation: String,
        policy: PopulatePolicy,
        backend: Arc<dyn NetworkBackend>,
        fetch_timeout: Duration,
        synthetic: Vec<SyntheticRoute>,
    ) -> Self {
        Self {
            cache,
            generation,
            policy,
            backend,
            fetch_timeout,
            synthetic,
        }
    }

    /// The rule list, in evaluation order.
    pub fn rule_names(&self) -> Vec<&'static str> {
        vec!["synthetic", "cache-first", "network-fallback"]
    }

    /// Route one request. Exactly one response or one failure per call.
    pub async fn handle(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        // Rule 1: synthetic routes answer by exact path, bypassing both
        // cache and network.
        if let Some(route) = self.synthetic.iter().find(|r| r.path == request.path()) {
            debug!(path = %request.path(), "Synthetic route matched");
            return Ok((route.respond)(request));
        }

        // Rule 2: exact fingerprint match against the generation.
        let key = request.fingerprint();
        if let Some(entry) = self.cache.match_request(&self.generation, &key).await {
            debug!(%key, generation = %self.generation, "Cache hit");
            return Ok(EngineResponse::from_cached(entry));
        }

        // Rule 3: live fetch, bounded by the fetch timeout.
        debug!(%key, "Cache miss, fetching from network");
        let response = with_timeout(self.fetch_timeout, || self.backend.fetch(request))
            .await
            .map_err(|_| {
                EngineError::NetworkFetchFailed(format!(
                    "fetch of {} timed out after {:?}",
                    request.url, self.fetch_timeout
                ))
            })??;

        if self.policy == PopulatePolicy::OnFetch && response.is_cacheable() {
            match self.cache.open(&self.generation).await {
                Ok(handle) => {
                    if let Err(e) = handle.put(key, response.to_cached()).await {
                        warn!(error = %e, "Response not cached, serving anyway");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Generation unavailable, serving uncached");
                }
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{url, MockBackend};
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use offkit_cache::{CacheStoreConfig, CachedResponse, ResponseKind};
    use serde_json::json;

    fn router(
        cache: Arc<CacheStore>,
        backend: Arc<MockBackend>,
        policy: PopulatePolicy,
    ) -> InterceptionRouter {
        InterceptionRouter::new(
            cache,
            "shell-v1".to_string(),
            policy,
            backend,
            Duration::from_secs(5),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_cache_hit_never_touches_network() {
        let cache = Arc::new(CacheStore::new());
        let handle = cache.open("shell-v1").await.unwrap();
        let request = EngineRequest::get(url("https://app.example/index.html"));
        handle
            .put(request.fingerprint(), CachedResponse::ok("<html>"))
            .await
            .unwrap();

        let backend = MockBackend::new();
        let router = router(cache, Arc::clone(&backend), PopulatePolicy::Static);

        let response = router.handle(&request).await.unwrap();
        assert!(response.from_cache);
        assert_eq!(response.body, Bytes::from("<html>"));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_synthetic_route_wins_over_cache_and_network() {
        let cache = Arc::new(CacheStore::new());
        let handle = cache.open("shell-v1").await.unwrap();
        let request = EngineRequest::get(url("https://app.example/api/mock-time"));
        handle
            .put(request.fingerprint(), CachedResponse::ok("stale"))
            .await
            .unwrap();

        let backend = MockBackend::new();
        backend.respond("https://app.example/api/mock-time", EngineResponse::ok("live"));

        let router = InterceptionRouter::new(
            Arc::clone(&cache),
            "shell-v1".to_string(),
            PopulatePolicy::OnFetch,
            backend.clone(),
            Duration::from_secs(5),
            vec![SyntheticRoute::new("/api/mock-time", |_| {
                EngineResponse::json(&json!({"time": 1234567890}))
            })],
        );

        let response = router.handle(&request).await.unwrap();
        assert!(!response.from_cache);
        assert_eq!(backend.calls(), 0);
        assert!(std::str::from_utf8(&response.body)
            .unwrap()
            .contains("1234567890"));

        // The fabricated response never displaces the cached entry.
        let cached = cache
            .match_request("shell-v1", &request.fingerprint())
            .await
            .unwrap();
        assert_eq!(cached.body, Bytes::from("stale"));
    }

    #[tokio::test]
    async fn test_on_fetch_populates_cache() {
        let cache = Arc::new(CacheStore::new());
        cache.open("shell-v1").await.unwrap();
        let backend = MockBackend::new();
        backend.respond("https://app.example/data.json", EngineResponse::ok("{}"));

        let router = router(Arc::clone(&cache), Arc::clone(&backend), PopulatePolicy::OnFetch);
        let request = EngineRequest::get(url("https://app.example/data.json"));

        let first = router.handle(&request).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(backend.calls(), 1);

        let second = router.handle(&request).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_static_policy_never_populates() {
        let cache = Arc::new(CacheStore::new());
        cache.open("shell-v1").await.unwrap();
        let backend = MockBackend::new();
        backend.respond("https://app.example/data.json", EngineResponse::ok("{}"));

        let router = router(Arc::clone(&cache), Arc::clone(&backend), PopulatePolicy::Static);
        let request = EngineRequest::get(url("https://app.example/data.json"));

        router.handle(&request).await.unwrap();
        router.handle(&request).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_uncacheable_responses_not_stored() {
        let cache = Arc::new(CacheStore::new());
        cache.open("shell-v1").await.unwrap();
        let backend = MockBackend::new();
        backend.respond(
            "https://app.example/missing",
            EngineResponse::with_status(404, ResponseKind::Basic, "nope"),
        );

        let router = router(Arc::clone(&cache), Arc::clone(&backend), PopulatePolicy::OnFetch);
        let request = EngineRequest::get(url("https://app.example/missing"));

        let response = router.handle(&request).await.unwrap();
        assert_eq!(response.status, 404);

        // The 404 was served but never cached.
        assert!(cache
            .match_request("shell-v1", &request.fingerprint())
            .await
            .is_none());
        router.handle(&request).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_does_not_fail_the_response() {
        let cache = Arc::new(CacheStore::with_config(CacheStoreConfig {
            max_entries_per_generation: Some(0),
            max_generations: None,
        }));
        cache.open("shell-v1").await.unwrap();
        let backend = MockBackend::new();
        backend.respond("https://app.example/data.json", EngineResponse::ok("{}"));

        let router = router(Arc::clone(&cache), backend, PopulatePolicy::OnFetch);
        let request = EngineRequest::get(url("https://app.example/data.json"));

        let response = router.handle(&request).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_network_failure_propagates() {
        let cache = Arc::new(CacheStore::new());
        let backend = MockBackend::new();
        backend.fail("https://app.example/down");

        let router = router(cache, backend, PopulatePolicy::Static);
        let request = EngineRequest::get(url("https://app.example/down"));

        let err = router.handle(&request).await.unwrap_err();
        assert!(matches!(err, EngineError::NetworkFetchFailed(_)));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        struct StalledBackend;

        impl NetworkBackend for StalledBackend {
            fn fetch(
                &self,
                _request: &EngineRequest,
            ) -> BoxFuture<'static, Result<EngineResponse, EngineError>> {
                Box::pin(futures::future::pending())
            }
        }

        let cache = Arc::new(CacheStore::new());
        let router = InterceptionRouter::new(
            cache,
            "shell-v1".to_string(),
            PopulatePolicy::Static,
            Arc::new(StalledBackend),
            Duration::from_millis(20),
            Vec::new(),
        );

        let request = EngineRequest::get(url("https://app.example/slow"));
        let err = router.handle(&request).await.unwrap_err();
        assert!(matches!(err, EngineError::NetworkFetchFailed(_)));
    }

    #[tokio::test]
    async fn test_rule_order_is_auditable() {
        let cache = Arc::new(CacheStore::new());
        let backend = MockBackend::new();
        let router = router(cache, backend, PopulatePolicy::Static);
        assert_eq!(
            router.rule_names(),
            vec!["synthetic", "cache-first", "network-fallback"]
        );
    }
}
