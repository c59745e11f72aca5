//! Orchestrates one proxied request: resolve, cache, select, forward, record
use bytes::Bytes;
use chrono::Utc;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analytics::AnalyticsHandle;
use crate::cache::{cache_path, fingerprint, CacheStore};
use crate::catalog::CacheRuleStore;
use crate::error::GatewayError;
use crate::forwarder::{ForwardRequest, Forwarder};
use crate::load_balancer::BackendSelector;
use crate::metrics::MetricsCollector;
use crate::models::{AnalyticsEvent, ApiKey, CacheRule, Route};
use crate::routes::RouteResolver;

/// Response header carrying the cache outcome
pub const X_CACHE: &str = "x-cache";

/// Per-minute limit of the caller, sent with 429 responses
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";

/// Upstream headers recomputed by the gateway when writing the response
const SKIPPED_RESPONSE_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::TRAILER,
    header::UPGRADE,
    HeaderName::from_static("proxy-connection"),
];

/// Cache status for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Not served through the cache path (unresolved route or failed backend)
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Inbound request after the HTTP layer has read the body
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    /// Authenticated caller, when the request passed API key auth
    pub api_key: Option<ApiKey>,
}

/// Response ready to be written to the caller
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache_status: CacheStatus,
}

impl ProxyResponse {
    /// JSON error body `{"error": "..."}`
    pub fn error(err: &GatewayError) -> Self {
        let mut response =
            Self::json(err.status_code(), &serde_json::json!({ "error": err.client_message() }));
        if let GatewayError::RateLimitExceeded { limit } = err {
            response
                .headers
                .insert(X_RATELIMIT_LIMIT, HeaderValue::from(*limit));
        }
        response
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::with_body(status, "application/json", value.to_string())
    }

    /// Response generated by the gateway itself
    pub fn with_body(status: u16, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self {
            status,
            headers,
            body: body.into(),
            cache_status: CacheStatus::Bypass,
        }
    }

    fn cached(body: Bytes) -> Self {
        let mut response = Self::with_body(200, "application/json", body);
        response
            .headers
            .insert(X_CACHE, HeaderValue::from_static("HIT"));
        response.cache_status = CacheStatus::Hit;
        response
    }
}

/// Request dispatcher
pub struct Dispatcher {
    resolver: RouteResolver,
    rules: Arc<dyn CacheRuleStore>,
    cache: Arc<dyn CacheStore>,
    selector: BackendSelector,
    forwarder: Arc<dyn Forwarder>,
    analytics: AnalyticsHandle,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Dispatcher {
    pub fn new(
        resolver: RouteResolver,
        rules: Arc<dyn CacheRuleStore>,
        cache: Arc<dyn CacheStore>,
        forwarder: Arc<dyn Forwarder>,
        analytics: AnalyticsHandle,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            resolver,
            rules,
            cache,
            selector: BackendSelector::new(),
            forwarder,
            analytics,
            metrics,
        }
    }

    /// Serve one request. Every outcome records exactly one analytics event.
    pub async fn dispatch(&self, request: &ProxyRequest) -> ProxyResponse {
        let started = Instant::now();

        let route = match self.resolver.resolve(&request.path).await {
            Ok(route) => route,
            Err(e) => {
                let response = ProxyResponse::error(&e);
                self.record(request, None, &response, started);
                return response;
            }
        };

        let rule = self.cache_rule(route.id).await;
        let cache_rule = rule
            .as_ref()
            .filter(|rule| rule.enabled && request.method == Method::GET);
        let cache_key = cache_rule.map(|rule| {
            fingerprint(
                &cache_path(&request.path, request.query.as_deref(), &rule.key_pattern),
                request.method.as_str(),
                &request.body,
            )
        });

        if let Some(key) = &cache_key {
            if let Some(body) = self.cache_lookup(key).await {
                debug!("Cache hit for {} ({})", request.path, key);
                let response = ProxyResponse::cached(body);
                self.record(request, Some(&route), &response, started);
                return response;
            }
        }

        let response = match self.forward(&route, request).await {
            Ok(response) => response,
            Err(e) => {
                let response = ProxyResponse::error(&e);
                self.record(request, Some(&route), &response, started);
                return response;
            }
        };

        if let (Some(key), Some(rule)) = (&cache_key, cache_rule) {
            if response.status == 200 && rule.ttl_seconds > 0 {
                let ttl = Duration::from_secs(rule.ttl_seconds);
                if let Err(e) = self.cache.set(key, response.body.clone(), ttl).await {
                    warn!("Cache write failed for {}: {}", key, e);
                    self.with_metrics(|m| m.record_cache_error());
                }
            }
        }

        self.record(request, Some(&route), &response, started);
        response
    }

    /// Rule lookup failures are treated as "no rule"
    async fn cache_rule(&self, route_id: i64) -> Option<CacheRule> {
        match self.rules.get_cache_rule_by_route_id(route_id).await {
            Ok(rule) => rule,
            Err(e) => {
                warn!("Cache rule lookup failed for route {}: {}", route_id, e);
                None
            }
        }
    }

    /// Cache failures are soft misses
    async fn cache_lookup(&self, key: &str) -> Option<Bytes> {
        match self.cache.get(key).await {
            Ok(Some(body)) => {
                self.with_metrics(|m| m.record_cache_hit());
                Some(body)
            }
            Ok(None) => {
                self.with_metrics(|m| m.record_cache_miss());
                None
            }
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                self.with_metrics(|m| {
                    m.record_cache_error();
                    m.record_cache_miss();
                });
                None
            }
        }
    }

    async fn forward(
        &self,
        route: &Route,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, GatewayError> {
        let backend = self
            .selector
            .select(route, &route.backend_urls, &request.path)?;

        let upstream_started = Instant::now();
        let result = self
            .forwarder
            .forward(ForwardRequest {
                backend_url: backend,
                method: &request.method,
                original_path: &request.path,
                query: request.query.as_deref(),
                route_path: &route.path,
                headers: &request.headers,
                body: request.body.clone(),
                timeout_ms: route.timeout_ms,
            })
            .await;
        self.with_metrics(|m| m.record_upstream(upstream_started.elapsed(), result.is_err()));

        let upstream = result.map_err(|e| {
            warn!("Backend request to {} failed: {}", backend, e);
            e
        })?;

        let mut headers = HeaderMap::with_capacity(upstream.headers.len() + 1);
        for (name, value) in &upstream.headers {
            if !SKIPPED_RESPONSE_HEADERS.contains(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.insert(X_CACHE, HeaderValue::from_static("MISS"));

        Ok(ProxyResponse {
            status: upstream.status,
            headers,
            body: upstream.body,
            cache_status: CacheStatus::Miss,
        })
    }

    fn record(
        &self,
        request: &ProxyRequest,
        route: Option<&Route>,
        response: &ProxyResponse,
        started: Instant,
    ) {
        self.analytics.track(AnalyticsEvent {
            timestamp: Utc::now(),
            route_id: route.map(|r| r.id),
            api_key_id: request.api_key.as_ref().map(|k| k.id),
            user_id: request
                .api_key
                .as_ref()
                .map(|k| k.owner.clone())
                .unwrap_or_default(),
            status_code: response.status,
            latency_ms: started.elapsed().as_millis() as i64,
            cache_hit: response.cache_status == CacheStatus::Hit,
            ip_address: request.client_ip.clone(),
        });
    }

    fn with_metrics(&self, f: impl FnOnce(&MetricsCollector)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCacheStore, DEFAULT_INVALIDATION_PATTERN};
    use crate::catalog::StaticCatalog;
    use crate::config::ProxyConfig;
    use crate::error::GatewayResult;
    use crate::forwarder::HttpForwarder;
    use crate::models::ROUND_ROBIN;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        dispatcher: Dispatcher,
        cache: Arc<MemoryCacheStore>,
        events: mpsc::Receiver<AnalyticsEvent>,
    }

    impl Harness {
        fn drain_events(&mut self) -> Vec<AnalyticsEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn route(id: i64, path: &str, backends: Vec<String>) -> Route {
        Route {
            id,
            path: path.to_string(),
            backend_urls: backends,
            load_balancing_strategy: ROUND_ROBIN.to_string(),
            timeout_ms: 2000,
            retry_count: 0,
            owner: "team".to_string(),
        }
    }

    fn rule(route_id: i64, ttl_seconds: u64) -> CacheRule {
        CacheRule {
            id: route_id,
            route_id,
            ttl_seconds,
            key_pattern: "*".to_string(),
            enabled: true,
            owner: "team".to_string(),
        }
    }

    fn harness_with(
        routes: Vec<Route>,
        rules: Vec<CacheRule>,
        cache: Arc<dyn CacheStore>,
    ) -> (Dispatcher, mpsc::Receiver<AnalyticsEvent>) {
        let catalog = Arc::new(StaticCatalog::new(routes, rules, vec![]));
        let (analytics, events) = AnalyticsHandle::channel(100, None);
        let dispatcher = Dispatcher::new(
            RouteResolver::new(catalog.clone()),
            catalog,
            cache,
            Arc::new(HttpForwarder::new(&ProxyConfig::default()).unwrap()),
            analytics,
            None,
        );
        (dispatcher, events)
    }

    fn harness(routes: Vec<Route>, rules: Vec<CacheRule>) -> Harness {
        let cache = Arc::new(MemoryCacheStore::default());
        let (dispatcher, events) = harness_with(routes, rules, cache.clone());
        Harness {
            dispatcher,
            cache,
            events,
        }
    }

    fn request(method: Method, path: &str, body: &'static [u8]) -> ProxyRequest {
        ProxyRequest {
            method,
            path: path.to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
            client_ip: "203.0.113.7".to_string(),
            api_key: Some(ApiKey {
                id: 11,
                key: "gw_test".to_string(),
                name: "test".to_string(),
                tier: "free".to_string(),
                rate_limit_rpm: 100,
                enabled: true,
                owner: "user_42".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_get_is_cached_and_post_is_not() {
        let backend_a = MockServer::start().await;
        let backend_b = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string("{\"from\":\"a\"}"),
            )
            .expect(1)
            .mount(&backend_a)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(201).set_body_string("{\"created\":\"a\"}"))
            .expect(1)
            .mount(&backend_a)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(201).set_body_string("{\"created\":\"b\"}"))
            .expect(1)
            .mount(&backend_b)
            .await;

        let mut h = harness(
            vec![route(1, "/foo", vec![backend_a.uri(), backend_b.uri()])],
            vec![rule(1, 60)],
        );

        let first = h.dispatcher.dispatch(&request(Method::GET, "/foo", b"")).await;
        assert_eq!(first.status, 200);
        assert_eq!(first.cache_status, CacheStatus::Miss);
        assert_eq!(first.headers.get(X_CACHE).unwrap(), "MISS");
        assert_eq!(first.body, Bytes::from_static(b"{\"from\":\"a\"}"));

        let second = h.dispatcher.dispatch(&request(Method::GET, "/foo", b"")).await;
        assert_eq!(second.status, 200);
        assert_eq!(second.headers.get(X_CACHE).unwrap(), "HIT");
        assert_eq!(second.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(second.body, first.body);

        let post = h.dispatcher.dispatch(&request(Method::POST, "/foo", b"{}")).await;
        assert_eq!(post.status, 201);
        assert_eq!(post.body, Bytes::from_static(b"{\"created\":\"b\"}"));
        let post = h.dispatcher.dispatch(&request(Method::POST, "/foo", b"{}")).await;
        assert_eq!(post.body, Bytes::from_static(b"{\"created\":\"a\"}"));
        assert_eq!(h.cache.len(), 1);

        let events = h.drain_events();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events.iter().map(|e| e.cache_hit).collect::<Vec<_>>(),
            vec![false, true, false, false]
        );
        assert!(events.iter().all(|e| e.route_id == Some(1)));
        assert!(events.iter().all(|e| e.api_key_id == Some(11)));
        assert_eq!(events[0].user_id, "user_42");
        assert_eq!(events[0].ip_address, "203.0.113.7");
    }

    #[tokio::test]
    async fn test_unresolved_route_is_404_without_backend_call() {
        let backend = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        let mut h = harness(vec![route(1, "/foo", vec![backend.uri()])], vec![]);
        let response = h.dispatcher.dispatch(&request(Method::GET, "/bar", b"")).await;

        assert_eq!(response.status, 404);
        assert_eq!(response.body, Bytes::from_static(b"{\"error\":\"route not found\"}"));
        assert!(response.headers.get(X_CACHE).is_none());

        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].route_id, None);
        assert_eq!(events[0].status_code, 404);
    }

    #[tokio::test]
    async fn test_invalidation_forces_miss() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(2)
            .mount(&backend)
            .await;

        let h = harness(vec![route(1, "/foo", vec![backend.uri()])], vec![rule(1, 60)]);
        let get = request(Method::GET, "/foo", b"");

        assert_eq!(h.dispatcher.dispatch(&get).await.cache_status, CacheStatus::Miss);
        assert_eq!(h.dispatcher.dispatch(&get).await.cache_status, CacheStatus::Hit);

        h.cache.invalidate(DEFAULT_INVALIDATION_PATTERN).await.unwrap();
        assert_eq!(h.dispatcher.dispatch(&get).await.cache_status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_non_200_and_zero_ttl_are_not_cached() {
        let missing = MockServer::start().await;
        Mock::given(path("/"))
            .respond_with(ResponseTemplate::new(404).set_body_string("{}"))
            .expect(2)
            .mount(&missing)
            .await;
        let fresh = MockServer::start().await;
        Mock::given(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(2)
            .mount(&fresh)
            .await;

        let h = harness(
            vec![
                route(1, "/missing", vec![missing.uri()]),
                route(2, "/fresh", vec![fresh.uri()]),
            ],
            vec![rule(1, 60), rule(2, 0)],
        );

        for _ in 0..2 {
            let response = h.dispatcher.dispatch(&request(Method::GET, "/missing", b"")).await;
            assert_eq!(response.status, 404);
            let response = h.dispatcher.dispatch(&request(Method::GET, "/fresh", b"")).await;
            assert_eq!(response.status, 200);
            assert_eq!(response.cache_status, CacheStatus::Miss);
        }
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_query_string_participates_in_cache_key() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(2)
            .mount(&backend)
            .await;

        let h = harness(vec![route(1, "/search", vec![backend.uri()])], vec![rule(1, 60)]);
        let mut page_one = request(Method::GET, "/search", b"");
        page_one.query = Some("page=1".to_string());
        let mut page_two = page_one.clone();
        page_two.query = Some("page=2".to_string());

        assert_eq!(h.dispatcher.dispatch(&page_one).await.cache_status, CacheStatus::Miss);
        assert_eq!(h.dispatcher.dispatch(&page_two).await.cache_status, CacheStatus::Miss);
        assert_eq!(h.dispatcher.dispatch(&page_one).await.cache_status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn test_backend_failure_is_502() {
        let mut h = harness(
            vec![route(1, "/down", vec!["http://127.0.0.1:1".to_string()])],
            vec![],
        );

        let response = h.dispatcher.dispatch(&request(Method::GET, "/down", b"")).await;
        assert_eq!(response.status, 502);
        assert_eq!(
            response.body,
            Bytes::from_static(b"{\"error\":\"backend request failed\"}")
        );

        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status_code, 502);
        assert_eq!(events[0].route_id, Some(1));
    }

    #[test]
    fn test_rate_limited_response_carries_limit_header() {
        let response = ProxyResponse::error(&GatewayError::RateLimitExceeded { limit: 5 });
        assert_eq!(response.status, 429);
        assert_eq!(response.headers.get(X_RATELIMIT_LIMIT).unwrap(), "5");
        assert_eq!(
            response.body,
            Bytes::from_static(b"{\"error\":\"rate limit exceeded\"}")
        );

        let response = ProxyResponse::error(&GatewayError::RouteNotFound("/x".into()));
        assert!(response.headers.get(X_RATELIMIT_LIMIT).is_none());
    }

    struct BrokenCache;

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _key: &str) -> GatewayResult<Option<Bytes>> {
            Err(GatewayError::CacheUnavailable("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> GatewayResult<()> {
            Err(GatewayError::CacheUnavailable("connection refused".to_string()))
        }

        async fn invalidate(&self, _pattern: &str) -> GatewayResult<u64> {
            Err(GatewayError::CacheUnavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cache_failure_is_soft_miss() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":1}"))
            .expect(2)
            .mount(&backend)
            .await;

        let (dispatcher, _events) = harness_with(
            vec![route(1, "/foo", vec![backend.uri()])],
            vec![rule(1, 60)],
            Arc::new(BrokenCache),
        );
        let get = request(Method::GET, "/foo", b"");

        for _ in 0..2 {
            let response = dispatcher.dispatch(&get).await;
            assert_eq!(response.status, 200);
            assert_eq!(response.cache_status, CacheStatus::Miss);
        }
    }

    #[tokio::test]
    async fn test_version_prefix_route_forwards_full_path() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&backend)
            .await;

        let h = harness(vec![route(1, "/users", vec![backend.uri()])], vec![]);
        let response = h.dispatcher.dispatch(&request(Method::GET, "/api/users", b"")).await;
        assert_eq!(response.status, 200);
    }
}
