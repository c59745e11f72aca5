/// Request admission for the API Gateway: credentials, rate limits, CORS, caller address
use http::header::{HeaderMap, AUTHORIZATION, ORIGIN};
use log::{debug, warn};
use pingora_http::ResponseHeader;
use std::net::IpAddr;
use std::sync::Arc;

use crate::catalog::ApiKeyStore;
use crate::config::CorsConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::MetricsCollector;
use crate::models::ApiKey;
use crate::rate_limit::RateLimiter;

/// Extract the token from `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> GatewayResult<&str> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(GatewayError::Unauthorized("missing authorization header"))?;
    let value = header
        .to_str()
        .map_err(|_| GatewayError::Unauthorized("invalid authorization format"))?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(GatewayError::Unauthorized("invalid authorization format")),
    }
}

/// Resolves the caller's API key
pub struct ApiKeyAuthenticator {
    store: Arc<dyn ApiKeyStore>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ApiKeyAuthenticator {
    pub fn new(store: Arc<dyn ApiKeyStore>, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self { store, metrics }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> GatewayResult<ApiKey> {
        let result = self.lookup(headers).await;
        if let Err(e) = &result {
            debug!("Authentication failed: {}", e);
            if let Some(metrics) = &self.metrics {
                metrics.record_auth_failure();
            }
        }
        result
    }

    async fn lookup(&self, headers: &HeaderMap) -> GatewayResult<ApiKey> {
        let token = bearer_token(headers)?;
        match self.store.get_api_key_by_token(token).await {
            Ok(Some(key)) if key.enabled => Ok(key),
            Ok(_) => Err(GatewayError::Unauthorized("invalid API key")),
            Err(e) => {
                warn!("API key lookup failed: {}", e);
                Err(GatewayError::Unauthorized("invalid API key"))
            }
        }
    }
}

/// Applies per-key request limits
pub struct RateLimitGuard {
    limiter: Arc<dyn RateLimiter>,
    enabled: bool,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RateLimitGuard {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        enabled: bool,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            limiter,
            enabled,
            metrics,
        }
    }

    pub async fn check(&self, key: &ApiKey) -> GatewayResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let identity = key.rate_limit_identity();
        match self.limiter.allow(&identity, key.rate_limit_rpm).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!("Rate limit exceeded for {}", identity);
                if let Some(metrics) = &self.metrics {
                    metrics.record_rate_limited();
                }
                Err(GatewayError::RateLimitExceeded {
                    limit: key.rate_limit_rpm,
                })
            }
            Err(e) => {
                warn!("Rate limit check failed for {}: {}", identity, e);
                Err(GatewayError::RateLimitUnavailable(e.to_string()))
            }
        }
    }
}

/// Static bearer token check for the admin surface; closed when no token is configured
pub fn authorize_admin(headers: &HeaderMap, admin_token: Option<&str>) -> GatewayResult<()> {
    let expected = admin_token.ok_or(GatewayError::Unauthorized("admin access disabled"))?;
    let token = bearer_token(headers)?;
    if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized("invalid admin token"))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Caller address: `X-Real-IP`, then the first `X-Forwarded-For` entry, then the socket
pub fn client_ip(headers: &HeaderMap, socket_ip: Option<IpAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }
    if let Some(first) = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    socket_ip.map(|ip| ip.to_string()).unwrap_or_default()
}

/// CORS policy
pub struct CorsPolicy {
    config: CorsConfig,
}

impl CorsPolicy {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    /// Check if origin is allowed
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }

    /// Origin header of the request when it is allowed
    pub fn allowed_origin<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .filter(|origin| self.is_origin_allowed(origin))
    }

    /// Response to an `OPTIONS` preflight from an allowed origin
    pub fn preflight_response(&self, origin: &str) -> pingora_core::Result<ResponseHeader> {
        let mut response = ResponseHeader::build(204, Some(6))?;
        self.apply(origin, &mut response)?;
        response.insert_header(
            "access-control-allow-methods",
            self.config.allowed_methods.join(", "),
        )?;
        response.insert_header(
            "access-control-allow-headers",
            self.config.allowed_headers.join(", "),
        )?;
        if let Some(max_age) = &self.config.max_age {
            response.insert_header("access-control-max-age", max_age.as_secs().to_string())?;
        }
        Ok(response)
    }

    /// Add CORS headers to a response
    pub fn apply(&self, origin: &str, response: &mut ResponseHeader) -> pingora_core::Result<()> {
        response.insert_header("access-control-allow-origin", origin)?;
        response.insert_header("access-control-allow-credentials", "true")?;
        response.insert_header("vary", "Origin")?;
        if !self.config.exposed_headers.is_empty() {
            response.insert_header(
                "access-control-expose-headers",
                self.config.exposed_headers.join(", "),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::dispatcher::{ProxyResponse, X_RATELIMIT_LIMIT};
    use crate::rate_limit::MemoryRateLimiter;
    use async_trait::async_trait;
    use http::HeaderValue;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn key(rpm: u32) -> ApiKey {
        ApiKey {
            id: 3,
            key: "gw_test".to_string(),
            name: "test".to_string(),
            tier: "free".to_string(),
            rate_limit_rpm: rpm,
            enabled: true,
            owner: "user_1".to_string(),
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn authenticator() -> ApiKeyAuthenticator {
        let catalog = StaticCatalog::new(vec![], vec![], vec![key(10)]);
        ApiKeyAuthenticator::new(Arc::new(catalog), None)
    }

    #[tokio::test]
    async fn test_authentication_messages() {
        let auth = authenticator();

        let err = auth.authenticate(&HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.client_message(), "missing authorization header");

        let err = auth
            .authenticate(&headers(&[("authorization", "Basic abc")]))
            .await
            .unwrap_err();
        assert_eq!(err.client_message(), "invalid authorization format");

        let err = auth
            .authenticate(&headers(&[("authorization", "Bearer nope")]))
            .await
            .unwrap_err();
        assert_eq!(err.client_message(), "invalid API key");
        assert_eq!(err.status_code(), 401);

        let key = auth
            .authenticate(&headers(&[("authorization", "Bearer gw_test")]))
            .await
            .unwrap();
        assert_eq!(key.id, 3);
    }

    /// Single window that never rolls over
    #[derive(Default)]
    struct OneWindowLimiter {
        count: AtomicU32,
    }

    #[async_trait]
    impl RateLimiter for OneWindowLimiter {
        async fn allow(&self, _identity: &str, limit: u32) -> GatewayResult<bool> {
            Ok(self.count.fetch_add(1, Ordering::SeqCst) < limit)
        }

        async fn current_count(&self, _identity: &str) -> GatewayResult<u64> {
            Ok(u64::from(self.count.load(Ordering::SeqCst)))
        }
    }

    #[tokio::test]
    async fn test_rate_limit_guard() {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let guard = RateLimitGuard::new(
            Arc::new(OneWindowLimiter::default()),
            true,
            Some(metrics.clone()),
        );
        let key = key(2);

        assert!(guard.check(&key).await.is_ok());
        assert!(guard.check(&key).await.is_ok());
        let err = guard.check(&key).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitExceeded { limit: 2 }));
        assert_eq!(metrics.get_metrics_snapshot().rate_limited_total, 1);

        let response = ProxyResponse::error(&err);
        assert_eq!(response.status, 429);
        assert_eq!(response.headers.get(X_RATELIMIT_LIMIT).unwrap(), "2");
        assert_eq!(&response.body[..], br#"{"error":"rate limit exceeded"}"#);
    }

    #[tokio::test]
    async fn test_disabled_rate_limit_guard() {
        let guard =
            RateLimitGuard::new(Arc::new(MemoryRateLimiter::new("ratelimit")), false, None);
        let key = key(0);
        assert!(guard.check(&key).await.is_ok());
    }

    struct BrokenLimiter;

    #[async_trait]
    impl RateLimiter for BrokenLimiter {
        async fn allow(&self, _identity: &str, _limit: u32) -> GatewayResult<bool> {
            Err(GatewayError::CacheUnavailable("connection refused".to_string()))
        }

        async fn current_count(&self, _identity: &str) -> GatewayResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_limiter_failure_is_internal_error() {
        let guard = RateLimitGuard::new(Arc::new(BrokenLimiter), true, None);
        let err = guard.check(&key(5)).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.client_message(), "rate limit check failed");
    }

    #[test]
    fn test_admin_token() {
        let good = headers(&[("authorization", "Bearer s3cret")]);
        let bad = headers(&[("authorization", "Bearer guess")]);

        assert!(authorize_admin(&good, Some("s3cret")).is_ok());
        assert!(authorize_admin(&bad, Some("s3cret")).is_err());
        assert!(authorize_admin(&good, None).is_err());
    }

    #[test]
    fn test_client_ip_precedence() {
        let socket: Option<IpAddr> = "192.168.1.9".parse().ok();

        let both = headers(&[("x-real-ip", "1.1.1.1"), ("x-forwarded-for", "2.2.2.2")]);
        assert_eq!(client_ip(&both, socket), "1.1.1.1");

        let forwarded = headers(&[("x-forwarded-for", "2.2.2.2, 10.0.0.1")]);
        assert_eq!(client_ip(&forwarded, socket), "2.2.2.2");

        assert_eq!(client_ip(&HeaderMap::new(), socket), "192.168.1.9");
        assert_eq!(client_ip(&HeaderMap::new(), None), "");
    }

    #[test]
    fn test_cors_preflight() {
        let policy = CorsPolicy::new(CorsConfig {
            allowed_origins: vec!["https://app.example.com".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            allowed_headers: vec!["Authorization".to_string()],
            exposed_headers: vec!["X-RateLimit-Limit".to_string(), "X-Cache".to_string()],
            max_age: Some(Duration::from_secs(300)),
        });

        let request = headers(&[("origin", "https://app.example.com")]);
        let origin = policy.allowed_origin(&request).unwrap();
        let response = policy.preflight_response(origin).unwrap();

        assert_eq!(response.status.as_u16(), 204);
        assert_eq!(
            response.headers.get("access-control-allow-methods").unwrap(),
            "GET, POST"
        );
        assert_eq!(
            response.headers.get("access-control-expose-headers").unwrap(),
            "X-RateLimit-Limit, X-Cache"
        );
        assert_eq!(response.headers.get("access-control-max-age").unwrap(), "300");

        let other = headers(&[("origin", "https://evil.example.com")]);
        assert!(policy.allowed_origin(&other).is_none());
    }
}
