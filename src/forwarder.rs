//! Outbound HTTP calls to route backends
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use log::debug;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::error::{GatewayError, GatewayResult};

/// Headers owned by the connection rather than the request
const SKIPPED_REQUEST_HEADERS: [HeaderName; 10] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// One outbound call
#[derive(Debug, Clone)]
pub struct ForwardRequest<'a> {
    pub backend_url: &'a str,
    pub method: &'a Method,
    /// Path as received from the caller
    pub original_path: &'a str,
    /// Raw query string, forwarded unchanged
    pub query: Option<&'a str>,
    /// Path of the resolved route, stripped from `original_path`
    pub route_path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    /// Per-call timeout; zero keeps the client default
    pub timeout_ms: u64,
}

/// Backend response passed through to the caller
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Any transport failure is reported as `BackendUnavailable`
    async fn forward(&self, request: ForwardRequest<'_>) -> GatewayResult<UpstreamResponse>;
}

/// Path sent to the backend: `original_path` minus the route path, `/` when empty
pub fn relative_path(original_path: &str, route_path: &str) -> String {
    let relative = original_path
        .strip_prefix(route_path)
        .unwrap_or(original_path);
    if relative.is_empty() {
        "/".to_string()
    } else if relative.starts_with('/') {
        relative.to_string()
    } else {
        format!("/{}", relative)
    }
}

/// Full backend URL including the original query string
pub fn target_url(backend_url: &str, relative_path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}{}", backend_url.trim_end_matches('/'), relative_path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Forwarder backed by a shared pooled reqwest client
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.default_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build()
            .context("Failed to build outbound HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: ForwardRequest<'_>) -> GatewayResult<UpstreamResponse> {
        let path = relative_path(request.original_path, request.route_path);
        let url = target_url(request.backend_url, &path, request.query);
        debug!("Forwarding {} {}", request.method, url);

        let mut headers = HeaderMap::with_capacity(request.headers.len() + 1);
        for (name, value) in request.headers {
            if !SKIPPED_REQUEST_HEADERS.contains(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body);
        if request.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(request.timeout_ms));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::BackendUnavailable(format!("{}: {}", url, e)))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::BackendUnavailable(format!("{}: {}", url, e)))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn forwarder() -> HttpForwarder {
        HttpForwarder::new(&ProxyConfig::default()).unwrap()
    }

    fn request<'a>(
        backend_url: &'a str,
        method: &'a Method,
        original_path: &'a str,
        route_path: &'a str,
        headers: &'a HeaderMap,
    ) -> ForwardRequest<'a> {
        ForwardRequest {
            backend_url,
            method,
            original_path,
            query: None,
            route_path,
            headers,
            body: Bytes::new(),
            timeout_ms: 0,
        }
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path("/users", "/users"), "/");
        assert_eq!(relative_path("/users/42", "/users"), "/42");
        assert_eq!(relative_path("/api/users", "/users"), "/api/users");
    }

    #[test]
    fn test_target_url() {
        assert_eq!(target_url("http://a:8080", "/", None), "http://a:8080/");
        assert_eq!(target_url("http://a:8080/", "/x", Some("q=1")), "http://a:8080/x?q=1");
        assert_eq!(target_url("http://a:8080", "/x", Some("")), "http://a:8080/x");
    }

    #[tokio::test]
    async fn test_forward_strips_route_path_and_keeps_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("page", "2"))
            .and(header_eq("accept", "application/json"))
            .and(header_eq("x-trace", "abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-backend", "a")
                    .set_body_string("{\"ok\":true}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = server.uri();
        let mut headers = HeaderMap::new();
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        let mut req = request(&backend, &Method::GET, "/users", "/users", &headers);
        req.query = Some("page=2");

        let resp = forwarder().forward(req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("x-backend").unwrap(), "a");
        assert_eq!(resp.body, Bytes::from_static(b"{\"ok\":true}"));
    }

    #[tokio::test]
    async fn test_forward_passes_body_and_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/7"))
            .and(body_string("{\"qty\":1}"))
            .respond_with(ResponseTemplate::new(500).set_body_string("{\"error\":\"boom\"}"))
            .mount(&server)
            .await;

        let backend = server.uri();
        let headers = HeaderMap::new();
        let mut req = request(&backend, &Method::POST, "/orders/7", "/orders", &headers);
        req.body = Bytes::from_static(b"{\"qty\":1}");

        let resp = forwarder().forward(req).await.unwrap();
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body, Bytes::from_static(b"{\"error\":\"boom\"}"));
    }

    #[tokio::test]
    async fn test_route_timeout_is_backend_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let backend = server.uri();
        let headers = HeaderMap::new();
        let mut req = request(&backend, &Method::GET, "/slow", "/slow", &headers);
        req.timeout_ms = 50;

        let err = forwarder().forward(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_backend_unavailable() {
        let headers = HeaderMap::new();
        let req = request("http://127.0.0.1:1", &Method::GET, "/x", "/x", &headers);

        let err = forwarder().forward(req).await.unwrap_err();
        assert_eq!(err.status_code(), 502);
    }
}
