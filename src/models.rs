//! Domain records shared by the request pipeline, the catalog and analytics
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Load-balancing strategy tag persisted with a route
pub const ROUND_ROBIN: &str = "round-robin";

/// A configured logical endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: i64,
    /// Unique path (per owner) the route is addressed by
    pub path: String,
    /// Backend base URLs in selection order
    pub backend_urls: Vec<String>,
    pub load_balancing_strategy: String,
    /// Per-request timeout for the outbound call
    pub timeout_ms: u64,
    /// Persisted for the admin side; forwarding does not retry
    pub retry_count: u32,
    pub owner: String,
}

/// Caching policy for exactly one route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRule {
    pub id: i64,
    pub route_id: i64,
    pub ttl_seconds: u64,
    /// `*` (whole query string) or a comma separated list of query parameters
    /// that take part in the cache fingerprint
    pub key_pattern: String,
    pub enabled: bool,
    pub owner: String,
}

/// Caller credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    /// Secret token presented as `Authorization: Bearer <key>`
    pub key: String,
    pub name: String,
    pub tier: String,
    pub rate_limit_rpm: u32,
    pub enabled: bool,
    pub owner: String,
}

impl ApiKey {
    /// Identity used for rate-limit counters
    pub fn rate_limit_identity(&self) -> String {
        format!("apikey:{}", self.id)
    }
}

/// One immutable record of a completed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub timestamp: DateTime<Utc>,
    pub route_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub user_id: String,
    pub status_code: u16,
    pub latency_ms: i64,
    pub cache_hit: bool,
    pub ip_address: String,
}

/// Aggregate view over stored analytics events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsMetrics {
    pub total_requests: i64,
    pub error_rate: f64,
    pub cache_hit_ratio: f64,
    pub latency_p50: i64,
    pub latency_p95: i64,
    pub latency_p99: i64,
    pub requests_per_min: Vec<RequestsPerMin>,
    pub top_endpoints: Vec<EndpointStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestsPerMin {
    pub timestamp: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub path: String,
    pub request_count: i64,
    pub avg_latency_ms: i64,
    pub error_rate: f64,
}
