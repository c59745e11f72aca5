//! Configuration management for the API Gateway
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::models::{ApiKey, CacheRule, Route, ROUND_ROBIN};

/// Main configuration structure for the API Gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Outbound client configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Shared backing stores
    #[serde(default)]
    pub storage: StorageConfig,
    /// Analytics pipeline configuration
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    /// Metrics and monitoring configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Admin surface configuration
    #[serde(default)]
    pub admin: AdminConfig,
    /// CORS configuration
    pub cors: Option<CorsConfig>,
    /// Statically declared routes (used when no database is configured)
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Statically declared API keys (used when no database is configured)
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listening address
    pub http_addr: SocketAddr,
    /// Deadline for serving one request, including the backend call
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Time in-flight requests get to finish after a shutdown signal
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub shutdown_grace_period: Duration,
    /// Largest request body the gateway will buffer
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Worker threads for the proxy service
    pub threads: Option<usize>,
}

/// Outbound HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Timeout used when a route does not carry its own
    #[serde(with = "humantime_serde", default = "default_proxy_timeout")]
    pub default_timeout: Duration,
    /// Idle connections kept per backend host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    /// How long an idle pooled connection is kept
    #[serde(with = "humantime_serde", default = "default_pool_idle_timeout")]
    pub pool_idle_timeout: Duration,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Redis URL for the cache store and rate limiter (in-memory when absent)
    pub redis_url: Option<String>,
    /// Postgres URL for the catalog and analytics (static config when absent)
    pub database_url: Option<String>,
    /// Maximum Postgres connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    /// Minimum idle Postgres connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    /// Maximum Redis connections
    #[serde(default = "default_redis_pool_size")]
    pub redis_pool_size: usize,
    /// Entries kept by the in-memory cache store
    #[serde(default = "default_memory_cache_max_entries")]
    pub memory_cache_max_entries: usize,
}

/// Analytics pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Bounded buffer between request handlers and the consumer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Accumulated events that trigger an immediate flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Periodic flush interval
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    /// Interval between pushes on the streaming endpoint
    #[serde(with = "humantime_serde", default = "default_stream_interval")]
    pub stream_interval: Duration,
    /// Window used by the realtime aggregate
    #[serde(with = "humantime_serde", default = "default_realtime_window")]
    pub realtime_window: Duration,
    /// Window used by the metrics endpoint when no start is given
    #[serde(with = "humantime_serde", default = "default_metrics_window")]
    pub default_window: Duration,
    /// Events kept by the in-memory analytics store
    #[serde(default = "default_memory_retention")]
    pub memory_retention: usize,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Enforce per-key limits on proxy traffic
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Prefix for window counter keys
    #[serde(default = "default_rate_limit_prefix")]
    pub key_prefix: String,
}

/// Metrics and monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus: bool,
    /// Prometheus metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

/// Admin surface configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bearer token required on `/admin/*`; the admin surface is closed without it
    pub token: Option<String>,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins
    pub allowed_origins: Vec<String>,
    /// Allowed methods
    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,
    /// Allowed headers
    #[serde(default = "default_cors_headers")]
    pub allowed_headers: Vec<String>,
    /// Headers the browser may read
    #[serde(default = "default_cors_exposed_headers")]
    pub exposed_headers: Vec<String>,
    /// Maximum age for preflight requests
    #[serde(with = "humantime_serde", default)]
    pub max_age: Option<Duration>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route identifier
    pub id: i64,
    /// Exact path the route is addressed by
    pub path: String,
    /// Backend base URLs
    pub backends: Vec<String>,
    /// Load balancing strategy tag
    #[serde(default = "default_strategy")]
    pub load_balancing: String,
    /// Request timeout
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    /// Number of retries (persisted, not acted on)
    #[serde(default)]
    pub retries: u32,
    /// Owner identity
    #[serde(default)]
    pub owner: String,
    /// Route-specific cache rule
    pub cache: Option<RouteCacheConfig>,
}

/// Route-specific cache rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCacheConfig {
    /// Enable caching for this route
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lifetime of cached responses
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Query parameters taking part in the cache key
    #[serde(default = "default_key_pattern")]
    pub key_pattern: String,
}

/// API key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub id: i64,
    /// Secret token
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    /// Requests allowed per minute
    pub rate_limit_rpm: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub owner: String,
}

impl RouteConfig {
    /// Convert to the catalog record
    pub fn to_route(&self, default_timeout: Duration) -> Route {
        Route {
            id: self.id,
            path: self.path.clone(),
            backend_urls: self.backends.clone(),
            load_balancing_strategy: self.load_balancing.clone(),
            timeout_ms: self.timeout.unwrap_or(default_timeout).as_millis() as u64,
            retry_count: self.retries,
            owner: self.owner.clone(),
        }
    }

    /// Convert the nested cache section to a cache rule, if any
    pub fn to_cache_rule(&self) -> Option<CacheRule> {
        self.cache.as_ref().map(|cache| CacheRule {
            id: self.id,
            route_id: self.id,
            ttl_seconds: cache.ttl.as_secs(),
            key_pattern: cache.key_pattern.clone(),
            enabled: cache.enabled,
            owner: self.owner.clone(),
        })
    }
}

impl From<&ApiKeyConfig> for ApiKey {
    fn from(config: &ApiKeyConfig) -> Self {
        ApiKey {
            id: config.id,
            key: config.key.clone(),
            name: config.name.clone(),
            tier: config.tier.clone(),
            rate_limit_rpm: config.rate_limit_rpm,
            enabled: config.enabled,
            owner: config.owner.clone(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&content, path)
    }

    /// Parse configuration text; the format is picked from the file extension
    pub fn parse(content: &str, path: &str) -> Result<Self> {
        let config = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(content)
                .with_context(|| format!("Failed to parse YAML config file: {}", path))?
        } else if path.ends_with(".toml") {
            toml::from_str(content)
                .with_context(|| format!("Failed to parse TOML config file: {}", path))?
        } else if path.ends_with(".json") {
            serde_json::from_str(content)
                .with_context(|| format!("Failed to parse JSON config file: {}", path))?
        } else {
            return Err(anyhow!(
                "Unsupported config file format. Supported formats: .yaml, .yml, .toml, .json"
            ));
        };

        Ok(config)
    }

    /// Apply environment overrides on top of the file
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {}", port))?;
            self.server.http_addr.set_port(port);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.storage.redis_url = Some(url);
        }
        if let Some(token) = lookup("ADMIN_TOKEN") {
            self.admin.token = Some(token);
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            let allowed_origins: Vec<String> = origins
                .split(',')
                .map(|origin| origin.trim().trim_end_matches('/').to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
            match &mut self.cors {
                Some(cors) => cors.allowed_origins = allowed_origins,
                None => {
                    self.cors = Some(CorsConfig {
                        allowed_origins,
                        allowed_methods: default_cors_methods(),
                        allowed_headers: default_cors_headers(),
                        exposed_headers: default_cors_exposed_headers(),
                        max_age: Some(Duration::from_secs(300)),
                    })
                }
            }
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.memory_cache_max_entries == 0 {
            return Err(anyhow!("storage.memory_cache_max_entries must be greater than zero"));
        }
        if self.analytics.buffer_capacity == 0 {
            return Err(anyhow!("analytics.buffer_capacity must be greater than zero"));
        }
        if self.analytics.batch_size == 0 {
            return Err(anyhow!("analytics.batch_size must be greater than zero"));
        }
        if self.analytics.flush_interval.is_zero() || self.analytics.stream_interval.is_zero() {
            return Err(anyhow!("analytics intervals must be greater than zero"));
        }

        let mut paths = HashSet::new();
        let mut ids = HashSet::new();
        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(anyhow!("Route '{}' path must start with '/'", route.path));
            }
            if !paths.insert((route.owner.as_str(), route.path.as_str())) {
                return Err(anyhow!("Duplicate route path: {}", route.path));
            }
            if !ids.insert(route.id) {
                return Err(anyhow!("Duplicate route ID: {}", route.id));
            }
            if route.backends.is_empty() {
                return Err(anyhow!(
                    "Route '{}' must have at least one backend",
                    route.path
                ));
            }
            for backend in &route.backends {
                let parsed = url::Url::parse(backend).with_context(|| {
                    format!("Route '{}' has invalid backend URL '{}'", route.path, backend)
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(anyhow!(
                        "Route '{}' backend '{}' must use http or https",
                        route.path,
                        backend
                    ));
                }
            }
            if route.load_balancing != ROUND_ROBIN {
                log::warn!(
                    "Route '{}' uses unsupported strategy '{}', round-robin will be used",
                    route.path,
                    route.load_balancing
                );
            }
        }

        let mut tokens = HashSet::new();
        for key in &self.api_keys {
            if key.key.is_empty() {
                return Err(anyhow!("API key {} has an empty token", key.id));
            }
            if !tokens.insert(key.key.as_str()) {
                return Err(anyhow!("Duplicate API key token for key {}", key.id));
            }
        }

        if self.metrics.prometheus && !self.metrics.metrics_path.starts_with('/') {
            return Err(anyhow!("metrics.metrics_path must start with '/'"));
        }

        Ok(())
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_proxy_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_db_min_connections() -> u32 {
    5
}

fn default_redis_pool_size() -> usize {
    32
}

fn default_memory_cache_max_entries() -> usize {
    crate::cache::DEFAULT_MAX_ENTRIES
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_stream_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_realtime_window() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_metrics_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_memory_retention() -> usize {
    100_000
}

fn default_rate_limit_prefix() -> String {
    "ratelimit".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_cors_headers() -> Vec<String> {
    ["Accept", "Authorization", "Content-Type", "X-CSRF-Token"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_cors_exposed_headers() -> Vec<String> {
    ["Link", "X-RateLimit-Limit", "X-Cache"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_strategy() -> String {
    ROUND_ROBIN.to_string()
}

fn default_key_pattern() -> String {
    "*".to_string()
}

fn default_tier() -> String {
    "free".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_proxy_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout: default_pool_idle_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            database_url: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            redis_pool_size: default_redis_pool_size(),
            memory_cache_max_entries: default_memory_cache_max_entries(),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            stream_interval: default_stream_interval(),
            realtime_window: default_realtime_window(),
            default_window: default_metrics_window(),
            memory_retention: default_memory_retention(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: default_rate_limit_prefix(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus: true,
            metrics_path: default_metrics_path(),
        }
    }
}
