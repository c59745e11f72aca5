//! Postgres-backed catalog and analytics store
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, QueryBuilder};
use std::time::Duration;

use crate::analytics::{AnalyticsQuery, AnalyticsSink, MAX_MINUTE_BUCKETS, MAX_TOP_ENDPOINTS};
use crate::catalog::{ApiKeyStore, CacheRuleStore, RouteStore};
use crate::config::StorageConfig;
use crate::error::GatewayResult;
use crate::models::{
    AnalyticsEvent, AnalyticsMetrics, ApiKey, CacheRule, EndpointStats, RequestsPerMin, Route,
};

/// Database connection pool type
pub type DbPool = Pool<Postgres>;

/// Bind parameters per row of `analytics_events`
const EVENT_COLUMNS: usize = 8;

/// Rows per INSERT, kept under the 65535 bind parameter limit
const MAX_ROWS_PER_INSERT: usize = u16::MAX as usize / EVENT_COLUMNS;

/// Create a PostgreSQL connection pool
pub async fn create_pool(database_url: &str, storage: &StorageConfig) -> Result<DbPool> {
    PgPoolOptions::new()
        .max_connections(storage.db_max_connections)
        .min_connections(storage.db_min_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Some(Duration::from_secs(300)))
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")
}

#[derive(sqlx::FromRow)]
struct RouteRow {
    id: i64,
    path: String,
    backend_urls: Vec<String>,
    load_balancing_strategy: String,
    timeout_ms: i32,
    retry_count: i32,
    user_id: Option<String>,
}

impl From<RouteRow> for Route {
    fn from(row: RouteRow) -> Self {
        Route {
            id: row.id,
            path: row.path,
            backend_urls: row.backend_urls,
            load_balancing_strategy: row.load_balancing_strategy,
            timeout_ms: row.timeout_ms.max(0) as u64,
            retry_count: row.retry_count.max(0) as u32,
            owner: row.user_id.unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CacheRuleRow {
    id: i64,
    route_id: i64,
    ttl_seconds: i32,
    cache_key_pattern: Option<String>,
    enabled: bool,
    user_id: Option<String>,
}

impl From<CacheRuleRow> for CacheRule {
    fn from(row: CacheRuleRow) -> Self {
        CacheRule {
            id: row.id,
            route_id: row.route_id,
            ttl_seconds: row.ttl_seconds.max(0) as u64,
            key_pattern: row.cache_key_pattern.unwrap_or_else(|| "*".to_string()),
            enabled: row.enabled,
            owner: row.user_id.unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: i64,
    key: String,
    name: String,
    tier: String,
    rate_limit_rpm: i32,
    enabled: bool,
    user_id: Option<String>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        ApiKey {
            id: row.id,
            key: row.key,
            name: row.name,
            tier: row.tier,
            rate_limit_rpm: row.rate_limit_rpm.max(0) as u32,
            enabled: row.enabled,
            owner: row.user_id.unwrap_or_default(),
        }
    }
}

/// Catalog read from the `routes`, `cache_rules` and `api_keys` tables
#[derive(Clone)]
pub struct PgCatalog {
    pool: DbPool,
}

impl PgCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RouteStore for PgCatalog {
    async fn get_route_by_path(&self, path: &str) -> GatewayResult<Option<Route>> {
        let row = sqlx::query_as::<_, RouteRow>(
            r#"
            SELECT id, path, backend_urls, load_balancing_strategy, timeout_ms, retry_count, user_id
            FROM routes WHERE path = $1
            LIMIT 1
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Route::from))
    }
}

#[async_trait]
impl CacheRuleStore for PgCatalog {
    async fn get_cache_rule_by_route_id(&self, route_id: i64) -> GatewayResult<Option<CacheRule>> {
        let row = sqlx::query_as::<_, CacheRuleRow>(
            r#"
            SELECT id, route_id, ttl_seconds, cache_key_pattern, enabled, user_id
            FROM cache_rules WHERE route_id = $1 AND enabled = true
            LIMIT 1
            "#,
        )
        .bind(route_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CacheRule::from))
    }
}

#[async_trait]
impl ApiKeyStore for PgCatalog {
    async fn get_api_key_by_token(&self, token: &str) -> GatewayResult<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            SELECT id, key, name, tier, rate_limit_rpm, enabled, user_id
            FROM api_keys WHERE key = $1 AND enabled = true
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ApiKey::from))
    }
}

/// Analytics sink and query backend over the `analytics_events` table
#[derive(Clone)]
pub struct PgAnalyticsStore {
    pool: DbPool,
}

impl PgAnalyticsStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalyticsSink for PgAnalyticsStore {
    async fn insert_batch(&self, events: &[AnalyticsEvent]) -> GatewayResult<()> {
        for chunk in events.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO analytics_events \
                 (timestamp, route_id, api_key_id, user_id, status_code, latency_ms, cache_hit, ip_address) ",
            );
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(event.timestamp)
                    .push_bind(event.route_id)
                    .push_bind(event.api_key_id)
                    .push_bind(event.user_id.clone())
                    .push_bind(i32::from(event.status_code))
                    .push_bind(event.latency_ms)
                    .push_bind(event.cache_hit)
                    .push_bind(event.ip_address.clone());
            });
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TotalsRow {
    total: i64,
    cache_hits: i64,
    errors: i64,
}

#[derive(sqlx::FromRow)]
struct PercentilesRow {
    p50: Option<f64>,
    p95: Option<f64>,
    p99: Option<f64>,
}

#[derive(sqlx::FromRow)]
struct MinuteRow {
    minute: DateTime<Utc>,
    count: i64,
}

#[derive(sqlx::FromRow)]
struct EndpointRow {
    path: String,
    request_count: i64,
    avg_latency: i64,
    error_rate: f64,
}

#[async_trait]
impl AnalyticsQuery for PgAnalyticsStore {
    async fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<AnalyticsMetrics> {
        let totals = sqlx::query_as::<_, TotalsRow>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE cache_hit = true) AS cache_hits,
                COUNT(*) FILTER (WHERE status_code >= 400) AS errors
            FROM analytics_events
            WHERE timestamp >= $1 AND timestamp <= $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        if totals.total == 0 {
            return Ok(AnalyticsMetrics::default());
        }

        let percentiles = sqlx::query_as::<_, PercentilesRow>(
            r#"
            SELECT
                PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY latency_ms) AS p50,
                PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY latency_ms) AS p95,
                PERCENTILE_CONT(0.99) WITHIN GROUP (ORDER BY latency_ms) AS p99
            FROM analytics_events
            WHERE timestamp >= $1 AND timestamp <= $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let minutes = sqlx::query_as::<_, MinuteRow>(
            r#"
            SELECT DATE_TRUNC('minute', timestamp) AS minute, COUNT(*) AS count
            FROM analytics_events
            WHERE timestamp >= $1 AND timestamp <= $2
            GROUP BY minute
            ORDER BY minute DESC
            LIMIT $3
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(MAX_MINUTE_BUCKETS as i64)
        .fetch_all(&self.pool)
        .await?;

        let endpoints = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT
                r.path AS path,
                COUNT(*) AS request_count,
                ROUND(AVG(ae.latency_ms))::bigint AS avg_latency,
                COUNT(*) FILTER (WHERE ae.status_code >= 400)::float8 / COUNT(*)::float8 AS error_rate
            FROM analytics_events ae
            JOIN routes r ON ae.route_id = r.id
            WHERE ae.timestamp >= $1 AND ae.timestamp <= $2
            GROUP BY r.path
            ORDER BY request_count DESC, r.path ASC
            LIMIT $3
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(MAX_TOP_ENDPOINTS as i64)
        .fetch_all(&self.pool)
        .await?;

        let total = totals.total as f64;
        Ok(AnalyticsMetrics {
            total_requests: totals.total,
            error_rate: totals.errors as f64 / total,
            cache_hit_ratio: totals.cache_hits as f64 / total,
            latency_p50: percentiles.p50.unwrap_or_default().round() as i64,
            latency_p95: percentiles.p95.unwrap_or_default().round() as i64,
            latency_p99: percentiles.p99.unwrap_or_default().round() as i64,
            requests_per_min: minutes
                .into_iter()
                .map(|row| RequestsPerMin {
                    timestamp: row.minute,
                    count: row.count,
                })
                .collect(),
            top_endpoints: endpoints
                .into_iter()
                .map(|row| EndpointStats {
                    path: row.path,
                    request_count: row.request_count,
                    avg_latency_ms: row.avg_latency,
                    error_rate: row.error_rate,
                })
                .collect(),
        })
    }
}
