//! Admin endpoints: analytics reads and cache invalidation
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::analytics::AnalyticsQuery;
use crate::cache::{CacheStore, DEFAULT_INVALIDATION_PATTERN};
use crate::dispatcher::ProxyResponse;
use crate::error::{GatewayError, GatewayResult};
use crate::models::AnalyticsMetrics;

#[derive(Debug, Default, Deserialize)]
struct InvalidateRequest {
    #[serde(default)]
    pattern: Option<String>,
}

/// Handlers behind `/admin/*`, already authorized by the caller
pub struct AdminApi {
    analytics: Arc<dyn AnalyticsQuery>,
    cache: Arc<dyn CacheStore>,
    realtime_window: Duration,
    default_window: Duration,
}

impl AdminApi {
    pub fn new(
        analytics: Arc<dyn AnalyticsQuery>,
        cache: Arc<dyn CacheStore>,
        realtime_window: Duration,
        default_window: Duration,
    ) -> Self {
        Self {
            analytics,
            cache,
            realtime_window,
            default_window,
        }
    }

    /// `GET /admin/analytics/metrics?start=..&end=..`
    pub async fn metrics(&self, query: Option<&str>) -> ProxyResponse {
        let (start, end) = match self.time_range(query, Utc::now()) {
            Ok(range) => range,
            Err(e) => return ProxyResponse::error(&e),
        };

        match self.analytics.metrics(start, end).await {
            Ok(metrics) => json_response(&metrics),
            Err(e) => {
                warn!("Analytics query failed: {}", e);
                failure("failed to get metrics")
            }
        }
    }

    /// `GET /admin/analytics/realtime`
    pub async fn realtime(&self) -> ProxyResponse {
        match self.analytics.realtime_metrics(self.realtime_window).await {
            Ok(metrics) => json_response(&metrics),
            Err(e) => {
                warn!("Realtime analytics query failed: {}", e);
                failure("failed to get metrics")
            }
        }
    }

    /// One Server-Sent Events frame; `None` skips this tick
    pub async fn stream_frame(&self) -> Option<Bytes> {
        match self.analytics.realtime_metrics(self.realtime_window).await {
            Ok(metrics) => sse_frame(&metrics).ok(),
            Err(e) => {
                warn!("Realtime analytics query failed: {}", e);
                None
            }
        }
    }

    /// `POST /admin/cache/invalidate` with an optional `{"pattern": ".."}` body
    pub async fn invalidate(&self, body: &[u8]) -> ProxyResponse {
        let request = if body.iter().all(u8::is_ascii_whitespace) {
            InvalidateRequest::default()
        } else {
            match serde_json::from_slice::<InvalidateRequest>(body) {
                Ok(request) => request,
                Err(_) => {
                    return ProxyResponse::error(&GatewayError::InvalidRequest(
                        "invalid request body".to_string(),
                    ))
                }
            }
        };
        let pattern = request
            .pattern
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_INVALIDATION_PATTERN.to_string());

        match self.cache.invalidate(&pattern).await {
            Ok(deleted) => {
                info!("Invalidated {} cache entries matching {}", deleted, pattern);
                ProxyResponse::json(
                    200,
                    &serde_json::json!({ "message": "cache invalidated", "deleted": deleted }),
                )
            }
            Err(e @ GatewayError::InvalidRequest(_)) => ProxyResponse::error(&e),
            Err(e) => {
                warn!("Cache invalidation for {} failed: {}", pattern, e);
                failure("failed to invalidate cache")
            }
        }
    }

    /// Window for the metrics endpoint; missing bounds default to the last
    /// `default_window` ending now
    fn time_range(
        &self,
        query: Option<&str>,
        now: DateTime<Utc>,
    ) -> GatewayResult<(DateTime<Utc>, DateTime<Utc>)> {
        let mut start = None;
        let mut end = None;
        for (name, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match name.as_ref() {
                "start" if !value.is_empty() => start = Some(parse_time(&value, "start")?),
                "end" if !value.is_empty() => end = Some(parse_time(&value, "end")?),
                _ => {}
            }
        }

        let window = chrono::Duration::from_std(self.default_window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        Ok((start.unwrap_or(now - window), end.unwrap_or(now)))
    }
}

fn parse_time(value: &str, which: &str) -> GatewayResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| GatewayError::InvalidRequest(format!("invalid {} time format", which)))
}

/// `data: <json>\n\n`
pub fn sse_frame(metrics: &AnalyticsMetrics) -> serde_json::Result<Bytes> {
    let json = serde_json::to_string(metrics)?;
    Ok(Bytes::from(format!("data: {}\n\n", json)))
}

fn json_response<T: Serialize>(value: &T) -> ProxyResponse {
    match serde_json::to_value(value) {
        Ok(value) => ProxyResponse::json(200, &value),
        Err(e) => {
            warn!("Failed to serialize admin response: {}", e);
            failure("internal error")
        }
    }
}

fn failure(message: &str) -> ProxyResponse {
    ProxyResponse::json(500, &serde_json::json!({ "error": message }))
}
