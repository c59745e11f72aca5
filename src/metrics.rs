/// Metrics collection and monitoring for the API Gateway
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Duration;

const LATENCY_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics collector for the API Gateway
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Registry,

    // Request metrics
    requests_total: IntCounter,
    requests_in_flight: IntGauge,
    request_duration: Histogram,
    /// Responses by status class (2xx, 3xx, 4xx, 5xx, other)
    responses_total: IntCounterVec,

    // Upstream metrics
    upstream_requests_total: IntCounter,
    upstream_errors_total: IntCounter,
    upstream_duration: Histogram,

    // Cache metrics
    cache_hits_total: IntCounter,
    cache_misses_total: IntCounter,
    cache_errors_total: IntCounter,

    // Admission metrics
    rate_limited_total: IntCounter,
    auth_failures_total: IntCounter,

    // Analytics pipeline metrics
    analytics_dropped_total: IntCounter,
    analytics_flushed_total: IntCounter,
    analytics_flush_failures_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram> {
    let histogram =
        Histogram::with_opts(HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()))?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_in_flight = IntGauge::with_opts(Opts::new(
            "gateway_requests_in_flight",
            "Number of HTTP requests currently being processed",
        ))?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        let responses_total = IntCounterVec::new(
            Opts::new(
                "gateway_responses_total",
                "Total number of responses by HTTP status class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(responses_total.clone()))?;

        Ok(Self {
            requests_total: counter(
                &registry,
                "gateway_requests_total",
                "Total number of HTTP requests processed by the gateway",
            )?,
            requests_in_flight,
            request_duration: histogram(
                &registry,
                "gateway_request_duration_seconds",
                "HTTP request duration in seconds",
            )?,
            responses_total,
            upstream_requests_total: counter(
                &registry,
                "gateway_upstream_requests_total",
                "Total number of requests sent to backends",
            )?,
            upstream_errors_total: counter(
                &registry,
                "gateway_upstream_errors_total",
                "Total number of failed backend requests",
            )?,
            upstream_duration: histogram(
                &registry,
                "gateway_upstream_duration_seconds",
                "Backend request duration in seconds",
            )?,
            cache_hits_total: counter(
                &registry,
                "gateway_cache_hits_total",
                "Total number of responses served from cache",
            )?,
            cache_misses_total: counter(
                &registry,
                "gateway_cache_misses_total",
                "Total number of cacheable requests not found in cache",
            )?,
            cache_errors_total: counter(
                &registry,
                "gateway_cache_errors_total",
                "Total number of cache store failures",
            )?,
            rate_limited_total: counter(
                &registry,
                "gateway_rate_limited_total",
                "Total number of requests rejected by rate limiting",
            )?,
            auth_failures_total: counter(
                &registry,
                "gateway_auth_failures_total",
                "Total number of requests rejected for missing or invalid credentials",
            )?,
            analytics_dropped_total: counter(
                &registry,
                "gateway_analytics_events_dropped_total",
                "Analytics events dropped because the buffer was full",
            )?,
            analytics_flushed_total: counter(
                &registry,
                "gateway_analytics_events_flushed_total",
                "Analytics events written to the analytics store",
            )?,
            analytics_flush_failures_total: counter(
                &registry,
                "gateway_analytics_flush_failures_total",
                "Analytics batches discarded after a failed write",
            )?,
            registry,
        })
    }

    /// Record a new request
    pub fn record_request(&self) {
        self.requests_total.inc();
        self.requests_in_flight.inc();
    }

    /// Record a completed response, grouped by status class to limit cardinality
    pub fn record_response(&self, status_code: u16, duration: Duration) {
        self.requests_in_flight.dec();
        self.request_duration.observe(duration.as_secs_f64());
        self.responses_total
            .with_label_values(&[status_class(status_code)])
            .inc();
    }

    pub fn record_upstream(&self, duration: Duration, failed: bool) {
        self.upstream_requests_total.inc();
        self.upstream_duration.observe(duration.as_secs_f64());
        if failed {
            self.upstream_errors_total.inc();
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    pub fn record_cache_error(&self) {
        self.cache_errors_total.inc();
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures_total.inc();
    }

    pub fn record_analytics_dropped(&self) {
        self.analytics_dropped_total.inc();
    }

    pub fn record_analytics_flushed(&self, events: usize) {
        self.analytics_flushed_total.inc_by(events as u64);
    }

    pub fn record_analytics_flush_failure(&self) {
        self.analytics_flush_failures_total.inc();
    }

    /// Get current metrics snapshot
    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.get(),
            requests_in_flight: self.requests_in_flight.get(),
            upstream_requests_total: self.upstream_requests_total.get(),
            upstream_errors_total: self.upstream_errors_total.get(),
            cache_hits_total: self.cache_hits_total.get(),
            cache_misses_total: self.cache_misses_total.get(),
            rate_limited_total: self.rate_limited_total.get(),
            analytics_dropped_total: self.analytics_dropped_total.get(),
            analytics_flushed_total: self.analytics_flushed_total.get(),
            analytics_flush_failures_total: self.analytics_flush_failures_total.get(),
        }
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn status_class(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

/// Snapshot of current metrics values
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_in_flight: i64,
    pub upstream_requests_total: u64,
    pub upstream_errors_total: u64,
    pub cache_hits_total: u64,
    pub cache_misses_total: u64,
    pub rate_limited_total: u64,
    pub analytics_dropped_total: u64,
    pub analytics_flushed_total: u64,
    pub analytics_flush_failures_total: u64,
}

impl MetricsSnapshot {
    /// Share of cacheable lookups served from cache
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits_total + self.cache_misses_total;
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits_total as f64 / lookups as f64
    }

    /// Calculate upstream error rate
    pub fn upstream_error_rate(&self) -> f64 {
        if self.upstream_requests_total == 0 {
            return 0.0;
        }

        (self.upstream_errors_total as f64 / self.upstream_requests_total as f64) * 100.0
    }
}
