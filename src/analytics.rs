//! Asynchronous request analytics: bounded intake, batching consumer, aggregates
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::error::{GatewayError, GatewayResult};
use crate::metrics::MetricsCollector;
use crate::models::{AnalyticsEvent, AnalyticsMetrics, EndpointStats, RequestsPerMin};

/// Per-minute points returned by an aggregate query
pub const MAX_MINUTE_BUCKETS: usize = 60;

/// Endpoints returned by an aggregate query
pub const MAX_TOP_ENDPOINTS: usize = 10;

/// Durable destination for batches of events
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn insert_batch(&self, events: &[AnalyticsEvent]) -> GatewayResult<()>;
}

/// Aggregate reads over stored events
#[async_trait]
pub trait AnalyticsQuery: Send + Sync {
    /// Aggregate over `start..=end`
    async fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<AnalyticsMetrics>;

    /// Aggregate over the trailing `window`
    async fn realtime_metrics(&self, window: Duration) -> GatewayResult<AnalyticsMetrics> {
        let end = Utc::now();
        let window = chrono::Duration::from_std(window)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid window: {}", e)))?;
        self.metrics(end - window, end).await
    }
}

/// Producer side of the analytics buffer, cloned into every request handler
#[derive(Clone)]
pub struct AnalyticsHandle {
    sender: mpsc::Sender<AnalyticsEvent>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AnalyticsHandle {
    /// Create the bounded buffer; the receiver goes to the consumer
    pub fn channel(
        capacity: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> (Self, mpsc::Receiver<AnalyticsEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, metrics }, receiver)
    }

    /// Enqueue without waiting. Returns false when the event was dropped.
    pub fn track(&self, event: AnalyticsEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_analytics_dropped();
                }
                debug!("Analytics buffer full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Analytics consumer stopped, event dropped");
                false
            }
        }
    }
}

/// What woke the consumer loop
enum Trigger {
    Event(AnalyticsEvent),
    Tick,
    Shutdown,
    Closed,
}

/// Outcome counters of one consumer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub flushed_batches: u64,
    pub flushed_events: u64,
    pub failed_batches: u64,
}

/// The single consumer that batches events into the sink
pub struct AnalyticsPipeline {
    sink: Arc<dyn AnalyticsSink>,
    batch_size: usize,
    flush_interval: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AnalyticsPipeline {
    pub fn new(
        sink: Arc<dyn AnalyticsSink>,
        batch_size: usize,
        flush_interval: Duration,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            flush_interval,
            metrics,
        }
    }

    /// Consume until `shutdown` resolves (or every producer is gone), then
    /// drain what is already queued and flush it once.
    pub async fn run<F>(
        &self,
        mut receiver: mpsc::Receiver<AnalyticsEvent>,
        shutdown: F,
    ) -> PipelineReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut batch = Vec::with_capacity(self.batch_size);
        let mut report = PipelineReport::default();

        loop {
            let trigger = tokio::select! {
                biased;
                _ = &mut shutdown => Trigger::Shutdown,
                event = receiver.recv() => match event {
                    Some(event) => Trigger::Event(event),
                    None => Trigger::Closed,
                },
                _ = ticker.tick() => Trigger::Tick,
            };

            match trigger {
                Trigger::Event(event) => {
                    batch.push(event);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch, &mut report).await;
                    }
                }
                Trigger::Tick => {
                    if !batch.is_empty() {
                        self.flush(&mut batch, &mut report).await;
                    }
                }
                Trigger::Shutdown => {
                    receiver.close();
                    while let Ok(event) = receiver.try_recv() {
                        batch.push(event);
                    }
                    self.flush(&mut batch, &mut report).await;
                    break;
                }
                Trigger::Closed => {
                    self.flush(&mut batch, &mut report).await;
                    break;
                }
            }
        }

        report
    }

    /// Write the batch once; a failed batch is discarded
    async fn flush(&self, batch: &mut Vec<AnalyticsEvent>, report: &mut PipelineReport) {
        if batch.is_empty() {
            return;
        }

        match self.sink.insert_batch(batch).await {
            Ok(()) => {
                debug!("Flushed {} analytics events", batch.len());
                report.flushed_batches += 1;
                report.flushed_events += batch.len() as u64;
                if let Some(metrics) = &self.metrics {
                    metrics.record_analytics_flushed(batch.len());
                }
            }
            Err(e) => {
                warn!("Discarding {} analytics events: {}", batch.len(), e);
                report.failed_batches += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_analytics_flush_failure();
                }
            }
        }
        batch.clear();
    }
}

/// Runs the analytics consumer for the lifetime of the server
pub struct AnalyticsService {
    pipeline: AnalyticsPipeline,
    receiver: Mutex<Option<mpsc::Receiver<AnalyticsEvent>>>,
    /// Wait between the shutdown signal and the final flush
    final_flush_delay: Duration,
}

impl AnalyticsService {
    pub fn new(
        pipeline: AnalyticsPipeline,
        receiver: mpsc::Receiver<AnalyticsEvent>,
        final_flush_delay: Duration,
    ) -> Self {
        Self {
            pipeline,
            receiver: Mutex::new(Some(receiver)),
            final_flush_delay,
        }
    }
}

#[async_trait]
impl BackgroundService for AnalyticsService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let receiver = match self.receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(receiver) = receiver else {
            warn!("Analytics consumer already started");
            return;
        };

        info!(
            "Starting analytics consumer (batch: {}, interval: {:?})",
            self.pipeline.batch_size, self.pipeline.flush_interval
        );

        let delay = self.final_flush_delay;
        let report = self
            .pipeline
            .run(receiver, async move {
                // An error means the server dropped the watch; treat it as shutdown too
                let _ = shutdown.changed().await;
                debug!("Analytics final flush in {:?}", delay);
                sleep(delay).await;
            })
            .await;

        info!(
            "Analytics consumer stopped: {} events in {} batches, {} batches discarded",
            report.flushed_events, report.flushed_batches, report.failed_batches
        );
    }
}

/// Continuous percentile with linear interpolation over sorted values
pub fn percentile(sorted: &[i64], fraction: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0] as f64,
        len => {
            let rank = fraction.clamp(0.0, 1.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let lower_value = sorted[lower] as f64;
            lower_value + (sorted[upper] as f64 - lower_value) * (rank - lower as f64)
        }
    }
}

fn minute_start(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let secs = timestamp.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(timestamp)
}

/// Aggregate a set of events. Events whose route has no known path are
/// counted in the totals but not in the endpoint ranking.
pub fn aggregate<'a, I>(events: I, route_paths: &HashMap<i64, String>) -> AnalyticsMetrics
where
    I: IntoIterator<Item = &'a AnalyticsEvent>,
{
    let mut total: i64 = 0;
    let mut errors: i64 = 0;
    let mut hits: i64 = 0;
    let mut latencies = Vec::new();
    let mut per_minute: HashMap<DateTime<Utc>, i64> = HashMap::new();
    // path -> (count, latency sum, errors)
    let mut endpoints: HashMap<&str, (i64, i64, i64)> = HashMap::new();

    for event in events {
        total += 1;
        let is_error = event.status_code >= 400;
        if is_error {
            errors += 1;
        }
        if event.cache_hit {
            hits += 1;
        }
        latencies.push(event.latency_ms);
        *per_minute.entry(minute_start(event.timestamp)).or_default() += 1;

        if let Some(path) = event.route_id.and_then(|id| route_paths.get(&id)) {
            let stats = endpoints.entry(path.as_str()).or_default();
            stats.0 += 1;
            stats.1 += event.latency_ms;
            stats.2 += i64::from(is_error);
        }
    }

    if total == 0 {
        return AnalyticsMetrics::default();
    }

    latencies.sort_unstable();

    let mut requests_per_min: Vec<RequestsPerMin> = per_minute
        .into_iter()
        .map(|(timestamp, count)| RequestsPerMin { timestamp, count })
        .collect();
    requests_per_min.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    requests_per_min.truncate(MAX_MINUTE_BUCKETS);

    let mut top_endpoints: Vec<EndpointStats> = endpoints
        .into_iter()
        .map(|(path, (count, latency_sum, errors))| EndpointStats {
            path: path.to_string(),
            request_count: count,
            avg_latency_ms: (latency_sum as f64 / count as f64).round() as i64,
            error_rate: errors as f64 / count as f64,
        })
        .collect();
    top_endpoints.sort_by(|a, b| {
        b.request_count
            .cmp(&a.request_count)
            .then_with(|| a.path.cmp(&b.path))
    });
    top_endpoints.truncate(MAX_TOP_ENDPOINTS);

    AnalyticsMetrics {
        total_requests: total,
        error_rate: errors as f64 / total as f64,
        cache_hit_ratio: hits as f64 / total as f64,
        latency_p50: percentile(&latencies, 0.50).round() as i64,
        latency_p95: percentile(&latencies, 0.95).round() as i64,
        latency_p99: percentile(&latencies, 0.99).round() as i64,
        requests_per_min,
        top_endpoints,
    }
}

/// In-process analytics store with bounded retention
pub struct MemoryAnalyticsStore {
    events: RwLock<VecDeque<AnalyticsEvent>>,
    retention: usize,
    route_paths: HashMap<i64, String>,
}

impl MemoryAnalyticsStore {
    pub fn new(retention: usize, route_paths: HashMap<i64, String>) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            retention: retention.max(1),
            route_paths,
        }
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalyticsStore {
    async fn insert_batch(&self, events: &[AnalyticsEvent]) -> GatewayResult<()> {
        let mut stored = self.events.write().await;
        stored.extend(events.iter().cloned());
        let overflow = stored.len().saturating_sub(self.retention);
        stored.drain(..overflow);
        Ok(())
    }
}

#[async_trait]
impl AnalyticsQuery for MemoryAnalyticsStore {
    async fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<AnalyticsMetrics> {
        let stored = self.events.read().await;
        let in_window = stored
            .iter()
            .filter(|event| event.timestamp >= start && event.timestamp <= end);
        Ok(aggregate(in_window, &self.route_paths))
    }
}
