//! Core API Gateway implementation using Pingora
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, Method};
use log::{debug, info, warn};
use pingora_core::{
    server::{configuration::Opt, RunArgs, Server, ShutdownSignal, ShutdownSignalWatch},
    services::background::background_service,
    upstreams::peer::HttpPeer,
    ErrorType, Result as PingoraResult,
};
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    admin::AdminApi,
    analytics::{
        AnalyticsHandle, AnalyticsPipeline, AnalyticsQuery, AnalyticsService, AnalyticsSink,
        MemoryAnalyticsStore,
    },
    cache::{create_redis_pool, CacheStore, MemoryCacheStore, RedisCacheStore},
    catalog::{ApiKeyStore, CacheRuleStore, RouteStore, StaticCatalog},
    config::Config,
    dispatcher::{CacheStatus, Dispatcher, ProxyRequest, ProxyResponse},
    error::GatewayError,
    forwarder::HttpForwarder,
    metrics::MetricsCollector,
    middleware::{authorize_admin, client_ip, ApiKeyAuthenticator, CorsPolicy, RateLimitGuard},
    postgres::{create_pool, PgAnalyticsStore, PgCatalog},
    rate_limit::{MemoryRateLimiter, RateLimiter, RedisRateLimiter},
    routes::RouteResolver,
};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Longest caller-supplied request ID that is propagated
const MAX_REQUEST_ID_LEN: usize = 128;

/// Time reserved after the final analytics flush before the runtime stops
const FINAL_FLUSH_MARGIN: Duration = Duration::from_secs(5);

/// Request context that carries information throughout the request lifecycle
#[derive(Debug)]
pub struct RequestContext {
    /// Request start time
    pub start_time: Instant,
    /// Unique request ID for tracing
    pub request_id: String,
    /// Peer address of the downstream connection
    pub client_ip: Option<IpAddr>,
    /// Allowed CORS origin of the request
    pub origin: Option<String>,
    pub cache_status: Option<CacheStatus>,
    /// Client went away before the response was written
    pub disconnected: bool,
    /// Counted in the in-flight gauge
    counted: bool,
}

impl RequestContext {
    /// Create a new request context with a time-ordered request ID
    pub fn new(request_counter: u64) -> Self {
        let request_id = format!(
            "req-{:016x}-{:08x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            request_counter
        );

        Self {
            start_time: Instant::now(),
            request_id,
            client_ip: None,
            origin: None,
            cache_status: None,
            disconnected: false,
            counted: false,
        }
    }

    /// Get request duration
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Adopt the caller's `X-Request-ID` when it is usable
    fn adopt_request_id(&mut self, headers: &HeaderMap) {
        if let Some(id) = headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        {
            self.request_id = id.to_string();
        }
    }
}

/// Endpoints answered by the gateway itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Health,
    Info,
    Metrics,
    AdminMetrics,
    AdminRealtime,
    AdminStream,
    AdminInvalidate,
    AdminNotFound,
    Proxy,
}

fn classify(method: &Method, path: &str, metrics_path: Option<&str>) -> Endpoint {
    if path == "/admin" || path.starts_with("/admin/") {
        return match (method, path) {
            (&Method::GET, "/admin/analytics/metrics") => Endpoint::AdminMetrics,
            (&Method::GET, "/admin/analytics/realtime") => Endpoint::AdminRealtime,
            (&Method::GET, "/admin/analytics/stream") => Endpoint::AdminStream,
            (&Method::POST, "/admin/cache/invalidate") => Endpoint::AdminInvalidate,
            _ => Endpoint::AdminNotFound,
        };
    }
    if method != Method::GET {
        return Endpoint::Proxy;
    }
    match path {
        "/health" => Endpoint::Health,
        "/" => Endpoint::Info,
        p if Some(p) == metrics_path => Endpoint::Metrics,
        _ => Endpoint::Proxy,
    }
}

/// Completion log level by response status
fn completion_level(status_code: u16) -> log::Level {
    if status_code >= 500 {
        log::Level::Error
    } else if status_code >= 400 {
        log::Level::Warn
    } else {
        log::Level::Info
    }
}

/// API Gateway
pub struct ApiGateway {
    /// Configuration
    config: Arc<Config>,
    authenticator: ApiKeyAuthenticator,
    rate_limit: RateLimitGuard,
    dispatcher: Dispatcher,
    admin: AdminApi,
    cors: Option<CorsPolicy>,
    /// Metrics collector
    metrics_collector: Option<Arc<MetricsCollector>>,
    /// Consumer started with the server
    analytics_service: Option<AnalyticsService>,
    /// Request ID counter
    request_counter: AtomicU64,
}

impl ApiGateway {
    /// Connect the backing stores and assemble the request pipeline
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Validate configuration
        config.validate()?;

        let metrics_collector = if config.metrics.prometheus {
            Some(Arc::new(MetricsCollector::new()?))
        } else {
            None
        };

        // Catalog and analytics store
        let (routes, rules, keys, sink, query): (
            Arc<dyn RouteStore>,
            Arc<dyn CacheRuleStore>,
            Arc<dyn ApiKeyStore>,
            Arc<dyn AnalyticsSink>,
            Arc<dyn AnalyticsQuery>,
        ) = match &config.storage.database_url {
            Some(url) => {
                let pool = create_pool(url, &config.storage).await?;
                info!("Connected to Postgres catalog");
                let catalog = Arc::new(PgCatalog::new(pool.clone()));
                let analytics = Arc::new(PgAnalyticsStore::new(pool));
                (
                    catalog.clone(),
                    catalog.clone(),
                    catalog,
                    analytics.clone(),
                    analytics,
                )
            }
            None => {
                let catalog = Arc::new(StaticCatalog::from_config(&config));
                let route_paths: HashMap<i64, String> = config
                    .routes
                    .iter()
                    .map(|route| (route.id, route.path.clone()))
                    .collect();
                let analytics = Arc::new(MemoryAnalyticsStore::new(
                    config.analytics.memory_retention,
                    route_paths,
                ));
                info!(
                    "Using static catalog with {} routes and {} API keys",
                    config.routes.len(),
                    config.api_keys.len()
                );
                (
                    catalog.clone(),
                    catalog.clone(),
                    catalog,
                    analytics.clone(),
                    analytics,
                )
            }
        };

        // Cache store and rate limiter
        let prefix = config.rate_limiting.key_prefix.clone();
        let (cache, limiter): (Arc<dyn CacheStore>, Arc<dyn RateLimiter>) =
            match &config.storage.redis_url {
                Some(url) => {
                    let pool = create_redis_pool(url, config.storage.redis_pool_size)?;
                    let mut conn = pool.get().await.context("Failed to connect to Redis")?;
                    let _pong: String = redis::cmd("PING")
                        .query_async(&mut conn)
                        .await
                        .context("Redis did not answer PING")?;
                    drop(conn);
                    info!("Connected to Redis cache and rate limiter");
                    (
                        Arc::new(RedisCacheStore::new(pool.clone())),
                        Arc::new(RedisRateLimiter::new(pool, prefix)),
                    )
                }
                None => {
                    info!("Using in-memory cache and rate limiter");
                    (
                        Arc::new(MemoryCacheStore::new(
                            config.storage.memory_cache_max_entries,
                        )),
                        Arc::new(MemoryRateLimiter::new(prefix)),
                    )
                }
            };

        // Analytics intake and consumer
        let (analytics, receiver) =
            AnalyticsHandle::channel(config.analytics.buffer_capacity, metrics_collector.clone());
        let pipeline = AnalyticsPipeline::new(
            sink,
            config.analytics.batch_size,
            config.analytics.flush_interval,
            metrics_collector.clone(),
        );
        let analytics_service = AnalyticsService::new(
            pipeline,
            receiver,
            config
                .server
                .shutdown_grace_period
                .saturating_sub(FINAL_FLUSH_MARGIN),
        );

        let forwarder = Arc::new(HttpForwarder::new(&config.proxy)?);
        let dispatcher = Dispatcher::new(
            RouteResolver::new(routes),
            rules,
            cache.clone(),
            forwarder,
            analytics,
            metrics_collector.clone(),
        );

        Ok(Self {
            authenticator: ApiKeyAuthenticator::new(keys, metrics_collector.clone()),
            rate_limit: RateLimitGuard::new(
                limiter,
                config.rate_limiting.enabled,
                metrics_collector.clone(),
            ),
            dispatcher,
            admin: AdminApi::new(
                query,
                cache,
                config.analytics.realtime_window,
                config.analytics.default_window,
            ),
            cors: config.cors.clone().map(CorsPolicy::new),
            metrics_collector,
            analytics_service: Some(analytics_service),
            request_counter: AtomicU64::new(0),
            config,
        })
    }

    /// Start the API Gateway server
    pub fn run(mut self) -> Result<()> {
        info!("Starting API Gateway server");

        // Create Pingora server
        let opt = Opt::default();
        let mut server = Server::new(Some(opt))?;
        server.bootstrap();

        let grace = self.config.server.shutdown_grace_period.as_secs();
        match Arc::get_mut(&mut server.configuration) {
            Some(conf) => {
                conf.grace_period_seconds = Some(grace);
                conf.graceful_shutdown_timeout_seconds = Some(FINAL_FLUSH_MARGIN.as_secs());
            }
            None => warn!("Server configuration is shared; keeping default grace period"),
        }

        let http_addr = self.config.server.http_addr;
        let threads = self.config.server.threads;
        let analytics_service = self
            .analytics_service
            .take()
            .context("Analytics consumer already started")?;

        // Create proxy service
        let mut proxy_service = pingora_proxy::http_proxy_service(&server.configuration, self);
        proxy_service.threads = threads;
        proxy_service.add_tcp(&http_addr.to_string());
        info!("HTTP server listening on {}", http_addr);

        server.add_service(proxy_service);
        server.add_service(background_service("analytics", analytics_service));

        info!("Ready to proxy requests");

        #[cfg(unix)]
        let run_args = RunArgs {
            shutdown_signal: Box::new(ProcessSignals),
        };
        #[cfg(not(unix))]
        let run_args = RunArgs::default();

        // Blocks until a shutdown signal has been handled
        server.run(run_args);
        info!("API Gateway stopped");
        Ok(())
    }

    /// Read the request body, `None` when it exceeds `max_body_size`
    async fn read_body(&self, session: &mut Session) -> PingoraResult<Option<Bytes>> {
        let limit = self.config.server.max_body_size;
        let mut body = BytesMut::new();
        while let Some(chunk) = session.read_request_body().await? {
            if body.len() + chunk.len() > limit {
                return Ok(None);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Some(body.freeze()))
    }

    /// Common response headers: `X-Request-ID` and CORS
    fn decorate(&self, ctx: &RequestContext, response: &mut ResponseHeader) -> PingoraResult<()> {
        response.insert_header(X_REQUEST_ID, &ctx.request_id)?;
        if let (Some(cors), Some(origin)) = (&self.cors, &ctx.origin) {
            cors.apply(origin, response)?;
        }
        Ok(())
    }

    /// Write a buffered response
    async fn respond(
        &self,
        session: &mut Session,
        ctx: &mut RequestContext,
        response: ProxyResponse,
    ) -> PingoraResult<()> {
        let mut resp_header =
            ResponseHeader::build(response.status, Some(response.headers.len() + 4))?;
        for (name, value) in &response.headers {
            resp_header.append_header(name.clone(), value.clone())?;
        }
        resp_header.insert_header(header::CONTENT_LENGTH, response.body.len().to_string())?;
        self.decorate(ctx, &mut resp_header)?;

        if response.cache_status != CacheStatus::Bypass {
            ctx.cache_status = Some(response.cache_status);
        }
        let end_of_stream = response.body.is_empty();
        session
            .write_response_header(Box::new(resp_header), end_of_stream)
            .await?;
        if !end_of_stream {
            session
                .write_response_body(Some(response.body), true)
                .await?;
        }
        Ok(())
    }

    /// Push realtime aggregates as Server-Sent Events until the client goes away
    async fn stream_analytics(
        &self,
        session: &mut Session,
        ctx: &mut RequestContext,
    ) -> PingoraResult<()> {
        let mut resp_header = ResponseHeader::build(200, Some(6))?;
        resp_header.insert_header(header::CONTENT_TYPE, "text/event-stream")?;
        resp_header.insert_header(header::CACHE_CONTROL, "no-cache")?;
        resp_header.insert_header(header::TRANSFER_ENCODING, "chunked")?;
        self.decorate(ctx, &mut resp_header)?;
        session
            .write_response_header(Box::new(resp_header), false)
            .await?;

        let interval = self.config.analytics.stream_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let Some(frame) = self.admin.stream_frame().await else {
                continue;
            };
            if let Err(e) = session.write_response_body(Some(frame), false).await {
                debug!("Analytics stream {} closed: {}", ctx.request_id, e);
                ctx.disconnected = true;
                return Ok(());
            }
        }
    }

    async fn serve_admin(
        &self,
        endpoint: Endpoint,
        session: &mut Session,
        ctx: &mut RequestContext,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> PingoraResult<()> {
        if let Err(e) = authorize_admin(headers, self.config.admin.token.as_deref()) {
            if let Some(metrics) = &self.metrics_collector {
                metrics.record_auth_failure();
            }
            return self.respond(session, ctx, ProxyResponse::error(&e)).await;
        }

        let response = match endpoint {
            Endpoint::AdminMetrics => self.admin.metrics(query).await,
            Endpoint::AdminRealtime => self.admin.realtime().await,
            Endpoint::AdminStream => return self.stream_analytics(session, ctx).await,
            Endpoint::AdminInvalidate => match self.read_body(session).await? {
                Some(body) => self.admin.invalidate(&body).await,
                None => ProxyResponse::error(&GatewayError::PayloadTooLarge {
                    limit: self.config.server.max_body_size,
                }),
            },
            _ => ProxyResponse::json(404, &serde_json::json!({ "error": "not found" })),
        };
        self.respond(session, ctx, response).await
    }

    async fn serve_proxy(
        &self,
        session: &mut Session,
        ctx: &mut RequestContext,
        headers: HeaderMap,
        method: Method,
        path: String,
        query: Option<String>,
    ) -> PingoraResult<()> {
        let api_key = match self.authenticator.authenticate(&headers).await {
            Ok(key) => key,
            Err(e) => return self.respond(session, ctx, ProxyResponse::error(&e)).await,
        };

        if let Err(e) = self.rate_limit.check(&api_key).await {
            return self.respond(session, ctx, ProxyResponse::error(&e)).await;
        }

        let Some(body) = self.read_body(session).await? else {
            let e = GatewayError::PayloadTooLarge {
                limit: self.config.server.max_body_size,
            };
            return self.respond(session, ctx, ProxyResponse::error(&e)).await;
        };

        let request = ProxyRequest {
            method,
            path,
            query,
            client_ip: client_ip(&headers, ctx.client_ip),
            headers,
            body,
            api_key: Some(api_key),
        };

        let timeout = self.config.server.request_timeout;
        let dispatch = pingora_timeout::timeout(timeout, self.dispatcher.dispatch(&request));
        tokio::pin!(dispatch);

        // Dropping `dispatch` cancels the outbound call
        let mut watching = true;
        let outcome = loop {
            tokio::select! {
                result = &mut dispatch => break Some(result),
                idle = session.downstream_session.read_body_or_idle(true), if watching => {
                    match idle {
                        Err(e) if client_gone(e.etype()) => {
                            debug!("Client of {} went away: {}", ctx.request_id, e);
                            break None;
                        }
                        Err(e) => {
                            debug!("Ignoring client activity on {}: {}", ctx.request_id, e);
                            watching = false;
                        }
                        Ok(_) => watching = false,
                    }
                }
            }
        };

        match outcome {
            Some(Ok(response)) => self.respond(session, ctx, response).await,
            Some(Err(_)) => {
                warn!("Request {} timed out after {:?}", ctx.request_id, timeout);
                let e = GatewayError::Timeout(timeout);
                self.respond(session, ctx, ProxyResponse::error(&e)).await
            }
            None => {
                ctx.disconnected = true;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProxyHttp for ApiGateway {
    type CTX = RequestContext;

    /// Create a new request context
    fn new_ctx(&self) -> Self::CTX {
        let request_counter = self.request_counter.fetch_add(1, Ordering::Relaxed);
        RequestContext::new(request_counter)
    }

    /// Every request is answered here; nothing reaches `upstream_peer`
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<bool> {
        if let Some(metrics) = &self.metrics_collector {
            metrics.record_request();
            ctx.counted = true;
        }

        ctx.client_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|inet| inet.ip());

        let req = session.req_header();
        let headers = req.headers.clone();
        let method = req.method.clone();
        let path = req.uri.path().to_string();
        let query = req.uri.query().map(str::to_string);

        ctx.adopt_request_id(&headers);
        ctx.origin = self
            .cors
            .as_ref()
            .and_then(|cors| cors.allowed_origin(&headers))
            .map(str::to_string);

        debug!(
            "Processing request {} {} {} from {:?}",
            ctx.request_id, method, path, ctx.client_ip
        );

        // CORS preflight
        if method == Method::OPTIONS && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD) {
            if let (Some(cors), Some(origin)) = (&self.cors, &ctx.origin) {
                let mut response = cors.preflight_response(origin)?;
                response.insert_header(X_REQUEST_ID, &ctx.request_id)?;
                session.write_response_header(Box::new(response), true).await?;
                return Ok(true);
            }
        }

        let metrics_path = self
            .metrics_collector
            .as_ref()
            .map(|_| self.config.metrics.metrics_path.as_str());

        match classify(&method, &path, metrics_path) {
            Endpoint::Health => {
                let response = ProxyResponse::json(200, &serde_json::json!({ "status": "ok" }));
                self.respond(session, ctx, response).await?;
            }
            Endpoint::Info => {
                let response = ProxyResponse::json(
                    200,
                    &serde_json::json!({
                        "message": "Apex Gateway API",
                        "version": env!("CARGO_PKG_VERSION"),
                        "endpoints": { "health": "/health", "admin": "/admin/*" },
                    }),
                );
                self.respond(session, ctx, response).await?;
            }
            Endpoint::Metrics => {
                let response = match self.metrics_collector.as_ref().map(|m| m.export_metrics()) {
                    Some(Ok(text)) => {
                        ProxyResponse::with_body(200, "text/plain; version=0.0.4", text)
                    }
                    _ => ProxyResponse::json(
                        500,
                        &serde_json::json!({ "error": "failed to export metrics" }),
                    ),
                };
                self.respond(session, ctx, response).await?;
            }
            Endpoint::Proxy => {
                self.serve_proxy(session, ctx, headers, method, path, query)
                    .await?;
            }
            admin => {
                self.serve_admin(admin, session, ctx, &headers, query.as_deref())
                    .await?;
            }
        }

        Ok(true)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<Box<HttpPeer>> {
        warn!("Request {} reached upstream selection", ctx.request_id);
        Err(pingora_core::Error::new_str("Requests are answered in request_filter"))
    }

    /// Record metrics and log completion
    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let status_code = session
            .response_written()
            .map(|resp| resp.status.as_u16())
            .unwrap_or(0);

        let duration = ctx.duration();

        if ctx.counted {
            if let Some(metrics) = &self.metrics_collector {
                metrics.record_response(status_code, duration);
            }
        }

        if ctx.disconnected && status_code == 0 {
            info!(
                "Request {} abandoned by client: {} {} ({}ms)",
                ctx.request_id,
                session.req_header().method,
                session.req_header().uri.path(),
                duration.as_millis()
            );
        } else {
            log::log!(
                completion_level(status_code),
                "Request {} completed: {} {} -> {} ({}ms) [{}]",
                ctx.request_id,
                session.req_header().method,
                session.req_header().uri.path(),
                status_code,
                duration.as_millis(),
                ctx.cache_status.map(|c| c.as_str()).unwrap_or("-")
            );
        }

        if let Some(error) = e {
            warn!("Request {} encountered error: {}", ctx.request_id, error);
        }
    }
}

/// Errors from an idle downstream read that mean the client hung up.
/// Anything else, such as pipelined bytes after the body, leaves the request running.
fn client_gone(etype: &ErrorType) -> bool {
    matches!(etype, ErrorType::ConnectionClosed | ErrorType::ReadError)
}

/// Process signals the gateway reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Quit,
    Terminate,
    Interrupt,
}

/// SIGINT drains like SIGTERM so queued analytics get their final flush
fn shutdown_mode(signal: StopSignal) -> ShutdownSignal {
    match signal {
        StopSignal::Quit => ShutdownSignal::GracefulUpgrade,
        StopSignal::Terminate | StopSignal::Interrupt => ShutdownSignal::GracefulTerminate,
    }
}

#[cfg(unix)]
struct ProcessSignals;

#[cfg(unix)]
#[async_trait]
impl ShutdownSignalWatch for ProcessSignals {
    async fn recv(&self) -> ShutdownSignal {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = (
            signal(SignalKind::quit()),
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        );
        let (mut quit, mut terminate, mut interrupt) = match handlers {
            (Ok(quit), Ok(terminate), Ok(interrupt)) => (quit, terminate, interrupt),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                return std::future::pending().await;
            }
        };

        let received = tokio::select! {
            _ = quit.recv() => StopSignal::Quit,
            _ = terminate.recv() => StopSignal::Terminate,
            _ = interrupt.recv() => StopSignal::Interrupt,
        };
        info!("Received {:?}, shutting down", received);
        shutdown_mode(received)
    }
}
