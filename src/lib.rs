//! Apex - API Gateway library
//!
//! Apex fronts a set of HTTP backends behind a single entry point, built on
//! Cloudflare's Pingora framework:
//! - Route resolution with version-prefix fallback
//! - Round-robin backend selection
//! - Response caching in Redis or in memory
//! - Fixed-window rate limiting per API key
//! - Batched request analytics with aggregate queries
//! - Prometheus metrics collection

pub mod admin;
pub mod analytics;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod load_balancer;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod postgres;
pub mod rate_limit;
pub mod routes;

pub use config::Config;
pub use dispatcher::{Dispatcher, ProxyRequest, ProxyResponse};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{ApiGateway, RequestContext};
