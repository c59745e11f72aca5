//! Error taxonomy for the request-serving pipeline
use thiserror::Error;

/// Errors produced while serving a request.
///
/// Cache and analytics failures are absorbed where they happen and never
/// reach a caller. Store errors surface only as a generic 500 body.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("route not found for path '{0}'")]
    RouteNotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("rate limit of {limit} requests per minute exceeded")]
    RateLimitExceeded { limit: u32 },

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("rate limiter unavailable: {0}")]
    RateLimitUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("analytics write failed: {0}")]
    AnalyticsWriteFailure(String),

    #[error("backing store error: {0}")]
    Store(String),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request not served within {0:?}")]
    Timeout(std::time::Duration),
}

impl GatewayError {
    /// HTTP status code presented to the caller
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::RouteNotFound(_) => 404,
            GatewayError::BackendUnavailable(_) => 502,
            GatewayError::RateLimitExceeded { .. } => 429,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::PayloadTooLarge { .. } => 413,
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::Timeout(_) => 504,
            GatewayError::RateLimitUnavailable(_)
            | GatewayError::CacheUnavailable(_)
            | GatewayError::AnalyticsWriteFailure(_)
            | GatewayError::Store(_) => 500,
        }
    }

    /// Message placed in the JSON error body. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::RouteNotFound(_) => "route not found".to_string(),
            GatewayError::BackendUnavailable(_) => "backend request failed".to_string(),
            GatewayError::RateLimitExceeded { .. } => "rate limit exceeded".to_string(),
            GatewayError::Unauthorized(reason) => (*reason).to_string(),
            GatewayError::PayloadTooLarge { .. } => "request body too large".to_string(),
            GatewayError::InvalidRequest(reason) => reason.clone(),
            GatewayError::Timeout(_) => "request timed out".to_string(),
            GatewayError::RateLimitUnavailable(_) => "rate limit check failed".to_string(),
            GatewayError::CacheUnavailable(_)
            | GatewayError::AnalyticsWriteFailure(_)
            | GatewayError::Store(_) => "internal error".to_string(),
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::CacheUnavailable(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for GatewayError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        GatewayError::CacheUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Store(err.to_string())
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
