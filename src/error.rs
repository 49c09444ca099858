use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use http_body_util::Full;
use serde_json::json;
use std::net::IpAddr;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Request blocked by filter rule '{pattern}'")]
    FilterDenied { pattern: String },

    #[error("Rate limit exceeded for client {client}")]
    RateLimited { client: IpAddr },

    #[error("Request backlog is full")]
    QueueFull,

    #[error("No backend available: {0}")]
    BackendUnreachable(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::FilterDenied { .. } => StatusCode::FORBIDDEN,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BackendUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Json(_) => StatusCode::BAD_REQUEST,
            ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_)
            | ProxyError::CacheUnavailable(_)
            | ProxyError::Redis(_)
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::FilterDenied { .. } => "FILTER_DENIED",
            ProxyError::RateLimited { .. } => "RATE_LIMITED",
            ProxyError::QueueFull => "QUEUE_FULL",
            ProxyError::BackendUnreachable(_) => "BACKEND_UNREACHABLE",
            ProxyError::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            ProxyError::MalformedRequest(_) => "MALFORMED_REQUEST",
            ProxyError::Timeout(_) => "TIMEOUT",
            ProxyError::Config(_) => "CONFIG_ERROR",
            ProxyError::Redis(_) => "REDIS_ERROR",
            ProxyError::Http(_) => "HTTP_ERROR",
            ProxyError::Json(_) => "JSON_ERROR",
            ProxyError::Io(_) => "IO_ERROR",
        }
    }

    /// Build the client-visible JSON error response.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let status = self.status_code();
        let body = json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        })
        .to_string();

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
