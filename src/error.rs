//! Error types for the caching proxy.
//!
//! Each variant maps to a terminal outcome of the request pipeline or to a
//! recoverable internal failure. Proxy-originated responses are produced by
//! the `IntoResponse` impl below; `Cache` errors are swallowed into misses
//! and no-ops before they ever reach it.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

/// Errors surfaced by the proxy core.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Missing or invalid proxy access key while security is enabled.
    #[error("invalid or missing secure key")]
    Auth,

    /// The first path segment does not name a configured domain alias.
    #[error("no upstream mapping for alias: {0}")]
    Routing(String),

    /// The domain is over its hourly budget or inside a cooldown window.
    #[error("domain {domain} is throttled, retry after {retry_after}s")]
    Throttled {
        /// Domain alias that tripped the throttle.
        domain: String,
        /// Remaining cooldown in seconds, floored at 1.
        retry_after: u64,
    },

    /// The upstream could not be reached (connect, timeout, protocol).
    #[error("upstream transport failure: {0}")]
    UpstreamTransport(String),

    /// A store-level failure. Fatal at startup, degrades the cache layer to
    /// pass-through at request time.
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization or compression failure inside the cache engine.
    /// Always recoverable: lookups degrade to misses, stores to no-ops.
    #[error("cache codec failure: {0}")]
    Cache(String),

    /// Invalid configuration detected at load time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProxyError {
    /// Client-facing status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Auth => StatusCode::UNAUTHORIZED,
            ProxyError::Routing(_) => StatusCode::NOT_FOUND,
            ProxyError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Storage(_) | ProxyError::Cache(_) | ProxyError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Proxy-originated statuses carry a short plain-text diagnostic body;
/// throttle rejections also carry `Retry-After`.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status_code(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("{self}\n"),
        )
            .into_response();
        if let ProxyError::Throttled { retry_after, .. } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
