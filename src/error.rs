//! Error types and plain-text error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::time::Duration;

/// Body type of every response the gateway produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No rendezvous record yet: the frontend tool is not running
    NotRunning,
    /// Upstream refused the connection
    UpstreamUnavailable,
    /// Upstream answered with something unusable or the exchange failed
    UpstreamError,
    /// Upstream did not answer within the request timeout
    UpstreamTimeout,
    /// Request could not be read or rebuilt
    BadRequest,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotRunning => "NOT_RUNNING",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Create a plain-text error response
pub fn error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Wrap bytes in the gateway body type
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Failure forwarding one HTTP request upstream
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream connection failed: {0}")]
    Connect(String),
    #[error("upstream exchange failed: {0}")]
    Upstream(String),
    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
    #[error("failed to read request body: {0}")]
    BodyRead(String),
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    /// Map a forwarding failure onto the response taxonomy
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ForwardError::Connect(_) => ProxyErrorCode::UpstreamUnavailable,
            ForwardError::Upstream(_) => ProxyErrorCode::UpstreamError,
            ForwardError::RequestBuild(_) | ForwardError::BodyRead(_) => ProxyErrorCode::BadRequest,
            ForwardError::Timeout(_) => ProxyErrorCode::UpstreamTimeout,
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        error_response(self.code(), self.to_string())
    }
}
