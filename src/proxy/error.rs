//! Failure kinds and their client-facing rendering.

use axum::http::StatusCode;
use thiserror::Error;

/// Failure kinds surfaced by the request lifecycle engine.
///
/// The `Display` text is the client response body.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The concurrency ceiling was reached before admission.
    #[error("Proxy overloaded: too many requests in flight")]
    Overloaded,

    /// Neither the request nor the startup configuration carried a token.
    #[error("Service-Token header missing")]
    MissingToken,

    /// The upstream call outlived the call timeout.
    #[error("Upstream call timed out")]
    Timeout,

    /// DNS, connect, or protocol failure on the upstream call.
    #[error("Upstream request failed: {0}")]
    Upstream(String),
}

impl ProxyError {
    /// Status code for the client response.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::MissingToken | ProxyError::Upstream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether a datapoint is still scheduled for this failure.
    ///
    /// A missing token leaves nothing to attribute the datapoint to.
    pub fn emits_datapoint(&self) -> bool {
        !matches!(self, ProxyError::MissingToken)
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Overloaded => "Overloaded",
            ProxyError::MissingToken => "MissingToken",
            ProxyError::Timeout => "Timeout",
            ProxyError::Upstream(_) => "UpstreamError",
        }
    }
}
