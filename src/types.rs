use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(format!("job_{}", Uuid::new_v4().simple()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        prefix_chars(&self.0, 8)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Safely returns a prefix of the string with at most `max_chars` characters.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Which transport produced (or is about to produce) a response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetchPath {
    Relay,
    Direct,
}

impl FetchPath {
    pub fn other(self) -> Self {
        match self {
            FetchPath::Relay => FetchPath::Direct,
            FetchPath::Direct => FetchPath::Relay,
        }
    }
}

impl fmt::Display for FetchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchPath::Relay => write!(f, "relay"),
            FetchPath::Direct => write!(f, "direct"),
        }
    }
}

/// A single backend call, immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest {
    pub method: String,
    pub url: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Upstream session token (encoded auth cookie value). Empty when none is configured.
    pub auth_token: String,
    #[serde(skip)]
    pub timeout: Duration,
}

impl StreamRequest {
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
        auth_token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            payload,
            auth_token: auth_token.into(),
            timeout,
        }
    }

    pub fn has_auth_token(&self) -> bool {
        !self.auth_token.trim().is_empty()
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded for key '{key}' (retry after {retry_after_secs}s)")]
    RateLimited { key: String, retry_after_secs: u64 },

    #[error("Relay pickup timed out after {0:?}")]
    PickupTimeout(Duration),

    #[error("No status within {0:?}")]
    StatusTimeout(Duration),

    #[error("Relay failed: {0}")]
    RelayFailed(String),

    #[error("Page closed: {0}")]
    PageClosed(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(StatusCode, String),

    #[error("All paths failed ({first}; {second})")]
    AllPathsFailed { first: String, second: String },

    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl BridgeError {
    pub fn internal(msg: impl Into<String>) -> Self {
        BridgeError::Internal(msg.into(), SpanTrace::capture())
    }

    /// Failures the arbiter recovers from by trying the other path.
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::PickupTimeout(_) | BridgeError::StatusTimeout(_)
        )
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::RelayFailed(_)
                | BridgeError::PageClosed(_)
                | BridgeError::Browser(_)
                | BridgeError::Network(_)
                | BridgeError::WebSocket(_)
                | BridgeError::Protocol(_)
        )
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: BridgeError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<BridgeError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let mut retry_after = None;
        let (status, code) = match &self.inner {
            BridgeError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            BridgeError::RateLimited {
                retry_after_secs, ..
            } => {
                retry_after = Some(*retry_after_secs);
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED")
            }
            BridgeError::Upstream(s, _) => (*s, "UPSTREAM_ERROR"),
            BridgeError::PickupTimeout(_)
            | BridgeError::StatusTimeout(_)
            | BridgeError::RequestTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            BridgeError::AllPathsFailed { .. } => (StatusCode::BAD_GATEWAY, "ALL_PATHS_FAILED"),
            BridgeError::RelayFailed(_)
            | BridgeError::PageClosed(_)
            | BridgeError::Browser(_)
            | BridgeError::Network(_)
            | BridgeError::WebSocket(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
            BridgeError::Protocol(_) => (StatusCode::BAD_REQUEST, "PROTOCOL_ERROR"),
            BridgeError::Serialization(_) => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
            BridgeError::Config(_) | BridgeError::Io(_) | BridgeError::Internal(_, _) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        let body = axum::Json(serde_json::json!({
            "error": {
                "message": self.inner.to_string(),
                "code": code,
            },
            "span_trace": self.span_trace.to_string(),
        }));
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_failures_are_classified() {
        assert!(BridgeError::PickupTimeout(Duration::from_secs(1)).is_routing_failure());
        assert!(BridgeError::StatusTimeout(Duration::from_secs(1)).is_routing_failure());
        assert!(!BridgeError::PageClosed("gone".into()).is_routing_failure());
        assert!(BridgeError::PageClosed("gone".into()).is_transport_failure());
    }

    #[test]
    fn test_prefix_chars_respects_boundaries() {
        assert_eq!(prefix_chars("héllo", 2), "hé");
        assert_eq!(prefix_chars("ab", 8), "ab");
    }

    #[test]
    fn test_fetch_path_other() {
        assert_eq!(FetchPath::Relay.other(), FetchPath::Direct);
        assert_eq!(FetchPath::Direct.other(), FetchPath::Relay);
    }
}
