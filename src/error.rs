use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
///
/// Every failure surfaced to a caller carries one of these tagged kinds.
/// Provider-specific error bodies are mapped into this taxonomy by each
/// provider format; unknown shapes fall back to [`Error::Server`] with the
/// raw body preserved.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The requested provider id is not present in the registry.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// The provider requires an API key and none was found in the options,
    /// application config, or environment.
    #[error("missing API key for provider: {0}")]
    MissingApiKey(String),

    /// The request was rejected before or by the provider as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The provider rejected the credentials (401/403).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The provider rate-limited the request (429).
    #[error("rate limited")]
    RateLimited {
        /// Parsed `Retry-After` hint, if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// Account quota or billing limit exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The prompt exceeds the model's context window.
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),

    /// The provider's content policy blocked the request or response.
    #[error("content filtered: {0}")]
    ContentFilter(String),

    /// Provider-side failure (5xx or unrecognized error body).
    #[error("server error (HTTP {status}): {body}")]
    Server {
        /// HTTP status code (e.g. 500, 502).
        status: u16,
        /// Raw response body text.
        body: String,
    },

    /// The request or stream exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// Low-level transport failure (connection refused, DNS, socket close).
    #[error("network error: {0}")]
    Network(String),

    /// A stream ended mid-flight and recovery was exhausted or not possible.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    /// The provider's circuit breaker is open; the call was not attempted.
    #[error("circuit open for provider: {0}")]
    CircuitOpen(String),

    /// The provider's bulkhead rejected the call (too many concurrent calls).
    #[error("bulkhead full for provider: {0}")]
    BulkheadFull(String),

    /// The call was cancelled via its cancellation signal.
    #[error("cancelled")]
    Cancelled,

    /// The stream id passed to `cancel_stream` is unknown.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Catch-all for unexpected failures inside a plug.
    #[error("{0}")]
    Exception(String),
}

impl Error {
    /// Stable snake_case tag for the error kind, used in error entries,
    /// logs, and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnsupportedProvider(_) => "unsupported_provider",
            Error::MissingApiKey(_) => "missing_api_key",
            Error::InvalidRequest(_) => "invalid_request",
            Error::AuthenticationFailed(_) => "authentication_failed",
            Error::RateLimited { .. } => "rate_limited",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::ContextLengthExceeded(_) => "context_length_exceeded",
            Error::ContentFilter(_) => "content_filter",
            Error::Server { .. } => "server_error",
            Error::Timeout => "timeout",
            Error::Network(_) => "network_error",
            Error::StreamInterrupted(_) => "stream_interrupted",
            Error::CircuitOpen(_) => "circuit_open",
            Error::BulkheadFull(_) => "bulkhead_full",
            Error::Cancelled => "cancelled",
            Error::StreamNotFound(_) => "stream_not_found",
            Error::Exception(_) => "exception",
        }
    }

    /// Whether the transport retry layer may re-issue the request.
    ///
    /// Retryable: 429, retryable 5xx, and transport-level failures. Timeouts
    /// are retryable for sync calls (streams route through recovery instead).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. } | Error::Network(_) | Error::Timeout => true,
            Error::Server { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Whether stream recovery may attempt a resume after this error.
    ///
    /// Connection loss and timeouts are recoverable; authentication,
    /// 4xx (except 408/429), and content-policy failures are not.
    pub fn is_recoverable_stream_error(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout => true,
            Error::RateLimited { .. } => true,
            Error::StreamInterrupted(_) => true,
            Error::Server { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    /// The `Retry-After` hint carried by a rate-limit error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidRequest(format!("JSON error: {}", err))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Exception(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_stable() {
        assert_eq!(
            Error::UnsupportedProvider("x".into()).kind(),
            "unsupported_provider"
        );
        assert_eq!(Error::Timeout.kind(), "timeout");
        assert_eq!(
            Error::RateLimited { retry_after: None }.kind(),
            "rate_limited"
        );
        assert_eq!(Error::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(Error::Server {
            status: 500,
            body: String::new()
        }
        .is_retryable());
        assert!(Error::Server {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::Server {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(Error::RateLimited { retry_after: None }.is_retryable());
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::AuthenticationFailed("bad key".into()).is_retryable());
    }

    #[test]
    fn test_stream_recovery_classification() {
        assert!(Error::Network("connection closed".into()).is_recoverable_stream_error());
        assert!(Error::Timeout.is_recoverable_stream_error());
        assert!(Error::Server {
            status: 408,
            body: String::new()
        }
        .is_recoverable_stream_error());
        assert!(!Error::AuthenticationFailed("x".into()).is_recoverable_stream_error());
        assert!(!Error::ContentFilter("x".into()).is_recoverable_stream_error());
        assert!(!Error::InvalidRequest("x".into()).is_recoverable_stream_error());
    }

    #[test]
    fn test_retry_after_accessor() {
        let err = Error::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(Error::Timeout.retry_after(), None);
    }
}
