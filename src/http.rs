//! HTTP transport composed per provider.
//!
//! A [`HttpTransport`] bundles the shared connection pool, base URL, auth
//! scheme, per-request timeout, transport retry, and the provider's circuit
//! breaker. Retry state and the breaker are shared across concurrent
//! requests to the same provider; the underlying `reqwest::Client` is a
//! process-wide singleton so connection pooling spans transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{Error, Result};
use crate::request::ProviderResponse;

/// How credentials are attached to outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>` (OpenAI family).
    Bearer,
    /// A named header carrying the key verbatim (Anthropic: `x-api-key`).
    ApiKeyHeader(&'static str),
    /// A query parameter carrying the key (Gemini: `key`).
    QueryParam(&'static str),
    /// No authentication (Ollama, LM Studio, mock).
    None,
}

impl AuthScheme {
    /// Whether this scheme needs an API key at all.
    pub fn requires_key(&self) -> bool {
        !matches!(self, AuthScheme::None)
    }
}

/// Jitter strategy to prevent thundering herd on shared rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// No jitter. Delay is exactly the calculated value.
    None,
    /// Full jitter: random value in `[0, calculated_delay]`.
    Full,
    /// Equal jitter: `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

/// Configuration for transport-level retry with exponential backoff.
///
/// Retryability is decided by [`Error::is_retryable`]: 429, retryable 5xx,
/// and transport failures. `Retry-After` hints from the provider take
/// precedence over the computed delay when present.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of transport retries.
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub multiplier: f64,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    /// Whether to respect `Retry-After` headers from the provider.
    pub respect_retry_after: bool,
}

impl BackoffConfig {
    /// No transport retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Defaults for cloud APIs: 3 retries, 1 s initial, 2x multiplier,
    /// 60 s cap, full jitter, respects Retry-After.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            respect_retry_after: true,
        }
    }

    /// The delay before retry N (0-indexed), with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(jittered)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// The shared connection pool. Built without a default timeout; deadlines
/// are applied per request so sync and stream calls can differ.
fn shared_client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new())
    })
}

/// Map an HTTP error status to the generic error taxonomy.
///
/// Provider formats refine this mapping with body-aware rules; this is the
/// transport-level fallback.
pub fn status_to_error(status: u16, body: String, retry_after: Option<Duration>) -> Error {
    match status {
        401 | 403 => Error::AuthenticationFailed(body),
        408 => Error::Timeout,
        429 => Error::RateLimited { retry_after },
        400 | 404 | 409 | 410 | 422 => Error::InvalidRequest(body),
        _ => Error::Server { status, body },
    }
}

/// Parse a `Retry-After` header value (integer seconds form).
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// A provider-bound HTTP transport.
pub struct HttpTransport {
    base_url: String,
    auth: AuthScheme,
    api_key: Option<String>,
    organization: Option<String>,
    timeout: Duration,
    retry: BackoffConfig,
    breaker: Arc<CircuitBreaker>,
    extra_headers: Vec<(&'static str, String)>,
}

impl HttpTransport {
    /// Compose a transport.
    pub fn new(
        base_url: impl Into<String>,
        auth: AuthScheme,
        api_key: Option<String>,
        organization: Option<String>,
        timeout: Duration,
        retry: BackoffConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            api_key,
            organization,
            timeout,
            retry,
            breaker,
            extra_headers: Vec::new(),
        }
    }

    /// Attach provider-mandated standing headers (e.g. API version pins).
    pub fn with_extra_headers(mut self, headers: Vec<(&'static str, String)>) -> Self {
        self.extra_headers = headers;
        self
    }

    /// The transport's base URL (no trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Apply the auth scheme and standing headers to a request.
    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.auth, &self.api_key) {
            (AuthScheme::Bearer, Some(key)) => {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
            (AuthScheme::ApiKeyHeader(header), Some(key)) => {
                req = req.header(*header, key.as_str());
            }
            (AuthScheme::QueryParam(param), Some(key)) => {
                req = req.query(&[(*param, key.as_str())]);
            }
            _ => {}
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }
        for (name, value) in &self.extra_headers {
            req = req.header(*name, value.as_str());
        }
        req
    }

    /// POST a JSON body and parse the JSON response, with retry and the
    /// provider breaker applied per attempt.
    ///
    /// Non-success statuses are mapped through [`status_to_error`]; callers
    /// holding a provider format may refine the mapping afterwards.
    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        cancel: &AtomicBool,
    ) -> Result<ProviderResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.retry.max_retries {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }

            if attempt > 0 {
                let delay = match last_error.as_ref().and_then(Error::retry_after) {
                    Some(hint) if self.retry.respect_retry_after => hint,
                    _ => self.retry.delay_for_attempt(attempt - 1),
                };
                debug!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                tokio::time::sleep(delay).await;
                if cancel.load(Ordering::Relaxed) {
                    return Err(Error::Cancelled);
                }
            }

            let result = self
                .breaker
                .call(|| async { self.send_once(&url, body).await })
                .await;

            match result {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt < self.retry.max_retries && e.is_retryable() {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::Exception("retry loop exited unexpectedly".into())))
    }

    async fn send_once(&self, url: &str, body: &Value) -> Result<ProviderResponse> {
        let resp = self
            .apply_auth(shared_client().post(url))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            warn!(url = %url, status, "provider returned error status");
            return Err(status_to_error(status, text, retry_after));
        }

        let parsed: Value = resp.json().await?;
        Ok(ProviderResponse {
            status,
            body: parsed,
        })
    }

    /// GET a JSON endpoint (model listings). Same retry/breaker semantics
    /// as [`Self::post_json`].
    pub async fn get_json(&self, path: &str, cancel: &AtomicBool) -> Result<ProviderResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.retry.max_retries {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            if attempt > 0 {
                let delay = match last_error.as_ref().and_then(Error::retry_after) {
                    Some(hint) if self.retry.respect_retry_after => hint,
                    _ => self.retry.delay_for_attempt(attempt - 1),
                };
                tokio::time::sleep(delay).await;
            }

            let result = self
                .breaker
                .call(|| async {
                    let resp = self
                        .apply_auth(shared_client().get(&url))
                        .timeout(self.timeout)
                        .send()
                        .await?;
                    let status = resp.status().as_u16();
                    if !resp.status().is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        return Err(status_to_error(status, text, None));
                    }
                    let parsed: Value = resp.json().await?;
                    Ok(ProviderResponse {
                        status,
                        body: parsed,
                    })
                })
                .await;

            match result {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt < self.retry.max_retries && e.is_retryable() {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::Exception("retry loop exited unexpectedly".into())))
    }

    /// POST a JSON body and return the open streaming response.
    ///
    /// Sets `Accept: text/event-stream`. Callers consume the body with
    /// `bytes_stream()`. No transport retry: mid-stream failures are the
    /// recovery subsystem's concern. The connection attempt still flows
    /// through the provider breaker.
    pub async fn post_stream(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);

        self.breaker
            .call(|| async {
                let resp = self
                    .apply_auth(shared_client().post(&url))
                    .timeout(self.timeout)
                    .header("Accept", "text/event-stream")
                    .json(body)
                    .send()
                    .await?;

                let status = resp.status().as_u16();
                if !resp.status().is_success() {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    let text = resp.text().await.unwrap_or_default();
                    return Err(status_to_error(status, text, retry_after));
                }
                Ok(resp)
            })
            .await
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    if k.len() > 6 {
                        format!("{}***", &k[..6])
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_exponential() {
        let config = BackoffConfig {
            jitter: JitterStrategy::None,
            ..BackoffConfig::standard()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_delay_capped() {
        let config = BackoffConfig {
            jitter: JitterStrategy::None,
            max_delay: Duration::from_secs(5),
            ..BackoffConfig::standard()
        };
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_full_jitter_in_range() {
        let config = BackoffConfig::standard();
        for _ in 0..100 {
            let d = config.delay_for_attempt(1);
            assert!(d <= Duration::from_secs(2), "delay {:?} > 2s", d);
        }
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_to_error(401, String::new(), None),
            Error::AuthenticationFailed(_)
        ));
        assert!(matches!(
            status_to_error(429, String::new(), Some(Duration::from_secs(2))),
            Error::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert!(matches!(
            status_to_error(500, String::new(), None),
            Error::Server { status: 500, .. }
        ));
        assert!(matches!(
            status_to_error(400, String::new(), None),
            Error::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_auth_scheme_requirements() {
        assert!(AuthScheme::Bearer.requires_key());
        assert!(AuthScheme::ApiKeyHeader("x-api-key").requires_key());
        assert!(!AuthScheme::None.requires_key());
    }

    #[tokio::test]
    async fn test_transport_debug_redacts_key() {
        let transport = HttpTransport::new(
            "https://api.example.com/",
            AuthScheme::Bearer,
            Some("sk-1234567890".into()),
            None,
            Duration::from_secs(60),
            BackoffConfig::none(),
            crate::breaker::breaker_for("debug-test"),
        );
        let debug = format!("{:?}", transport);
        assert!(!debug.contains("1234567890"));
        assert!(debug.contains("sk-123"));
        // Trailing slash trimmed.
        assert_eq!(transport.base_url(), "https://api.example.com");
    }
}
