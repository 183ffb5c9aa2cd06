//! The core plugs assembled into every provider's pipelines.
//!
//! Each plug is one pipeline step over the [`Request`] value. Compiled
//! options are plug struct fields, built once when pipelines are assembled
//! at provider registration.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::breaker::breaker_for;
use crate::cache::{self, CacheKey, CacheStrategy, MemoryCache};
use crate::config::{
    self, ProviderConfig, DEFAULT_STREAM_TIMEOUT, DEFAULT_SYNC_TIMEOUT,
};
use crate::context;
use crate::error::{Error, Result};
use crate::http::{BackoffConfig, HttpTransport};
use crate::pipeline::{Pipeline, Plug};
use crate::providers::{self, Operation};
use crate::request::{Request, RequestState};
use crate::stream::{ExecuteStreamRequest, StreamCoordinator};

/// The process-wide default response cache.
pub fn shared_cache() -> Arc<dyn CacheStrategy> {
    static CACHE: OnceLock<Arc<MemoryCache>> = OnceLock::new();
    CACHE.get_or_init(|| Arc::new(MemoryCache::default())).clone()
}

/// The standard pipeline set installed on every provider.
pub fn standard_pipelines() -> HashMap<Operation, Pipeline> {
    let cache = shared_cache();
    let mut pipelines = HashMap::new();
    pipelines.insert(
        Operation::Chat,
        Pipeline::new(vec![
            Arc::new(ValidateProvider),
            Arc::new(FetchConfig),
            Arc::new(ManageContext),
            Arc::new(CacheLookup::new(cache.clone())),
            Arc::new(BuildHttpClient),
            Arc::new(PrepareRequest),
            Arc::new(ExecuteRequest),
            Arc::new(ParseResponse),
            Arc::new(TrackCost),
            Arc::new(CacheStore::new(cache)),
        ]),
    );
    pipelines.insert(
        Operation::Stream,
        Pipeline::new(vec![
            Arc::new(ValidateProvider),
            Arc::new(FetchConfig),
            Arc::new(ManageContext),
            Arc::new(BuildHttpClient),
            Arc::new(PrepareRequest),
            Arc::new(StreamCoordinator),
            Arc::new(ExecuteStreamRequest),
        ]),
    );
    pipelines.insert(
        Operation::Embeddings,
        Pipeline::new(vec![
            Arc::new(ValidateProvider),
            Arc::new(FetchConfig),
            Arc::new(BuildHttpClient),
            Arc::new(PrepareRequest),
            Arc::new(ExecuteRequest),
            Arc::new(ParseResponse),
        ]),
    );
    pipelines.insert(
        Operation::ListModels,
        Pipeline::new(vec![
            Arc::new(ValidateProvider),
            Arc::new(FetchConfig),
            Arc::new(BuildHttpClient),
            Arc::new(ExecuteRequest),
            Arc::new(ParseResponse),
        ]),
    );
    pipelines
}

/// Asserts the provider exists in the registry and the options are sane.
pub struct ValidateProvider;

#[async_trait]
impl Plug for ValidateProvider {
    fn name(&self) -> &'static str {
        "validate_provider"
    }

    async fn call(&self, req: Request) -> Result<Request> {
        if providers::lookup(&req.provider).is_err() {
            let id = req.provider.as_str().to_string();
            return Ok(req.halt_with_error(self.name(), Error::UnsupportedProvider(id)));
        }
        if let Err(e) = req.options.validate() {
            return Ok(req.halt_with_error(self.name(), e));
        }
        Ok(req)
    }
}

/// Merges provider defaults, environment credentials, and per-call options
/// into the effective [`ProviderConfig`].
pub struct FetchConfig;

#[async_trait]
impl Plug for FetchConfig {
    fn name(&self) -> &'static str {
        "fetch_config"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        let provider = providers::lookup(&req.provider)?;
        let opts = &req.options;

        let api_key = opts
            .api_key
            .clone()
            .or_else(|| config::api_key_from_env(&req.provider));
        if provider.auth.requires_key() && api_key.is_none() {
            let id = req.provider.as_str().to_string();
            return Ok(req.halt_with_error(self.name(), Error::MissingApiKey(id)));
        }

        let base_url = opts
            .base_url
            .clone()
            .or_else(|| config::base_url_from_env(&req.provider))
            .unwrap_or_else(|| provider.default_base_url.clone());

        let timeout = match opts.timeout_ms {
            Some(ms) => std::time::Duration::from_millis(ms),
            None if req.operation == Operation::Stream => DEFAULT_STREAM_TIMEOUT,
            None => DEFAULT_SYNC_TIMEOUT,
        };

        req.config = Some(ProviderConfig {
            model: opts
                .model
                .clone()
                .unwrap_or_else(|| provider.default_model.clone()),
            base_url,
            api_key,
            organization: opts.organization.clone(),
            timeout,
            retry: opts
                .retry
                .as_ref()
                .map(|r| r.to_backoff())
                .unwrap_or_else(BackoffConfig::standard),
        });
        Ok(req)
    }
}

/// Trims the conversation to the configured context window.
pub struct ManageContext;

#[async_trait]
impl Plug for ManageContext {
    fn name(&self) -> &'static str {
        "manage_context"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        if let Some(ctx_opts) = req.options.context.clone() {
            req.messages = context::apply(req.messages, &ctx_opts);
        }
        Ok(req)
    }
}

fn cache_key(req: &Request) -> CacheKey {
    CacheKey {
        provider: req.provider.as_str().to_string(),
        endpoint: req.operation.as_str().to_string(),
        hash: cache::fingerprint(&req.provider, &req.messages, &req.options),
    }
}

/// Pre-execution cache probe. On a hit the request completes immediately
/// and the rest of the pipeline is skipped.
pub struct CacheLookup {
    cache: Arc<dyn CacheStrategy>,
}

impl CacheLookup {
    /// Create the plug over a cache backend.
    pub fn new(cache: Arc<dyn CacheStrategy>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Plug for CacheLookup {
    fn name(&self) -> &'static str {
        "cache_lookup"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        let enabled = req
            .options
            .cache
            .as_ref()
            .is_some_and(|c| c.enabled && req.operation == Operation::Chat);
        if !enabled {
            return Ok(req);
        }

        let key = cache_key(&req);
        if let Some(value) = self.cache.get(&key) {
            debug!(request = %req.id, hash = %key.hash, "cache hit");
            let result = serde_json::from_value(value)?;
            req = req.put_private("cache_hit", json!(true));
            return Ok(req.complete(result).halt());
        }

        Ok(req.put_private("cache_key", json!(key.hash)))
    }
}

/// Post-execution cache write, paired with [`CacheLookup`].
pub struct CacheStore {
    cache: Arc<dyn CacheStrategy>,
}

impl CacheStore {
    /// Create the plug over a cache backend.
    pub fn new(cache: Arc<dyn CacheStrategy>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Plug for CacheStore {
    fn name(&self) -> &'static str {
        "cache_store"
    }

    async fn call(&self, req: Request) -> Result<Request> {
        let Some(opts) = req.options.cache.clone() else {
            return Ok(req);
        };
        if !opts.enabled || req.operation != Operation::Chat {
            return Ok(req);
        }
        if req.private.contains_key("cache_hit") {
            return Ok(req);
        }
        let Some(result) = &req.result else {
            return Ok(req);
        };

        let key = cache_key(&req);
        self.cache.put(&key, serde_json::to_value(result)?, opts.ttl);
        Ok(req)
    }
}

/// Attaches the provider-bound HTTP transport.
pub struct BuildHttpClient;

#[async_trait]
impl Plug for BuildHttpClient {
    fn name(&self) -> &'static str {
        "build_http_client"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        let provider = providers::lookup(&req.provider)?;
        let config = req.config()?.clone();

        let transport = HttpTransport::new(
            config.base_url.clone(),
            provider.auth.clone(),
            config.api_key.clone(),
            config.organization.clone(),
            config.timeout,
            config.retry.clone(),
            breaker_for(req.provider.as_str()),
        )
        .with_extra_headers(provider.format.extra_headers());

        req.transport = Some(Arc::new(transport));
        Ok(req)
    }
}

/// Builds the provider-formatted request body.
pub struct PrepareRequest;

#[async_trait]
impl Plug for PrepareRequest {
    fn name(&self) -> &'static str {
        "prepare_request"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        let provider = providers::lookup(&req.provider)?;
        let body = match req.operation {
            Operation::Chat | Operation::Stream => provider.format.prepare(&req)?,
            Operation::Embeddings => provider.format.prepare_embeddings(&req)?,
            Operation::ListModels => Value::Null,
        };
        req.provider_request = Some(body);
        Ok(req)
    }
}

/// Executes the synchronous HTTP call.
pub struct ExecuteRequest;

#[async_trait]
impl Plug for ExecuteRequest {
    fn name(&self) -> &'static str {
        "execute_request"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        let provider = providers::lookup(&req.provider)?;
        let transport = req
            .transport
            .clone()
            .ok_or_else(|| Error::Exception("http client not built".into()))?;
        let model = req.config()?.model.clone();
        let path = provider.format.path(req.operation, &model);

        req.state = RequestState::Executing;

        let outcome = match req.operation {
            Operation::ListModels => transport.get_json(&path, &req.cancel).await,
            _ => {
                let body = req
                    .provider_request
                    .clone()
                    .ok_or_else(|| Error::Exception("request not prepared".into()))?;
                transport.post_json(&path, &body, &req.cancel).await
            }
        };

        match outcome {
            Ok(response) => {
                req.response = Some(response);
                Ok(req)
            }
            Err(Error::Server { status, body }) => {
                // Let the provider refine the generic mapping from its
                // error body shape.
                let refined = provider.format.map_error(status, &body);
                Ok(req.halt_with_error(self.name(), refined))
            }
            Err(e) => Ok(req.halt_with_error(self.name(), e)),
        }
    }
}

/// Parses the raw response into the operation's normalized result.
pub struct ParseResponse;

#[async_trait]
impl Plug for ParseResponse {
    fn name(&self) -> &'static str {
        "parse_response"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        let provider = providers::lookup(&req.provider)?;
        let response = req
            .response
            .clone()
            .ok_or_else(|| Error::Exception("no response to parse".into()))?;

        match req.operation {
            Operation::Chat | Operation::Stream => {
                let result = provider.format.parse(&req, &response)?;
                req.metadata.tokens = result.usage;
                req = req.complete(result);
            }
            Operation::Embeddings => {
                let result = provider.format.parse_embeddings(&response)?;
                req.metadata.tokens = result.usage;
                req.embeddings = Some(result);
                req.state = RequestState::Completed;
            }
            Operation::ListModels => {
                req.models = Some(provider.format.parse_models(&response)?);
                req.state = RequestState::Completed;
            }
        }
        Ok(req)
    }
}

/// Computes the request cost from usage and the model price table.
pub struct TrackCost;

#[async_trait]
impl Plug for TrackCost {
    fn name(&self) -> &'static str {
        "track_cost"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        let Some(result) = req.result.as_mut() else {
            return Ok(req);
        };
        let Some(usage) = result.usage else {
            return Ok(req);
        };
        if let Some(cost) = crate::cost::compute(&result.model, &usage) {
            req.metadata.cost_cents = Some(cost.total * 100.0);
            result.cost = Some(cost);
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderId;
    use crate::types::Message;

    fn chat_request(provider: ProviderId) -> Request {
        Request::new(provider, Operation::Chat, vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_provider() {
        let req = chat_request(ProviderId::Custom("bogus-chat".into()));
        let out = ValidateProvider.call(req).await.expect("plug");
        assert!(out.halted);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].plug, "validate_provider");
        assert_eq!(out.errors[0].kind(), "unsupported_provider");
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_temperature() {
        let mut req = chat_request(ProviderId::Mock);
        req.options.temperature = Some(5.0);
        let out = ValidateProvider.call(req).await.expect("plug");
        assert_eq!(out.errors[0].kind(), "invalid_request");
    }

    #[tokio::test]
    async fn test_fetch_config_uses_provider_defaults() {
        let req = chat_request(ProviderId::Mock);
        let out = FetchConfig.call(req).await.expect("plug");
        let config = out.config.expect("config");
        assert_eq!(config.model, "mock-echo-1");
        assert_eq!(config.timeout, DEFAULT_SYNC_TIMEOUT);
    }

    #[tokio::test]
    async fn test_fetch_config_options_win() {
        let mut req = chat_request(ProviderId::Mock);
        req.options = req
            .options
            .with_model("custom-model")
            .with_base_url("http://elsewhere:9999");
        req.options.timeout_ms = Some(5_000);

        let out = FetchConfig.call(req).await.expect("plug");
        let config = out.config.expect("config");
        assert_eq!(config.model, "custom-model");
        assert_eq!(config.base_url, "http://elsewhere:9999");
        assert_eq!(config.timeout, std::time::Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_fetch_config_missing_api_key_halts() {
        // Bearer-auth provider; custom ids never consult the environment,
        // so the missing key is guaranteed.
        let mut req = chat_request(ProviderId::Custom("keyed".into()));
        providers::register(crate::providers::Provider::new(
            ProviderId::Custom("keyed".into()),
            "https://keyed.example.com",
            crate::http::AuthScheme::Bearer,
            "keyed-1",
            Arc::new(crate::providers::openai::OpenAiFormat::new()),
        ));
        req.options.api_key = None;

        let out = FetchConfig.call(req).await.expect("plug");
        assert!(out.halted);
        assert_eq!(out.errors[0].kind(), "missing_api_key");
    }

    #[tokio::test]
    async fn test_stream_timeout_default_differs() {
        let mut req = chat_request(ProviderId::Mock);
        req.operation = Operation::Stream;
        let out = FetchConfig.call(req).await.expect("plug");
        assert_eq!(out.config.expect("config").timeout, DEFAULT_STREAM_TIMEOUT);
    }

    #[tokio::test]
    async fn test_cache_roundtrip_through_plugs() {
        let cache: Arc<dyn CacheStrategy> = Arc::new(MemoryCache::new(16));
        let lookup = CacheLookup::new(cache.clone());
        let store = CacheStore::new(cache);

        let mut req = chat_request(ProviderId::Mock);
        req.options.cache = Some(crate::cache::CacheOptions {
            enabled: true,
            ttl: std::time::Duration::from_secs(60),
        });

        // Miss.
        let miss = lookup.call(req.clone()).await.expect("plug");
        assert!(!miss.halted);
        assert!(miss.private.contains_key("cache_key"));

        // Simulate a completed request and store it.
        let completed = miss.complete(crate::types::NormalizedResponse {
            content: Some("pong".into()),
            model: "mock-echo-1".into(),
            finish_reason: None,
            usage: None,
            cost: None,
            tool_calls: None,
            raw: Value::Null,
        });
        store.call(completed).await.expect("plug");

        // Second identical request hits and completes without executing.
        let hit = lookup.call(req).await.expect("plug");
        assert!(hit.halted);
        assert_eq!(hit.state, RequestState::Completed);
        assert_eq!(hit.result.expect("result").content.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_cache_disabled_is_passthrough() {
        let lookup = CacheLookup::new(shared_cache());
        let req = chat_request(ProviderId::Mock);
        let out = lookup.call(req).await.expect("plug");
        assert!(!out.halted);
        assert!(!out.private.contains_key("cache_key"));
    }

    #[tokio::test]
    async fn test_track_cost_sets_cents() {
        let mut req = chat_request(ProviderId::Mock);
        req = req.complete(crate::types::NormalizedResponse {
            content: Some("hi".into()),
            model: "gpt-4o".into(),
            finish_reason: None,
            usage: Some(crate::types::Usage::new(1_000_000, 0)),
            cost: None,
            tool_calls: None,
            raw: Value::Null,
        });

        let out = TrackCost.call(req).await.expect("plug");
        // 1M input tokens of gpt-4o = $2.50 = 250 cents.
        let cents = out.metadata.cost_cents.expect("cost");
        assert!((cents - 250.0).abs() < 1e-6);
        assert!(out.result.expect("result").cost.is_some());
    }

    #[tokio::test]
    async fn test_track_cost_unpriced_model_noop() {
        let mut req = chat_request(ProviderId::Mock);
        req = req.complete(crate::types::NormalizedResponse {
            content: Some("hi".into()),
            model: "mock-echo-1".into(),
            finish_reason: None,
            usage: Some(crate::types::Usage::new(10, 10)),
            cost: None,
            tool_calls: None,
            raw: Value::Null,
        });
        let out = TrackCost.call(req).await.expect("plug");
        assert!(out.metadata.cost_cents.is_none());
    }

    #[tokio::test]
    async fn test_manage_context_trims() {
        let mut req = Request::new(
            ProviderId::Mock,
            Operation::Chat,
            (0..50)
                .map(|i| Message::user(format!("message {} {}", i, "x".repeat(400))))
                .collect(),
        );
        req.options.context = Some(crate::context::ContextOptions::new(
            crate::context::ContextStrategy::SlidingWindow,
            1000,
        ));

        let out = ManageContext.call(req).await.expect("plug");
        assert!(out.messages.len() < 50);
    }
}
