//! Provider registry and the per-provider format contract.
//!
//! A [`Provider`] bundles an id, connection defaults, an auth scheme, a
//! [`ProviderFormat`] (pure request/response translation), and a pipeline
//! per operation. The process-wide registry maps provider ids to providers;
//! the bundled set is installed lazily and user-supplied providers can be
//! added with [`register`].
//!
//! ```text
//! Request ──► format.prepare() ──► provider wire body
//! wire body ──► HTTP ──► format.parse() ──► NormalizedResponse
//! SSE frame payload ──► format.parse_chunk() ──► StreamChunk | done
//! ```

pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use mock::MockFormat;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::http::{status_to_error, AuthScheme};
use crate::pipeline::Pipeline;
use crate::request::{ProviderResponse, Request};
use crate::types::{
    EmbeddingResponse, Message, ModelInfo, NormalizedResponse, StreamChunk,
};

/// Identifier of a chat provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderId {
    /// api.openai.com
    OpenAi,
    /// api.anthropic.com
    Anthropic,
    /// generativelanguage.googleapis.com
    Gemini,
    /// api.groq.com (OpenAI-compatible)
    Groq,
    /// api.mistral.ai (OpenAI-compatible)
    Mistral,
    /// api.perplexity.ai (OpenAI-compatible)
    Perplexity,
    /// openrouter.ai (OpenAI-compatible)
    OpenRouter,
    /// api.x.ai (OpenAI-compatible)
    XAi,
    /// Local Ollama daemon (NDJSON streaming).
    Ollama,
    /// Local LM Studio server (OpenAI-compatible).
    LmStudio,
    /// Deterministic in-process provider for tests.
    Mock,
    /// A user-registered provider.
    Custom(String),
}

impl ProviderId {
    /// The provider's wire name, used in registry keys, cache paths, and
    /// error messages.
    pub fn as_str(&self) -> &str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Gemini => "gemini",
            ProviderId::Groq => "groq",
            ProviderId::Mistral => "mistral",
            ProviderId::Perplexity => "perplexity",
            ProviderId::OpenRouter => "openrouter",
            ProviderId::XAi => "xai",
            ProviderId::Ollama => "ollama",
            ProviderId::LmStudio => "lmstudio",
            ProviderId::Mock => "mock",
            ProviderId::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operations a provider can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Synchronous chat completion.
    Chat,
    /// Streaming chat completion.
    Stream,
    /// Embeddings.
    Embeddings,
    /// Model listing.
    ListModels,
}

impl Operation {
    /// Stable name used in cache paths and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Chat => "chat",
            Operation::Stream => "stream",
            Operation::Embeddings => "embeddings",
            Operation::ListModels => "list_models",
        }
    }
}

/// How a provider frames its streaming response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    /// `text/event-stream` events (OpenAI family, Anthropic, Gemini).
    Sse,
    /// Newline-delimited JSON (Ollama).
    Ndjson,
}

/// Result of parsing one streaming frame payload.
#[derive(Debug, Clone)]
pub enum ChunkParse {
    /// A chunk to deliver.
    Chunk(StreamChunk),
    /// The stream is complete.
    Done,
    /// A frame with nothing to deliver (keep-alives, pings).
    Skip,
    /// The frame was malformed; recorded and skipped.
    Error(String),
}

/// Pure translation between normalized types and one provider's wire API.
///
/// Implementations must be stateless: every method reads only its
/// arguments. Network access, retry, and buffering live elsewhere.
pub trait ProviderFormat: Send + Sync {
    /// Build the chat request body from messages, options, and config.
    ///
    /// The `stream` flag in the body must reflect `req.operation`.
    fn prepare(&self, req: &Request) -> Result<Value>;

    /// Build the embeddings request body.
    fn prepare_embeddings(&self, _req: &Request) -> Result<Value> {
        Err(Error::InvalidRequest(
            "provider does not support embeddings".into(),
        ))
    }

    /// Parse a chat response body into a [`NormalizedResponse`].
    fn parse(&self, req: &Request, resp: &ProviderResponse) -> Result<NormalizedResponse>;

    /// Parse an embeddings response body.
    fn parse_embeddings(&self, _resp: &ProviderResponse) -> Result<EmbeddingResponse> {
        Err(Error::InvalidRequest(
            "provider does not support embeddings".into(),
        ))
    }

    /// Parse a model-listing response body.
    fn parse_models(&self, _resp: &ProviderResponse) -> Result<Vec<ModelInfo>> {
        Err(Error::InvalidRequest(
            "provider does not support model listing".into(),
        ))
    }

    /// Parse one streaming frame payload.
    fn parse_chunk(&self, payload: &str) -> ChunkParse;

    /// Refine an HTTP error into the taxonomy using the provider's error
    /// body shape. The default is the generic status mapping.
    fn map_error(&self, status: u16, body: &str) -> Error {
        status_to_error(status, body.to_string(), None)
    }

    /// Rewrite the conversation to continue from a partial response.
    ///
    /// Used by stream recovery. The default appends the partial as an
    /// assistant turn followed by a user "continue" instruction.
    fn continuation(&self, messages: &[Message], partial: &str) -> Vec<Message> {
        let mut rewritten = messages.to_vec();
        rewritten.push(Message::assistant(partial));
        rewritten.push(Message::user(
            "Continue exactly where you left off, without repeating anything.",
        ));
        rewritten
    }

    /// The request path for an operation. `model` is interpolated for
    /// providers that put the model in the path (Gemini).
    fn path(&self, op: Operation, model: &str) -> String;

    /// Streaming body framing.
    fn framing(&self) -> StreamFraming {
        StreamFraming::Sse
    }

    /// Provider-mandated standing headers (API version pins and the like).
    fn extra_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// A registered provider: formats plus per-operation pipelines.
#[derive(Clone)]
pub struct Provider {
    /// The provider's identifier.
    pub id: ProviderId,
    /// Base URL used when neither options nor environment override it.
    pub default_base_url: String,
    /// How credentials are attached.
    pub auth: AuthScheme,
    /// Model used when options omit one.
    pub default_model: String,
    /// Wire translation functions.
    pub format: Arc<dyn ProviderFormat>,
    /// Pipeline per operation.
    pub pipelines: HashMap<Operation, Pipeline>,
}

impl Provider {
    /// Create a provider with the standard pipelines for every operation.
    pub fn new(
        id: ProviderId,
        default_base_url: impl Into<String>,
        auth: AuthScheme,
        default_model: impl Into<String>,
        format: Arc<dyn ProviderFormat>,
    ) -> Self {
        Self {
            id,
            default_base_url: default_base_url.into(),
            auth,
            default_model: default_model.into(),
            format,
            pipelines: crate::plugs::standard_pipelines(),
        }
    }

    /// Replace the pipeline for one operation.
    pub fn with_pipeline(mut self, op: Operation, pipeline: Pipeline) -> Self {
        self.pipelines.insert(op, pipeline);
        self
    }

    /// The pipeline serving an operation.
    pub fn pipeline(&self, op: Operation) -> Result<&Pipeline> {
        self.pipelines.get(&op).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "provider {} does not support {}",
                self.id,
                op.as_str()
            ))
        })
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("default_base_url", &self.default_base_url)
            .field("auth", &self.auth)
            .field("default_model", &self.default_model)
            .field("operations", &self.pipelines.keys().collect::<Vec<_>>())
            .finish()
    }
}

type Registry = RwLock<HashMap<String, Arc<Provider>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        for provider in bundled_providers() {
            map.insert(provider.id.as_str().to_string(), Arc::new(provider));
        }
        RwLock::new(map)
    })
}

/// The providers installed by default.
fn bundled_providers() -> Vec<Provider> {
    vec![
        openai::provider(ProviderId::OpenAi, "https://api.openai.com", "gpt-4o-mini"),
        openai::provider(ProviderId::Groq, "https://api.groq.com/openai", "llama-3.3-70b-versatile"),
        openai::provider(ProviderId::Mistral, "https://api.mistral.ai", "mistral-small-latest"),
        openai::provider(ProviderId::Perplexity, "https://api.perplexity.ai", "sonar"),
        openai::provider(ProviderId::OpenRouter, "https://openrouter.ai/api", "openrouter/auto"),
        openai::provider(ProviderId::XAi, "https://api.x.ai", "grok-2-latest"),
        openai::local_provider(ProviderId::LmStudio, "http://localhost:1234", "local-model"),
        anthropic::provider(),
        gemini::provider(),
        ollama::provider(),
        mock::provider(),
    ]
}

/// Look up a provider by id.
pub fn lookup(id: &ProviderId) -> Result<Arc<Provider>> {
    registry()
        .read()
        .expect("provider registry lock")
        .get(id.as_str())
        .cloned()
        .ok_or_else(|| Error::UnsupportedProvider(id.as_str().to_string()))
}

/// Register (or replace) a provider. User-supplied providers use
/// [`ProviderId::Custom`].
pub fn register(provider: Provider) {
    registry()
        .write()
        .expect("provider registry lock")
        .insert(provider.id.as_str().to_string(), Arc::new(provider));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_providers_resolve() {
        for id in [
            ProviderId::OpenAi,
            ProviderId::Anthropic,
            ProviderId::Gemini,
            ProviderId::Groq,
            ProviderId::Mistral,
            ProviderId::Perplexity,
            ProviderId::OpenRouter,
            ProviderId::XAi,
            ProviderId::Ollama,
            ProviderId::LmStudio,
            ProviderId::Mock,
        ] {
            assert!(lookup(&id).is_ok(), "missing bundled provider {}", id);
        }
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = lookup(&ProviderId::Custom("bogus".into())).unwrap_err();
        assert_eq!(err.kind(), "unsupported_provider");
    }

    #[test]
    fn test_custom_provider_registration() {
        let custom = Provider::new(
            ProviderId::Custom("inhouse".into()),
            "http://inference.internal",
            AuthScheme::Bearer,
            "inhouse-7b",
            Arc::new(openai::OpenAiFormat::new()),
        );
        register(custom);

        let found = lookup(&ProviderId::Custom("inhouse".into())).expect("registered");
        assert_eq!(found.default_model, "inhouse-7b");
        assert!(found.pipeline(Operation::Chat).is_ok());
    }

    #[test]
    fn test_provider_ids_stable() {
        assert_eq!(ProviderId::OpenAi.as_str(), "openai");
        assert_eq!(ProviderId::XAi.as_str(), "xai");
        assert_eq!(ProviderId::Custom("x".into()).as_str(), "x");
    }
}
