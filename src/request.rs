//! The request value carried through the pipeline.
//!
//! A [`Request`] is created per call and folded through the pipeline's plugs.
//! Plugs take the request by value and return a new value; all inter-plug
//! communication goes through the request's explicit fields, `assigns`, and
//! `private` maps. There is no hidden shared state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::config::{ProviderConfig, RequestOptions};
use crate::error::Error;
use crate::http::HttpTransport;
use crate::providers::{Operation, ProviderId};
use crate::stream::ChunkCallback;
use crate::types::{EmbeddingResponse, Message, ModelInfo, NormalizedResponse, Usage};

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Created, not yet executed.
    Pending,
    /// The HTTP call is in flight.
    Executing,
    /// A stream is being consumed.
    Streaming,
    /// Finished successfully; `result` is set.
    Completed,
    /// Finished with errors; `errors` is non-empty.
    Error,
    /// Halted without a result or error (e.g. cancelled mid-pipeline).
    Halted,
}

/// One recorded pipeline error.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    /// Name of the plug that recorded the error.
    pub plug: String,
    /// The error itself.
    pub error: Error,
    /// Extra structured context.
    pub details: Option<Value>,
}

impl ErrorEntry {
    /// Stable snake_case kind tag of the underlying error.
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    /// Human-readable message of the underlying error.
    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

/// Timing, usage, and cost bookkeeping for a request.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// When the pipeline started running this request.
    pub start_time: Option<Instant>,
    /// When the pipeline finished.
    pub end_time: Option<Instant>,
    /// Wall-clock pipeline duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Token usage, recorded by response parsing.
    pub tokens: Option<Usage>,
    /// Computed cost in cents, recorded by cost tracking.
    pub cost_cents: Option<f64>,
}

/// The raw HTTP response captured by the execute plug.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body.
    pub body: Value,
}

/// Streaming state attached to a request, present iff the operation streams.
#[derive(Clone)]
pub struct StreamContext {
    /// Unique stream identifier (returned to the caller).
    pub stream_id: String,
    /// When the stream was initialised.
    pub started_at: Instant,
    /// User callback receiving chunks.
    pub callback: ChunkCallback,
    /// Recovery record key, when stream recovery is enabled.
    pub recovery_id: Option<String>,
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("stream_id", &self.stream_id)
            .field("recovery_id", &self.recovery_id)
            .finish()
    }
}

/// Carrier of all per-call state, folded through the pipeline.
#[derive(Debug, Clone)]
pub struct Request {
    /// Opaque unique id, stable for the request lifetime.
    pub id: String,
    /// Target provider.
    pub provider: ProviderId,
    /// The operation this request performs.
    pub operation: Operation,
    /// Conversation messages (chat/stream operations).
    pub messages: Vec<Message>,
    /// Embedding inputs (embeddings operation).
    pub inputs: Vec<String>,
    /// User-supplied options.
    pub options: RequestOptions,
    /// Merged effective configuration, set by `FetchConfig`.
    pub config: Option<ProviderConfig>,
    /// Lifecycle state.
    pub state: RequestState,
    /// Once true, no further plug runs.
    pub halted: bool,
    /// HTTP transport handle, set by `BuildHttpClient`.
    pub transport: Option<Arc<HttpTransport>>,
    /// Provider-formatted request body, set by `PrepareRequest`.
    pub provider_request: Option<Value>,
    /// Raw HTTP response, set by `ExecuteRequest`.
    pub response: Option<ProviderResponse>,
    /// Normalized result, set by `ParseResponse`.
    pub result: Option<NormalizedResponse>,
    /// Embeddings result (embeddings operation).
    pub embeddings: Option<EmbeddingResponse>,
    /// Model listing result (list-models operation).
    pub models: Option<Vec<ModelInfo>>,
    /// Public inter-plug data sharing.
    pub assigns: HashMap<String, Value>,
    /// Internal bookkeeping, reserved for the library's own plugs.
    pub private: HashMap<String, Value>,
    /// Timing/usage/cost metadata.
    pub metadata: RequestMetadata,
    /// Recorded errors, in order.
    pub errors: Vec<ErrorEntry>,
    /// Streaming context, present iff streaming.
    pub stream: Option<StreamContext>,
    /// Cooperative cancellation signal for this call.
    pub cancel: Arc<AtomicBool>,
}

impl Request {
    /// Create a new pending request.
    pub fn new(provider: ProviderId, operation: Operation, messages: Vec<Message>) -> Self {
        Self {
            id: new_request_id(),
            provider,
            operation,
            messages,
            inputs: Vec::new(),
            options: RequestOptions::default(),
            config: None,
            state: RequestState::Pending,
            halted: false,
            transport: None,
            provider_request: None,
            response: None,
            result: None,
            embeddings: None,
            models: None,
            assigns: HashMap::new(),
            private: HashMap::new(),
            metadata: RequestMetadata::default(),
            errors: Vec::new(),
            stream: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach user options.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach embedding inputs.
    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Store a value in the public `assigns` map.
    pub fn assign(mut self, key: impl Into<String>, value: Value) -> Self {
        self.assigns.insert(key.into(), value);
        self
    }

    /// Store a value in the internal `private` map.
    pub fn put_private(mut self, key: impl Into<String>, value: Value) -> Self {
        self.private.insert(key.into(), value);
        self
    }

    /// Halt the pipeline without recording an error.
    pub fn halt(mut self) -> Self {
        self.halted = true;
        if self.state != RequestState::Completed && self.state != RequestState::Error {
            self.state = RequestState::Halted;
        }
        self
    }

    /// Record an error against `plug` and halt the pipeline.
    pub fn halt_with_error(mut self, plug: impl Into<String>, error: Error) -> Self {
        self.errors.push(ErrorEntry {
            plug: plug.into(),
            error,
            details: None,
        });
        self.state = RequestState::Error;
        self.halted = true;
        self
    }

    /// Mark the request completed with a normalized result.
    pub fn complete(mut self, result: NormalizedResponse) -> Self {
        self.result = Some(result);
        self.state = RequestState::Completed;
        self
    }

    /// The first recorded error, if any.
    pub fn first_error(&self) -> Option<&ErrorEntry> {
        self.errors.first()
    }

    /// Whether cancellation has been requested for this call.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// The effective configuration. Errors if `FetchConfig` has not run.
    pub fn config(&self) -> crate::error::Result<&ProviderConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| Error::Exception("config not fetched".into()))
    }
}

/// Generate a random 128-bit hex request id.
fn new_request_id() -> String {
    format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..))
}

/// Generate a stream id, prefixed for log readability.
pub(crate) fn new_stream_id() -> String {
    format!("stream-{:016x}", fastrand::u64(..))
}
