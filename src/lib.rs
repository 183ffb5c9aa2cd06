//! # LLM Conduit
//!
//! A unified client for LLM HTTP providers (OpenAI, Anthropic, Gemini,
//! Groq, Mistral, Perplexity, OpenRouter, xAI, Ollama, LM Studio) behind
//! one request/response model: synchronous chat, SSE streaming with flow
//! control and resumable recovery, embeddings, and model listing.
//!
//! ## Core Concepts
//!
//! - **[`Request`]** — the value carried through a pipeline; every plug
//!   takes it and returns a new one.
//! - **[`Plug`] / [`Pipeline`]** — ordered transformation steps with
//!   short-circuit on halt; each provider supplies a pipeline per
//!   operation.
//! - **[`ProviderFormat`]** — pure translation between normalized types
//!   and one provider's wire API, including streaming chunk parsing.
//! - **Flow control** — each stream runs a producer and a consumer task
//!   around a bounded buffer with backpressure, rate limiting, and
//!   optional batching.
//! - **Recovery** — interrupted streams can resume from the partial
//!   response via provider-specific continuation requests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_conduit::{chat, Message, ProviderId, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let response = chat(
//!         ProviderId::OpenAi,
//!         vec![Message::user("Why is the sky blue?")],
//!         RequestOptions::default().with_model("gpt-4o-mini"),
//!     )
//!     .await?;
//!     println!("{}", response.content.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! ```no_run
//! use llm_conduit::{stream, Message, ProviderId, RequestOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream_id = stream(
//!         ProviderId::Anthropic,
//!         vec![Message::user("Tell me a story")],
//!         RequestOptions::default(),
//!         Arc::new(|chunk| {
//!             if let Some(text) = chunk.content {
//!                 print!("{}", text);
//!             }
//!         }),
//!     )
//!     .await?;
//!     // ... later: llm_conduit::cancel_stream(&stream_id).ok();
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod cache;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod flow;
pub mod http;
pub mod pipeline;
pub mod plugs;
pub mod providers;
pub mod recovery;
pub mod request;
pub mod sse;
pub mod stream;
pub mod types;

use std::sync::Arc;

pub use config::{RequestOptions, ResponseFormat, ToolChoice, ToolSpec};
pub use error::{Error, Result};
pub use flow::{FlowMetrics, FlowOptions, OverflowStrategy};
pub use pipeline::{Pipeline, Plug};
pub use providers::{Operation, Provider, ProviderFormat, ProviderId};
pub use recovery::{RecoveryOptions, ResumeStrategy};
pub use request::{Request, RequestState};
pub use stream::ChunkCallback;
pub use types::{
    EmbeddingResponse, FinishReason, Message, MessageContent, ModelInfo, NormalizedResponse,
    Role, StreamChunk, ToolCall, Usage,
};

use providers::Operation as Op;
use request::StreamContext;

/// Resolve the pipeline for an operation and fold the request through it.
///
/// Unknown providers fall back to a validation-only pipeline so the
/// failure surfaces as a recorded error entry, like any other.
async fn run_pipeline(req: Request) -> Request {
    let pipeline = match providers::lookup(&req.provider) {
        Ok(provider) => match provider.pipeline(req.operation) {
            Ok(pipeline) => pipeline.clone(),
            Err(_) => Pipeline::new(vec![Arc::new(plugs::ValidateProvider)]),
        },
        Err(_) => Pipeline::new(vec![Arc::new(plugs::ValidateProvider)]),
    };
    pipeline.run(req).await
}

fn surface_error(req: &Request) -> Option<Error> {
    req.first_error().map(|entry| entry.error.clone())
}

/// Send a chat request and wait for the normalized response.
pub async fn chat(
    provider: ProviderId,
    messages: Vec<Message>,
    options: RequestOptions,
) -> Result<NormalizedResponse> {
    let req = Request::new(provider, Op::Chat, messages).with_options(options);
    let out = run_pipeline(req).await;
    if let Some(error) = surface_error(&out) {
        return Err(error);
    }
    out.result
        .ok_or_else(|| Error::Exception("pipeline produced no result".into()))
}

/// Start a streaming chat request.
///
/// Returns the stream id once the stream is running; `callback` receives
/// chunks on a dedicated consumer task, in arrival order, ending with a
/// chunk whose `done` flag is set. Use [`cancel_stream`] to stop early.
pub async fn stream(
    provider: ProviderId,
    messages: Vec<Message>,
    options: RequestOptions,
    callback: ChunkCallback,
) -> Result<String> {
    let mut req = Request::new(provider, Op::Stream, messages).with_options(options);
    req.stream = Some(StreamContext {
        stream_id: request::new_stream_id(),
        started_at: std::time::Instant::now(),
        callback,
        recovery_id: None,
    });

    let out = run_pipeline(req).await;
    if let Some(error) = surface_error(&out) {
        return Err(error);
    }
    out.stream
        .map(|ctx| ctx.stream_id)
        .ok_or_else(|| Error::Exception("stream context lost".into()))
}

/// Compute embeddings for one or more inputs.
pub async fn embeddings<I, S>(
    provider: ProviderId,
    inputs: I,
    options: RequestOptions,
) -> Result<EmbeddingResponse>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let req = Request::new(provider, Op::Embeddings, Vec::new())
        .with_inputs(inputs.into_iter().map(Into::into).collect())
        .with_options(options);
    let out = run_pipeline(req).await;
    if let Some(error) = surface_error(&out) {
        return Err(error);
    }
    out.embeddings
        .ok_or_else(|| Error::Exception("pipeline produced no embeddings".into()))
}

/// List the models a provider advertises.
pub async fn list_models(provider: ProviderId) -> Result<Vec<ModelInfo>> {
    let req = Request::new(provider, Op::ListModels, Vec::new());
    let out = run_pipeline(req).await;
    if let Some(error) = surface_error(&out) {
        return Err(error);
    }
    out.models
        .ok_or_else(|| Error::Exception("pipeline produced no model list".into()))
}

/// Cancel a running stream by id.
///
/// The stream's callback receives one final chunk with
/// `finish_reason = "cancelled"`. Unknown ids yield
/// [`Error::StreamNotFound`].
pub fn cancel_stream(stream_id: &str) -> Result<()> {
    stream::cancel(stream_id)
}

/// Register a user-supplied provider (or replace a bundled one).
pub fn register_provider(provider: Provider) {
    providers::register(provider);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unknown_provider_yields_single_validation_error() {
        let req = Request::new(
            ProviderId::Custom("bogus".into()),
            Op::Chat,
            vec![Message::user("hi")],
        );
        let out = run_pipeline(req).await;

        assert_eq!(out.state, RequestState::Error);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].plug, "validate_provider");
        assert_eq!(out.errors[0].kind(), "unsupported_provider");

        let err = chat(
            ProviderId::Custom("bogus".into()),
            vec![Message::user("hi")],
            RequestOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "unsupported_provider");
    }

    #[tokio::test]
    async fn test_mock_chat_happy_path() {
        let response = chat(
            ProviderId::Mock,
            vec![Message::user("ping")],
            RequestOptions::default()
                .with_model("m")
                .with_temperature(0.0),
        )
        .await
        .expect("chat");

        assert_eq!(response.content.as_deref(), Some("pong"));
        assert_eq!(response.model, "m");
        let usage = response.usage.expect("usage");
        assert_eq!(
            (usage.input_tokens, usage.output_tokens, usage.total_tokens),
            (3, 3, 6)
        );
    }

    #[tokio::test]
    async fn test_pipeline_records_timing_and_state() {
        let req = Request::new(ProviderId::Mock, Op::Chat, vec![Message::user("ping")]);
        let out = run_pipeline(req).await;
        assert_eq!(out.state, RequestState::Completed);
        assert!(out.metadata.duration_ms.is_some());
        assert_eq!(out.metadata.tokens.map(|t| t.total_tokens), Some(6));
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_cached_request_skips_execution() {
        let options = RequestOptions::default()
            .with_model("cached-model")
            .with_cache_ttl(Duration::from_secs(60));
        let messages = vec![Message::user("cache me if you can")];

        let first = chat(ProviderId::Mock, messages.clone(), options.clone())
            .await
            .expect("first");

        // Run the raw pipeline to observe the cache-hit marker.
        let req = Request::new(ProviderId::Mock, Op::Chat, messages)
            .with_options(options);
        let out = run_pipeline(req).await;
        assert!(out.private.contains_key("cache_hit"), "second call served from cache");
        assert_eq!(
            out.result.expect("result").content,
            first.content
        );
    }

    #[tokio::test]
    async fn test_mock_stream_end_to_end() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let stream_id = stream(
            ProviderId::Mock,
            vec![Message::user("ping")],
            RequestOptions::default(),
            Arc::new(move |chunk| {
                seen2.lock().unwrap().push(chunk);
            }),
        )
        .await
        .expect("stream");
        assert!(stream_id.starts_with("stream-"));

        for _ in 0..200 {
            if seen.lock().unwrap().iter().any(|c: &StreamChunk| c.done) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let chunks = seen.lock().unwrap();
        let text: String = chunks.iter().filter_map(|c| c.content.clone()).collect();
        assert_eq!(text, "pong");
        assert!(chunks.last().expect("chunks").done);

        // The stream has finished and unregistered.
        drop(chunks);
        let err = cancel_stream(&stream_id).unwrap_err();
        assert_eq!(err.kind(), "stream_not_found");
    }

    #[tokio::test]
    async fn test_mock_embeddings() {
        let response = embeddings(
            ProviderId::Mock,
            vec!["hello", "world!"],
            RequestOptions::default(),
        )
        .await
        .expect("embeddings");

        assert_eq!(response.embeddings.len(), 2);
        assert_eq!(response.embeddings[0].len(), 4);
    }

    #[tokio::test]
    async fn test_mock_list_models() {
        let models = list_models(ProviderId::Mock).await.expect("models");
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "mock-echo-1");
    }

    #[tokio::test]
    async fn test_missing_api_key_surfaces() {
        // A Bearer-auth provider with no key in options; the env var for a
        // custom provider is never consulted.
        register_provider(Provider::new(
            ProviderId::Custom("needs-key".into()),
            "https://api.needs-key.example",
            http::AuthScheme::Bearer,
            "model-1",
            Arc::new(providers::openai::OpenAiFormat::new()),
        ));

        let err = chat(
            ProviderId::Custom("needs-key".into()),
            vec![Message::user("hi")],
            RequestOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "missing_api_key");
    }
}
