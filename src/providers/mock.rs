//! Deterministic in-process provider for tests and offline development.
//!
//! The mock provider echoes the last user message (`"ping"` answers
//! `"pong"`) without touching the network: its pipelines swap the HTTP
//! execute plugs for in-process ones. Streaming synthesizes a real SSE
//! body and runs it through the same framing, flow-control, and recovery
//! machinery as live providers, so end-to-end stream behavior is testable
//! offline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::http::AuthScheme;
use crate::pipeline::Plug;
use crate::plugs::{
    shared_cache, CacheLookup, CacheStore, FetchConfig, ManageContext, ParseResponse,
    PrepareRequest, TrackCost, ValidateProvider,
};
use crate::providers::{ChunkParse, Operation, Provider, ProviderFormat, ProviderId};
use crate::request::{ProviderResponse, Request, RequestState};
use crate::stream::{
    spawn_stream, ByteStream, StreamCoordinator, StreamSource,
};
use crate::types::{
    EmbeddingResponse, FinishReason, ModelInfo, NormalizedResponse, StreamChunk, Usage,
};

/// Build the mock provider.
pub fn provider() -> Provider {
    let cache = shared_cache();
    Provider::new(
        ProviderId::Mock,
        "http://mock.invalid",
        AuthScheme::None,
        "mock-echo-1",
        Arc::new(MockFormat),
    )
    .with_pipeline(
        Operation::Chat,
        crate::pipeline::Pipeline::new(vec![
            Arc::new(ValidateProvider),
            Arc::new(FetchConfig),
            Arc::new(ManageContext),
            Arc::new(CacheLookup::new(cache.clone())),
            Arc::new(PrepareRequest),
            Arc::new(MockExecute),
            Arc::new(ParseResponse),
            Arc::new(TrackCost),
            Arc::new(CacheStore::new(cache)),
        ]),
    )
    .with_pipeline(
        Operation::Stream,
        crate::pipeline::Pipeline::new(vec![
            Arc::new(ValidateProvider),
            Arc::new(FetchConfig),
            Arc::new(ManageContext),
            Arc::new(PrepareRequest),
            Arc::new(StreamCoordinator),
            Arc::new(MockStreamExecute),
        ]),
    )
    .with_pipeline(
        Operation::Embeddings,
        crate::pipeline::Pipeline::new(vec![
            Arc::new(ValidateProvider),
            Arc::new(FetchConfig),
            Arc::new(PrepareRequest),
            Arc::new(MockExecute),
            Arc::new(ParseResponse),
        ]),
    )
    .with_pipeline(
        Operation::ListModels,
        crate::pipeline::Pipeline::new(vec![
            Arc::new(ValidateProvider),
            Arc::new(FetchConfig),
            Arc::new(MockExecute),
            Arc::new(ParseResponse),
        ]),
    )
}

/// The mock tokenizer: roughly three quarters of the character count.
fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() as u32) * 3).div_ceil(4)
}

/// The canned reply: `"ping"` answers `"pong"`, anything else echoes.
fn reply_to(input: &str) -> String {
    if input.trim() == "ping" {
        "pong".to_string()
    } else {
        input.to_string()
    }
}

/// Extract the last user message from a prepared mock body.
fn last_user_content(body: &Value) -> String {
    body.get("messages")
        .and_then(|m| m.as_array())
        .and_then(|messages| {
            messages
                .iter()
                .rev()
                .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        })
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Wire format of the mock provider.
#[derive(Debug, Clone, Default)]
pub struct MockFormat;

impl ProviderFormat for MockFormat {
    fn prepare(&self, req: &Request) -> Result<Value> {
        let config = req.config()?;
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.content.as_text(),
                })
            })
            .collect();
        Ok(json!({
            "model": config.model,
            "messages": messages,
            "stream": req.operation == Operation::Stream,
        }))
    }

    fn prepare_embeddings(&self, req: &Request) -> Result<Value> {
        let config = req.config()?;
        Ok(json!({
            "model": config.model,
            "input": req.inputs,
        }))
    }

    fn parse(&self, _req: &Request, resp: &ProviderResponse) -> Result<NormalizedResponse> {
        let body = &resp.body;
        let usage = body.get("usage").map(|u| {
            Usage::new(
                u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            )
        });

        Ok(NormalizedResponse {
            content: body
                .get("content")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            finish_reason: Some(FinishReason::Stop),
            usage,
            cost: None,
            tool_calls: None,
            raw: body.clone(),
        })
    }

    fn parse_embeddings(&self, resp: &ProviderResponse) -> Result<EmbeddingResponse> {
        let embeddings = resp
            .body
            .get("embeddings")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Server {
                status: resp.status,
                body: resp.body.to_string(),
            })?
            .iter()
            .filter_map(|e| {
                e.as_array().map(|vals| {
                    vals.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect()
                })
            })
            .collect();

        Ok(EmbeddingResponse {
            embeddings,
            model: "mock-echo-1".into(),
            usage: None,
        })
    }

    fn parse_models(&self, resp: &ProviderResponse) -> Result<Vec<ModelInfo>> {
        Ok(resp
            .body
            .get("models")
            .and_then(|v| v.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| {
                        Some(ModelInfo {
                            id: m.as_str()?.to_string(),
                            context_window: Some(8192),
                            owned_by: Some("mock".into()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn parse_chunk(&self, payload: &str) -> ChunkParse {
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => return ChunkParse::Error(format!("malformed chunk: {}", e)),
        };

        let content = value
            .get("delta")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let finish_reason = value
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if content.is_none() && finish_reason.is_none() {
            return ChunkParse::Skip;
        }
        ChunkParse::Chunk(StreamChunk {
            content,
            finish_reason,
            provider_raw: Some(value),
            ..StreamChunk::default()
        })
    }

    fn path(&self, op: Operation, _model: &str) -> String {
        format!("/mock/{}", op.as_str())
    }
}

/// In-process replacement for the HTTP execute plug.
pub struct MockExecute;

#[async_trait]
impl Plug for MockExecute {
    fn name(&self) -> &'static str {
        "mock_execute"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        req.state = RequestState::Executing;
        let model = req.config()?.model.clone();

        let body = match req.operation {
            Operation::Chat | Operation::Stream => {
                let input = req
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == crate::types::Role::User)
                    .map(|m| m.content.as_text())
                    .unwrap_or_default();
                let reply = reply_to(&input);
                json!({
                    "model": model,
                    "content": reply,
                    "usage": {
                        "input_tokens": estimate_tokens(&input),
                        "output_tokens": estimate_tokens(&reply),
                    },
                })
            }
            Operation::Embeddings => json!({
                "model": model,
                "embeddings": req
                    .inputs
                    .iter()
                    .map(|input| {
                        // Deterministic toy embedding: 4 dims from length.
                        let n = input.chars().count() as f32;
                        vec![n, n / 2.0, n / 4.0, 1.0]
                    })
                    .collect::<Vec<_>>(),
            }),
            Operation::ListModels => json!({"models": ["mock-echo-1"]}),
        };

        req.response = Some(ProviderResponse { status: 200, body });
        Ok(req)
    }
}

/// Synthesizes an SSE body for the prepared request and replays it through
/// the real streaming machinery.
struct MockStreamSource;

#[async_trait]
impl StreamSource for MockStreamSource {
    async fn open(&self, body: &Value) -> Result<ByteStream> {
        let reply = reply_to(&last_user_content(body));

        let mut frames: Vec<Result<Vec<u8>>> = reply
            .as_bytes()
            .chunks(4)
            .map(|piece| {
                let text = String::from_utf8_lossy(piece);
                Ok(format!("data: {}\n\n", json!({ "delta": text })).into_bytes())
            })
            .collect();
        frames.push(Ok(b"data: [DONE]\n\n".to_vec()));

        Ok(Box::pin(futures::stream::iter(frames)))
    }
}

/// In-process replacement for the streaming execute plug.
pub struct MockStreamExecute;

#[async_trait]
impl Plug for MockStreamExecute {
    fn name(&self) -> &'static str {
        "mock_stream_execute"
    }

    async fn call(&self, req: Request) -> Result<Request> {
        spawn_stream(req, Arc::new(MockStreamSource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_rules() {
        assert_eq!(reply_to("ping"), "pong");
        assert_eq!(reply_to(" ping "), "pong");
        assert_eq!(reply_to("hello"), "hello");
    }

    #[test]
    fn test_token_estimate() {
        // The canonical pair: "ping" and "pong" are 3 tokens each.
        assert_eq!(estimate_tokens("ping"), 3);
        assert_eq!(estimate_tokens("pong"), 3);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_parse_chunk_shapes() {
        assert!(matches!(
            MockFormat.parse_chunk(r#"{"delta":"Hel"}"#),
            ChunkParse::Chunk(_)
        ));
        assert!(matches!(
            MockFormat.parse_chunk(r#"{"finish_reason":"stop"}"#),
            ChunkParse::Chunk(_)
        ));
        assert!(matches!(
            MockFormat.parse_chunk(r#"{"noise":true}"#),
            ChunkParse::Skip
        ));
        assert!(matches!(
            MockFormat.parse_chunk("garbage"),
            ChunkParse::Error(_)
        ));
    }

    #[test]
    fn test_last_user_content_extraction() {
        let body = json!({
            "messages": [
                {"role": "system", "content": "be nice"},
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "mid"},
                {"role": "user", "content": "second"},
            ],
        });
        assert_eq!(last_user_content(&body), "second");
    }
}
