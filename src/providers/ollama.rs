//! Ollama native API format.
//!
//! Endpoints: `/api/chat` for chat, `/api/embed` for embeddings,
//! `/api/tags` for the local model list. Streaming is newline-delimited
//! JSON with `{"message":{"content":"token"},"done":false}` per line; the
//! final line carries `done: true` plus eval counters.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::http::AuthScheme;
use crate::providers::{
    ChunkParse, Operation, Provider, ProviderFormat, ProviderId, StreamFraming,
};
use crate::request::{ProviderResponse, Request};
use crate::types::{
    EmbeddingResponse, FinishReason, ModelInfo, NormalizedResponse, StreamChunk, Usage,
};

/// Build the Ollama provider.
pub fn provider() -> Provider {
    Provider::new(
        ProviderId::Ollama,
        "http://localhost:11434",
        AuthScheme::None,
        "llama3.2",
        Arc::new(OllamaFormat),
    )
}

/// Format for Ollama's native API.
#[derive(Debug, Clone, Default)]
pub struct OllamaFormat;

impl OllamaFormat {
    /// Build the `options` object from the request options.
    fn build_options(req: &Request) -> Value {
        let opts = &req.options;
        let mut options = serde_json::Map::new();
        if let Some(t) = opts.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(m) = opts.max_tokens {
            options.insert("num_predict".into(), json!(m));
        }
        if let Some(p) = opts.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if let Some(k) = opts.top_k {
            options.insert("top_k".into(), json!(k));
        }
        if let Some(seed) = opts.seed {
            options.insert("seed".into(), json!(seed));
        }
        if let Some(stop) = &opts.stop {
            options.insert("stop".into(), json!(stop));
        }
        Value::Object(options)
    }

    fn usage_from_counts(value: &Value) -> Option<Usage> {
        let input = value.get("prompt_eval_count").and_then(|v| v.as_u64());
        let output = value.get("eval_count").and_then(|v| v.as_u64());
        match (input, output) {
            (None, None) => None,
            _ => Some(Usage::new(
                input.unwrap_or(0) as u32,
                output.unwrap_or(0) as u32,
            )),
        }
    }
}

impl ProviderFormat for OllamaFormat {
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

        let mut body = json!({
            "model": config.model,
            "messages": messages,
            "stream": req.operation == Operation::Stream,
        });

        let options = Self::build_options(req);
        if options.as_object().is_some_and(|o| !o.is_empty()) {
            body["options"] = options;
        }
        if matches!(
            req.options.response_format,
            Some(crate::config::ResponseFormat::JsonObject)
        ) {
            body["format"] = json!("json");
        }

        Ok(body)
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
        let content = body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Server {
                status: resp.status,
                body: body.to_string(),
            })?;

        Ok(NormalizedResponse {
            content: Some(content.to_string()),
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            finish_reason: body
                .get("done_reason")
                .and_then(|v| v.as_str())
                .map(FinishReason::from_wire),
            usage: Self::usage_from_counts(body),
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
            model: resp
                .body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            usage: None,
        })
    }

    fn parse_models(&self, resp: &ProviderResponse) -> Result<Vec<ModelInfo>> {
        let models = resp
            .body
            .get("models")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Server {
                status: resp.status,
                body: resp.body.to_string(),
            })?;

        Ok(models
            .iter()
            .filter_map(|m| {
                Some(ModelInfo {
                    id: m.get("name")?.as_str()?.to_string(),
                    context_window: None,
                    owned_by: None,
                })
            })
            .collect())
    }

    fn parse_chunk(&self, payload: &str) -> ChunkParse {
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => return ChunkParse::Error(format!("malformed chunk: {}", e)),
        };

        let done = value.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
        let content = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        if done {
            return ChunkParse::Chunk(StreamChunk {
                content,
                finish_reason: value
                    .get("done_reason")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                model: value.get("model").and_then(|v| v.as_str()).map(str::to_string),
                done: true,
                usage: Self::usage_from_counts(&value),
                provider_raw: Some(value),
                ..StreamChunk::default()
            });
        }

        if content.is_none() {
            return ChunkParse::Skip;
        }

        ChunkParse::Chunk(StreamChunk {
            content,
            model: value.get("model").and_then(|v| v.as_str()).map(str::to_string),
            provider_raw: Some(value),
            ..StreamChunk::default()
        })
    }

    fn map_error(&self, status: u16, body: &str) -> Error {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| body.to_string());

        if message.contains("not found") {
            return Error::InvalidRequest(message);
        }
        crate::http::status_to_error(status, message, None)
    }

    fn path(&self, op: Operation, _model: &str) -> String {
        match op {
            Operation::Chat | Operation::Stream => "/api/chat".into(),
            Operation::Embeddings => "/api/embed".into(),
            Operation::ListModels => "/api/tags".into(),
        }
    }

    fn framing(&self) -> StreamFraming {
        StreamFraming::Ndjson
    }
}
