//! Google Gemini (Generative Language API) format.
//!
//! The model is part of the path (`/v1beta/models/<model>:generateContent`)
//! and the API key travels as a `key` query parameter. Streaming uses
//! `:streamGenerateContent?alt=sse`, which emits candidate frames with the
//! same shape as the sync response; the last frame carries `finishReason`.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::http::AuthScheme;
use crate::providers::{ChunkParse, Operation, Provider, ProviderFormat, ProviderId};
use crate::request::{ProviderResponse, Request};
use crate::types::{
    ContentPart, EmbeddingResponse, FinishReason, MessageContent, ModelInfo,
    NormalizedResponse, Role, StreamChunk, ToolCall, Usage,
};

/// Build the Gemini provider.
pub fn provider() -> Provider {
    Provider::new(
        ProviderId::Gemini,
        "https://generativelanguage.googleapis.com",
        AuthScheme::QueryParam("key"),
        "gemini-1.5-flash",
        Arc::new(GeminiFormat),
    )
}

/// Format for the Gemini REST API.
#[derive(Debug, Clone, Default)]
pub struct GeminiFormat;

impl GeminiFormat {
    /// Gemini's wire role for a message role. Assistant turns are `model`.
    fn wire_role(role: Role) -> &'static str {
        match role {
            Role::Assistant => "model",
            _ => "user",
        }
    }

    fn build_parts(content: &MessageContent) -> Vec<Value> {
        match content {
            MessageContent::Text(text) => vec![json!({"text": text})],
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(json!({"text": text})),
                    ContentPart::Image {
                        data: Some(data),
                        media_type,
                        ..
                    } => Some(json!({
                        "inlineData": {"mimeType": media_type, "data": data},
                    })),
                    ContentPart::Image { .. } => None,
                    ContentPart::ToolCall {
                        name, arguments, ..
                    } => Some(json!({
                        "functionCall": {"name": name, "args": arguments},
                    })),
                    ContentPart::ToolResult {
                        tool_call_id,
                        content,
                    } => Some(json!({
                        "functionResponse": {
                            "name": tool_call_id,
                            "response": {"content": content},
                        },
                    })),
                })
                .collect(),
        }
    }

    fn parse_candidate(body: &Value) -> (Option<String>, Option<String>, Option<Vec<ToolCall>>) {
        let candidate = body.get("candidates").and_then(|c| c.get(0));
        let parts = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array());

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        if let Some(parts) = parts {
            for part in parts {
                if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                    text.push_str(t);
                }
                if let Some(call) = part.get("functionCall") {
                    tool_calls.push(ToolCall {
                        id: call
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: call
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: call.get("args").cloned().unwrap_or(Value::Null),
                    });
                }
            }
        }

        let finish = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        (
            if text.is_empty() { None } else { Some(text) },
            finish,
            if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        )
    }

    fn parse_usage(body: &Value) -> Option<Usage> {
        let meta = body.get("usageMetadata")?;
        Some(Usage::new(
            meta.get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            meta.get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        ))
    }
}

impl ProviderFormat for GeminiFormat {
    fn prepare(&self, req: &Request) -> Result<Value> {
        let opts = &req.options;

        let system: Vec<String> = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_text())
            .collect();

        let contents: Vec<Value> = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                json!({
                    "role": Self::wire_role(m.role),
                    "parts": Self::build_parts(&m.content),
                })
            })
            .collect();

        let mut generation = serde_json::Map::new();
        if let Some(t) = opts.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(m) = opts.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(m));
        }
        if let Some(p) = opts.top_p {
            generation.insert("topP".into(), json!(p));
        }
        if let Some(k) = opts.top_k {
            generation.insert("topK".into(), json!(k));
        }
        if let Some(stop) = &opts.stop {
            generation.insert("stopSequences".into(), json!(stop));
        }
        if matches!(
            opts.response_format,
            Some(crate::config::ResponseFormat::JsonObject)
        ) {
            generation.insert("responseMimeType".into(), json!("application/json"));
        }

        let mut body = json!({"contents": contents});
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        Ok(body)
    }

    fn prepare_embeddings(&self, req: &Request) -> Result<Value> {
        let config = req.config()?;
        let requests: Vec<Value> = req
            .inputs
            .iter()
            .map(|input| {
                json!({
                    "model": format!("models/{}", config.model),
                    "content": {"parts": [{"text": input}]},
                })
            })
            .collect();
        Ok(json!({"requests": requests}))
    }

    fn parse(&self, req: &Request, resp: &ProviderResponse) -> Result<NormalizedResponse> {
        let body = &resp.body;
        let (content, finish, tool_calls) = Self::parse_candidate(body);
        if content.is_none() && tool_calls.is_none() {
            return Err(Error::Server {
                status: resp.status,
                body: body.to_string(),
            });
        }

        Ok(NormalizedResponse {
            content,
            model: req
                .config
                .as_ref()
                .map(|c| c.model.clone())
                .unwrap_or_default(),
            finish_reason: finish.as_deref().map(FinishReason::from_wire),
            usage: Self::parse_usage(body),
            cost: None,
            tool_calls,
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
                e.get("values")?.as_array().map(|vals| {
                    vals.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect()
                })
            })
            .collect();

        Ok(EmbeddingResponse {
            embeddings,
            model: String::new(),
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
                let name = m.get("name")?.as_str()?;
                Some(ModelInfo {
                    id: name.strip_prefix("models/").unwrap_or(name).to_string(),
                    context_window: m
                        .get("inputTokenLimit")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u32),
                    owned_by: Some("google".to_string()),
                })
            })
            .collect())
    }

    fn parse_chunk(&self, payload: &str) -> ChunkParse {
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => return ChunkParse::Error(format!("malformed chunk: {}", e)),
        };

        let (content, finish, tool_calls) = Self::parse_candidate(&value);
        let usage = Self::parse_usage(&value);

        if content.is_none() && finish.is_none() && tool_calls.is_none() && usage.is_none() {
            return ChunkParse::Skip;
        }

        // Gemini has no explicit terminator frame; the frame carrying a
        // finish reason is the last one.
        let done = finish.is_some();
        ChunkParse::Chunk(StreamChunk {
            content,
            role: None,
            finish_reason: finish,
            model: None,
            tool_call_delta: tool_calls.map(|c| json!(c)),
            done,
            usage,
            provider_raw: Some(value),
        })
    }

    fn map_error(&self, status: u16, body: &str) -> Error {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or(body)
            .to_string();
        let grpc_status = error
            .and_then(|e| e.get("status"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match grpc_status {
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => Error::AuthenticationFailed(message),
            "RESOURCE_EXHAUSTED" => Error::RateLimited { retry_after: None },
            "INVALID_ARGUMENT" => Error::InvalidRequest(message),
            _ => crate::http::status_to_error(status, message, None),
        }
    }

    fn path(&self, op: Operation, model: &str) -> String {
        match op {
            Operation::Chat => format!("/v1beta/models/{}:generateContent", model),
            Operation::Stream => {
                format!("/v1beta/models/{}:streamGenerateContent?alt=sse", model)
            }
            Operation::Embeddings => {
                format!("/v1beta/models/{}:batchEmbedContents", model)
            }
            Operation::ListModels => "/v1beta/models".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn test_request() -> Request {
        let mut req = Request::new(
            ProviderId::Gemini,
            Operation::Chat,
            vec![
                Message::system("Be terse."),
                Message::user("Why is the sky blue?"),
                Message::assistant("Scattering."),
                Message::user("Elaborate."),
            ],
        );
        req.config = Some(crate::config::ProviderConfig {
            model: "gemini-1.5-flash".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            api_key: Some("test-key".into()),
            organization: None,
            timeout: std::time::Duration::from_secs(60),
            retry: crate::http::BackoffConfig::none(),
        });
        req
    }

    #[test]
    fn test_roles_and_system_instruction() {
        let req = test_request();
        let body = GeminiFormat.prepare(&req).expect("body");

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be terse.");
        let contents = body["contents"].as_array().expect("contents");
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
    }

    #[test]
    fn test_model_in_path() {
        assert_eq!(
            GeminiFormat.path(Operation::Chat, "gemini-1.5-flash"),
            "/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert!(GeminiFormat
            .path(Operation::Stream, "gemini-1.5-flash")
            .ends_with(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn test_parse_response() {
        let req = test_request();
        let resp = ProviderResponse {
            status: 200,
            body: json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Rayleigh scattering."}]},
                    "finishReason": "STOP",
                }],
                "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 3, "totalTokenCount": 12},
            }),
        };

        let result = GeminiFormat.parse(&req, &resp).expect("parse");
        assert_eq!(result.content.as_deref(), Some("Rayleigh scattering."));
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage, Some(Usage::new(9, 3)));
    }

    #[test]
    fn test_chunk_final_frame_is_done() {
        let mid = GeminiFormat.parse_chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#,
        );
        match mid {
            ChunkParse::Chunk(c) => {
                assert_eq!(c.content.as_deref(), Some("Hel"));
                assert!(!c.done);
            }
            other => panic!("unexpected {:?}", other),
        }

        let last = GeminiFormat.parse_chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2}}"#,
        );
        match last {
            ChunkParse::Chunk(c) => {
                assert!(c.done, "frame with finishReason terminates the stream");
                assert_eq!(c.usage, Some(Usage::new(4, 2)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_map_error_grpc_status() {
        let err = GeminiFormat.map_error(
            429,
            r#"{"error":{"code":429,"message":"Quota exceeded for requests","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        assert_eq!(err.kind(), "rate_limited");

        let auth = GeminiFormat.map_error(
            403,
            r#"{"error":{"code":403,"message":"API key not valid","status":"PERMISSION_DENIED"}}"#,
        );
        assert_eq!(auth.kind(), "authentication_failed");
    }

    #[test]
    fn test_model_listing_strips_prefix() {
        let resp = ProviderResponse {
            status: 200,
            body: json!({
                "models": [
                    {"name": "models/gemini-1.5-flash", "inputTokenLimit": 1000000},
                    {"name": "models/gemini-1.5-pro", "inputTokenLimit": 2000000},
                ],
            }),
        };
        let models = GeminiFormat.parse_models(&resp).expect("models");
        assert_eq!(models[0].id, "gemini-1.5-flash");
        assert_eq!(models[0].context_window, Some(1_000_000));
    }
}
