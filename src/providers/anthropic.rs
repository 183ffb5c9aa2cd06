//! Anthropic Messages API format.
//!
//! Endpoint: `/v1/messages` with `x-api-key` auth and a pinned
//! `anthropic-version` header. Streaming is event-typed SSE:
//! `message_start`, `content_block_delta` (text deltas), `message_delta`
//! (stop reason + output usage), `message_stop` (terminal), and `ping`
//! keep-alives.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::http::AuthScheme;
use crate::providers::{ChunkParse, Operation, Provider, ProviderFormat, ProviderId};
use crate::request::{ProviderResponse, Request};
use crate::types::{
    ContentPart, FinishReason, Message, MessageContent, ModelInfo, NormalizedResponse, Role,
    StreamChunk, ToolCall, Usage,
};

/// Anthropic's default generation limit when the caller sets none; the API
/// rejects requests without `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Build the Anthropic provider.
pub fn provider() -> Provider {
    Provider::new(
        ProviderId::Anthropic,
        "https://api.anthropic.com",
        AuthScheme::ApiKeyHeader("x-api-key"),
        "claude-3-5-sonnet-latest",
        Arc::new(AnthropicFormat),
    )
}

/// Format for the Anthropic Messages API.
#[derive(Debug, Clone, Default)]
pub struct AnthropicFormat;

impl AnthropicFormat {
    /// Split out the system prompt and convert the rest to wire messages.
    fn build_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let system: Vec<String> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_text())
            .collect();
        let system = if system.is_empty() {
            None
        } else {
            Some(system.join("\n\n"))
        };

        let wire = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match &m.content {
                MessageContent::Text(text) => {
                    json!({"role": m.role.as_str(), "content": text})
                }
                MessageContent::Parts(parts) => {
                    let blocks: Vec<Value> = parts
                        .iter()
                        .map(|part| match part {
                            ContentPart::Text { text } => {
                                json!({"type": "text", "text": text})
                            }
                            ContentPart::Image {
                                data,
                                url,
                                media_type,
                            } => match (data, url) {
                                (Some(d), _) => json!({
                                    "type": "image",
                                    "source": {
                                        "type": "base64",
                                        "media_type": media_type,
                                        "data": d,
                                    },
                                }),
                                (None, Some(u)) => json!({
                                    "type": "image",
                                    "source": {"type": "url", "url": u},
                                }),
                                (None, None) => Value::Null,
                            },
                            ContentPart::ToolCall {
                                id,
                                name,
                                arguments,
                            } => json!({
                                "type": "tool_use",
                                "id": id,
                                "name": name,
                                "input": arguments,
                            }),
                            ContentPart::ToolResult {
                                tool_call_id,
                                content,
                            } => json!({
                                "type": "tool_result",
                                "tool_use_id": tool_call_id,
                                "content": content,
                            }),
                        })
                        .collect();
                    json!({"role": m.role.as_str(), "content": blocks})
                }
            })
            .collect();

        (system, wire)
    }
}

impl ProviderFormat for AnthropicFormat {
    fn prepare(&self, req: &Request) -> Result<Value> {
        let config = req.config()?;
        let opts = &req.options;
        let (system, messages) = Self::build_messages(&req.messages);

        let mut body = json!({
            "model": config.model,
            "messages": messages,
            "max_tokens": opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": req.operation == Operation::Stream,
        });

        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = opts.top_k {
            body["top_k"] = json!(k);
        }
        if let Some(stop) = &opts.stop {
            body["stop_sequences"] = json!(stop);
        }
        if let Some(tools) = &opts.tools {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }

        Ok(body)
    }

    fn parse(&self, _req: &Request, resp: &ProviderResponse) -> Result<NormalizedResponse> {
        let body = &resp.body;
        let blocks = body
            .get("content")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Server {
                status: resp.status,
                body: body.to_string(),
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }

        let usage = body.get("usage").map(|u| {
            Usage::new(
                u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            )
        });

        Ok(NormalizedResponse {
            content: if text.is_empty() { None } else { Some(text) },
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            finish_reason: body
                .get("stop_reason")
                .and_then(|v| v.as_str())
                .map(FinishReason::from_wire),
            usage,
            cost: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            raw: body.clone(),
        })
    }

    fn parse_models(&self, resp: &ProviderResponse) -> Result<Vec<ModelInfo>> {
        let data = resp
            .body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Server {
                status: resp.status,
                body: resp.body.to_string(),
            })?;

        Ok(data
            .iter()
            .filter_map(|m| {
                Some(ModelInfo {
                    id: m.get("id")?.as_str()?.to_string(),
                    context_window: None,
                    owned_by: Some("anthropic".to_string()),
                })
            })
            .collect())
    }

    fn parse_chunk(&self, payload: &str) -> ChunkParse {
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => return ChunkParse::Error(format!("malformed chunk: {}", e)),
        };

        match value.get("type").and_then(|v| v.as_str()) {
            Some("message_start") => {
                let message = value.get("message").cloned().unwrap_or(Value::Null);
                let input_tokens = message
                    .get("usage")
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                ChunkParse::Chunk(StreamChunk {
                    role: message
                        .get("role")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    model: message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    usage: (input_tokens > 0).then(|| Usage::new(input_tokens, 0)),
                    provider_raw: Some(value),
                    ..StreamChunk::default()
                })
            }
            Some("content_block_delta") => {
                let delta = value.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => ChunkParse::Chunk(StreamChunk {
                        content: delta
                            .get("text")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        provider_raw: Some(value),
                        ..StreamChunk::default()
                    }),
                    Some("input_json_delta") => ChunkParse::Chunk(StreamChunk {
                        tool_call_delta: delta.get("partial_json").cloned(),
                        provider_raw: Some(value),
                        ..StreamChunk::default()
                    }),
                    _ => ChunkParse::Skip,
                }
            }
            Some("message_delta") => {
                let output_tokens = value
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                ChunkParse::Chunk(StreamChunk {
                    finish_reason: value
                        .get("delta")
                        .and_then(|d| d.get("stop_reason"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    usage: (output_tokens > 0).then(|| Usage::new(0, output_tokens)),
                    provider_raw: Some(value),
                    ..StreamChunk::default()
                })
            }
            Some("message_stop") => ChunkParse::Done,
            Some("ping") | Some("content_block_start") | Some("content_block_stop") => {
                ChunkParse::Skip
            }
            Some("error") => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("provider error event");
                ChunkParse::Error(message.to_string())
            }
            _ => ChunkParse::Skip,
        }
    }

    fn map_error(&self, status: u16, body: &str) -> Error {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));
        let kind = error
            .and_then(|e| e.get("type"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or(body)
            .to_string();

        match kind {
            "authentication_error" | "permission_error" => Error::AuthenticationFailed(message),
            "rate_limit_error" => Error::RateLimited { retry_after: None },
            "overloaded_error" => Error::Server {
                status: 529,
                body: message,
            },
            "invalid_request_error" if message.contains("prompt is too long") => {
                Error::ContextLengthExceeded(message)
            }
            "invalid_request_error" => Error::InvalidRequest(message),
            _ => crate::http::status_to_error(status, message, None),
        }
    }

    fn path(&self, op: Operation, _model: &str) -> String {
        match op {
            Operation::Chat | Operation::Stream => "/v1/messages".into(),
            Operation::ListModels => "/v1/models".into(),
            Operation::Embeddings => "/v1/embeddings".into(),
        }
    }

    fn extra_headers(&self) -> Vec<(&'static str, String)> {
        vec![("anthropic-version", "2023-06-01".to_string())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> Request {
        let mut req = Request::new(
            ProviderId::Anthropic,
            Operation::Chat,
            vec![
                Message::system("Be terse."),
                Message::user("Why is the sky blue?"),
            ],
        );
        req.config = Some(crate::config::ProviderConfig {
            model: "claude-3-5-sonnet-latest".into(),
            base_url: "https://api.anthropic.com".into(),
            api_key: Some("sk-ant-test".into()),
            organization: None,
            timeout: std::time::Duration::from_secs(60),
            retry: crate::http::BackoffConfig::none(),
        });
        req
    }

    #[test]
    fn test_system_extracted_to_top_level() {
        let req = test_request();
        let body = AnthropicFormat.prepare(&req).expect("body");

        assert_eq!(body["system"], "Be terse.");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_parse_text_response() {
        let req = test_request();
        let resp = ProviderResponse {
            status: 200,
            body: json!({
                "model": "claude-3-5-sonnet-latest",
                "content": [{"type": "text", "text": "Rayleigh scattering."}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 4},
            }),
        };

        let result = AnthropicFormat.parse(&req, &resp).expect("parse");
        assert_eq!(result.content.as_deref(), Some("Rayleigh scattering."));
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage, Some(Usage::new(12, 4)));
    }

    #[test]
    fn test_parse_tool_use_blocks() {
        let req = test_request();
        let resp = ProviderResponse {
            status: 200,
            body: json!({
                "model": "claude-3-5-sonnet-latest",
                "content": [{
                    "type": "tool_use",
                    "id": "toolu_1",
                    "name": "get_weather",
                    "input": {"city": "Oslo"},
                }],
                "stop_reason": "tool_use",
            }),
        };

        let result = AnthropicFormat.parse(&req, &resp).expect("parse");
        assert_eq!(result.content, None);
        assert_eq!(result.finish_reason, Some(FinishReason::ToolCalls));
        let calls = result.tool_calls.expect("tool calls");
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments["city"], "Oslo");
    }

    #[test]
    fn test_chunk_event_sequence() {
        let format = AnthropicFormat;

        let start = format.parse_chunk(
            r#"{"type":"message_start","message":{"role":"assistant","model":"claude-3-5-sonnet-latest","usage":{"input_tokens":12}}}"#,
        );
        match start {
            ChunkParse::Chunk(c) => {
                assert_eq!(c.role.as_deref(), Some("assistant"));
                assert_eq!(c.usage, Some(Usage::new(12, 0)));
            }
            other => panic!("unexpected {:?}", other),
        }

        let delta = format.parse_chunk(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
        );
        match delta {
            ChunkParse::Chunk(c) => assert_eq!(c.content.as_deref(), Some("Hel")),
            other => panic!("unexpected {:?}", other),
        }

        let finish = format.parse_chunk(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
        );
        match finish {
            ChunkParse::Chunk(c) => {
                assert_eq!(c.finish_reason.as_deref(), Some("end_turn"));
                assert_eq!(c.usage, Some(Usage::new(0, 7)));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            format.parse_chunk(r#"{"type":"message_stop"}"#),
            ChunkParse::Done
        ));
        assert!(matches!(
            format.parse_chunk(r#"{"type":"ping"}"#),
            ChunkParse::Skip
        ));
    }

    #[test]
    fn test_map_error_types() {
        let auth = AnthropicFormat.map_error(
            401,
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        );
        assert_eq!(auth.kind(), "authentication_failed");

        let ctx = AnthropicFormat.map_error(
            400,
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"prompt is too long: 250000 tokens"}}"#,
        );
        assert_eq!(ctx.kind(), "context_length_exceeded");

        let overloaded = AnthropicFormat.map_error(
            529,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(overloaded.kind(), "server_error");
    }

    #[test]
    fn test_continuation_appends_partial_turn() {
        let messages = vec![Message::user("Tell me a story")];
        let rewritten = AnthropicFormat.continuation(&messages, "Once upon a time");
        assert_eq!(rewritten.len(), 3);
        assert_eq!(rewritten[1].role, Role::Assistant);
        assert_eq!(rewritten[1].content.as_text(), "Once upon a time");
        assert_eq!(rewritten[2].role, Role::User);
    }

    #[test]
    fn test_version_header_pinned() {
        let headers = AnthropicFormat.extra_headers();
        assert_eq!(headers, vec![("anthropic-version", "2023-06-01".to_string())]);
    }
}
