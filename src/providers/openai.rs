//! OpenAI-compatible provider format.
//!
//! Covers OpenAI itself and the API-compatible family: Groq, Mistral,
//! Perplexity, OpenRouter, xAI, and LM Studio. Endpoint:
//! `/v1/chat/completions`; streaming is SSE with
//! `data: {"choices":[{"delta":{"content":"token"}}]}` frames terminated by
//! `data: [DONE]`.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::http::AuthScheme;
use crate::providers::{
    ChunkParse, Operation, Provider, ProviderFormat, ProviderId,
};
use crate::request::{ProviderResponse, Request};
use crate::types::{
    ContentPart, EmbeddingResponse, FinishReason, Message, MessageContent, ModelInfo,
    NormalizedResponse, StreamChunk, ToolCall, Usage,
};

/// Build an OpenAI-family provider with Bearer auth.
pub fn provider(id: ProviderId, base_url: &str, default_model: &str) -> Provider {
    Provider::new(
        id,
        base_url,
        AuthScheme::Bearer,
        default_model,
        Arc::new(OpenAiFormat::new()),
    )
}

/// Build an OpenAI-compatible local provider (no authentication).
pub fn local_provider(id: ProviderId, base_url: &str, default_model: &str) -> Provider {
    Provider::new(
        id,
        base_url,
        AuthScheme::None,
        default_model,
        Arc::new(OpenAiFormat::new()),
    )
}

/// Format for any OpenAI-compatible API.
#[derive(Debug, Clone, Default)]
pub struct OpenAiFormat;

impl OpenAiFormat {
    /// Create the format.
    pub fn new() -> Self {
        Self
    }

    /// Convert one normalized message to the OpenAI wire shape.
    fn build_message(message: &Message) -> Value {
        match &message.content {
            MessageContent::Text(text) => {
                json!({"role": message.role.as_str(), "content": text})
            }
            MessageContent::Parts(parts) => {
                let mut content_parts = Vec::new();
                let mut tool_calls = Vec::new();
                let mut tool_result: Option<Value> = None;

                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            content_parts.push(json!({"type": "text", "text": text}));
                        }
                        ContentPart::Image {
                            data,
                            url,
                            media_type,
                        } => {
                            let image_url = match (url, data) {
                                (Some(u), _) => u.clone(),
                                (None, Some(d)) => {
                                    format!("data:{};base64,{}", media_type, d)
                                }
                                (None, None) => String::new(),
                            };
                            content_parts.push(
                                json!({"type": "image_url", "image_url": {"url": image_url}}),
                            );
                        }
                        ContentPart::ToolCall {
                            id,
                            name,
                            arguments,
                        } => {
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": arguments.to_string(),
                                },
                            }));
                        }
                        ContentPart::ToolResult {
                            tool_call_id,
                            content,
                        } => {
                            tool_result = Some(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id,
                                "content": content,
                            }));
                        }
                    }
                }

                if let Some(result) = tool_result {
                    return result;
                }
                let mut msg = json!({"role": message.role.as_str(), "content": content_parts});
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = Value::Array(tool_calls);
                }
                msg
            }
        }
    }

    /// Build the `/v1/chat/completions` body.
    fn build_body(req: &Request, stream: bool) -> Result<Value> {
        let config = req.config()?;
        let opts = &req.options;

        let messages: Vec<Value> = req.messages.iter().map(Self::build_message).collect();
        let mut body = json!({
            "model": config.model,
            "messages": messages,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = opts.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(p) = opts.frequency_penalty {
            body["frequency_penalty"] = json!(p);
        }
        if let Some(p) = opts.presence_penalty {
            body["presence_penalty"] = json!(p);
        }
        if let Some(stop) = &opts.stop {
            body["stop"] = json!(stop);
        }
        if let Some(seed) = opts.seed {
            body["seed"] = json!(seed);
        }
        if let Some(user) = &opts.user {
            body["user"] = json!(user);
        }
        match &opts.response_format {
            Some(crate::config::ResponseFormat::JsonObject) => {
                body["response_format"] = json!({"type": "json_object"});
            }
            Some(crate::config::ResponseFormat::JsonSchema { schema }) => {
                body["response_format"] =
                    json!({"type": "json_schema", "json_schema": schema});
            }
            None => {}
        }
        if let Some(tools) = &opts.tools {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            },
                        })
                    })
                    .collect(),
            );
        }
        match &opts.tool_choice {
            Some(crate::config::ToolChoice::Auto) => body["tool_choice"] = json!("auto"),
            Some(crate::config::ToolChoice::None) => body["tool_choice"] = json!("none"),
            Some(crate::config::ToolChoice::Named(name)) => {
                body["tool_choice"] =
                    json!({"type": "function", "function": {"name": name}});
            }
            None => {}
        }

        Ok(body)
    }

    fn parse_usage(value: &Value) -> Option<Usage> {
        let usage = value.get("usage")?;
        Some(Usage::new(
            usage.get("prompt_tokens")?.as_u64()? as u32,
            usage.get("completion_tokens")?.as_u64()? as u32,
        ))
    }

    fn parse_tool_calls(message: &Value) -> Option<Vec<ToolCall>> {
        let calls = message.get("tool_calls")?.as_array()?;
        let parsed: Vec<ToolCall> = calls
            .iter()
            .filter_map(|call| {
                let function = call.get("function")?;
                let arguments = function.get("arguments")?.as_str().map_or_else(
                    || function.get("arguments").cloned().unwrap_or(Value::Null),
                    |raw| serde_json::from_str(raw).unwrap_or(Value::String(raw.to_string())),
                );
                Some(ToolCall {
                    id: call.get("id")?.as_str()?.to_string(),
                    name: function.get("name")?.as_str()?.to_string(),
                    arguments,
                })
            })
            .collect();
        if parsed.is_empty() {
            None
        } else {
            Some(parsed)
        }
    }
}

impl ProviderFormat for OpenAiFormat {
    fn prepare(&self, req: &Request) -> Result<Value> {
        Self::build_body(req, req.operation == Operation::Stream)
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
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| Error::Server {
                status: resp.status,
                body: body.to_string(),
            })?;
        let message = choice.get("message").cloned().unwrap_or(Value::Null);

        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let tool_calls = Self::parse_tool_calls(&message);

        Ok(NormalizedResponse {
            content,
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            finish_reason: choice
                .get("finish_reason")
                .and_then(|v| v.as_str())
                .map(FinishReason::from_wire),
            usage: Self::parse_usage(body),
            cost: None,
            tool_calls,
            raw: body.clone(),
        })
    }

    fn parse_embeddings(&self, resp: &ProviderResponse) -> Result<EmbeddingResponse> {
        let body = &resp.body;
        let data = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Server {
                status: resp.status,
                body: body.to_string(),
            })?;

        let embeddings = data
            .iter()
            .filter_map(|item| {
                item.get("embedding")?.as_array().map(|vals| {
                    vals.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect()
                })
            })
            .collect();

        Ok(EmbeddingResponse {
            embeddings,
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            usage: Self::parse_usage(body),
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
                    context_window: m
                        .get("context_window")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u32),
                    owned_by: m
                        .get("owned_by")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                })
            })
            .collect())
    }

    fn parse_chunk(&self, payload: &str) -> ChunkParse {
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => return ChunkParse::Error(format!("malformed chunk: {}", e)),
        };

        let choice = value.get("choices").and_then(|c| c.get(0));
        let delta = choice.and_then(|c| c.get("delta"));

        let content = delta
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let role = delta
            .and_then(|d| d.get("role"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let tool_call_delta = delta.and_then(|d| d.get("tool_calls")).cloned();
        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let usage = Self::parse_usage(&value);

        if content.is_none()
            && role.is_none()
            && tool_call_delta.is_none()
            && finish_reason.is_none()
            && usage.is_none()
        {
            return ChunkParse::Skip;
        }

        ChunkParse::Chunk(StreamChunk {
            content,
            role,
            finish_reason,
            model: value.get("model").and_then(|v| v.as_str()).map(str::to_string),
            tool_call_delta,
            done: false,
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
        let code = error
            .and_then(|e| e.get("code").or_else(|| e.get("type")))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if code.contains("context_length") || message.contains("maximum context length") {
            return Error::ContextLengthExceeded(message);
        }
        if code.contains("insufficient_quota") || code.contains("billing") {
            return Error::QuotaExceeded(message);
        }
        if code.contains("content_policy") || code.contains("content_filter") {
            return Error::ContentFilter(message);
        }
        crate::http::status_to_error(status, message, None)
    }

    fn continuation(&self, messages: &[Message], partial: &str) -> Vec<Message> {
        let mut rewritten = messages.to_vec();
        rewritten.push(Message::system(format!(
            "The assistant's previous response was cut off. It ended with:\n\n{}",
            partial
        )));
        rewritten.push(Message::user(
            "Continue exactly where you left off, without repeating anything.",
        ));
        rewritten
    }

    fn path(&self, op: Operation, _model: &str) -> String {
        match op {
            Operation::Chat | Operation::Stream => "/v1/chat/completions".into(),
            Operation::Embeddings => "/v1/embeddings".into(),
            Operation::ListModels => "/v1/models".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestOptions;

    fn test_request() -> Request {
        let mut req = Request::new(
            ProviderId::OpenAi,
            Operation::Chat,
            vec![
                Message::system("You are a helpful assistant."),
                Message::user("Why is the sky blue?"),
            ],
        );
        req.config = Some(crate::config::ProviderConfig {
            model: "gpt-4o".into(),
            base_url: "https://api.openai.com".into(),
            api_key: Some("sk-test".into()),
            organization: None,
            timeout: std::time::Duration::from_secs(60),
            retry: crate::http::BackoffConfig::none(),
        });
        req
    }

    #[test]
    fn test_chat_body_shape() {
        let mut req = test_request();
        req.options = RequestOptions::default()
            .with_temperature(0.0)
            .with_max_tokens(256);

        let body = OpenAiFormat::build_body(&req, false).expect("body");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], false);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 256);

        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Why is the sky blue?");
    }

    #[test]
    fn test_unset_options_omitted() {
        let req = test_request();
        let body = OpenAiFormat::build_body(&req, false).expect("body");
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("response_format").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_stream_body_requests_usage() {
        let req = test_request();
        let body = OpenAiFormat::build_body(&req, true).expect("body");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_json_mode() {
        let mut req = test_request();
        req.options.response_format = Some(crate::config::ResponseFormat::JsonObject);
        let body = OpenAiFormat::build_body(&req, false).expect("body");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_parse_response() {
        let req = test_request();
        let resp = ProviderResponse {
            status: 200,
            body: json!({
                "model": "gpt-4o-2024-11-20",
                "choices": [{
                    "message": {"role": "assistant", "content": "Rayleigh scattering."},
                    "finish_reason": "stop",
                }],
                "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25},
            }),
        };

        let result = OpenAiFormat.parse(&req, &resp).expect("parse");
        assert_eq!(result.content.as_deref(), Some("Rayleigh scattering."));
        assert_eq!(result.model, "gpt-4o-2024-11-20");
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage, Some(Usage::new(20, 5)));
    }

    #[test]
    fn test_parse_tool_calls() {
        let req = test_request();
        let resp = ProviderResponse {
            status: 200,
            body: json!({
                "model": "gpt-4o",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"},
                        }],
                    },
                    "finish_reason": "tool_calls",
                }],
            }),
        };

        let result = OpenAiFormat.parse(&req, &resp).expect("parse");
        assert_eq!(result.content, None);
        assert_eq!(result.finish_reason, Some(FinishReason::ToolCalls));
        let calls = result.tool_calls.expect("tool calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments["city"], "Oslo");
    }

    #[test]
    fn test_parse_chunk_delta() {
        let chunk = OpenAiFormat
            .parse_chunk(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        match chunk {
            ChunkParse::Chunk(c) => {
                assert_eq!(c.content.as_deref(), Some("Hel"));
                assert!(!c.done);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_chunk_finish_reason() {
        let chunk = OpenAiFormat
            .parse_chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        match chunk {
            ChunkParse::Chunk(c) => {
                assert_eq!(c.finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_chunk_usage_only_frame() {
        let chunk = OpenAiFormat.parse_chunk(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4,"total_tokens":14}}"#,
        );
        match chunk {
            ChunkParse::Chunk(c) => {
                assert_eq!(c.usage, Some(Usage::new(10, 4)));
                assert_eq!(c.content, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_chunk_malformed() {
        assert!(matches!(
            OpenAiFormat.parse_chunk("not json"),
            ChunkParse::Error(_)
        ));
    }

    #[test]
    fn test_map_error_context_length() {
        let body = r#"{"error":{"message":"This model's maximum context length is 8192 tokens.","type":"invalid_request_error","code":"context_length_exceeded"}}"#;
        let err = OpenAiFormat.map_error(400, body);
        assert_eq!(err.kind(), "context_length_exceeded");
    }

    #[test]
    fn test_map_error_quota() {
        let body = r#"{"error":{"message":"You exceeded your current quota.","type":"insufficient_quota"}}"#;
        let err = OpenAiFormat.map_error(429, body);
        assert_eq!(err.kind(), "quota_exceeded");
    }

    #[test]
    fn test_map_error_unknown_shape_preserves_body() {
        let err = OpenAiFormat.map_error(500, "<html>gateway error</html>");
        assert_eq!(err.kind(), "server_error");
        assert!(err.to_string().contains("gateway error"));
    }

    #[test]
    fn test_continuation_uses_system_style() {
        let messages = vec![Message::user("Tell me a story")];
        let rewritten = OpenAiFormat.continuation(&messages, "Once upon a time");
        assert_eq!(rewritten.len(), 3);
        assert_eq!(rewritten[1].role, crate::types::Role::System);
        assert!(rewritten[1].content.as_text().contains("Once upon a time"));
        assert_eq!(rewritten[2].role, crate::types::Role::User);
    }

    #[test]
    fn test_image_part_wire_shape() {
        let msg = Message {
            role: crate::types::Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "What is this?".into(),
                },
                ContentPart::Image {
                    data: Some("aGVsbG8=".into()),
                    url: None,
                    media_type: "image/png".into(),
                },
            ]),
        };
        let wire = OpenAiFormat::build_message(&msg);
        let parts = wire["content"].as_array().expect("parts");
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .expect("url")
            .starts_with("data:image/png;base64,"));
    }
}
