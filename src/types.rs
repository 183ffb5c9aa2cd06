//! Normalized request/response types shared across providers.
//!
//! Every provider format translates between these types and its own wire
//! shapes. Raw provider payloads are preserved in the `raw`/`provider_raw`
//! fields for callers that need provider-specific details.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
    /// Tool invocation result.
    Tool,
}

impl Role {
    /// The lowercase wire name used by most providers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single typed part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image, either inline base64 data or a URL.
    Image {
        /// Base64-encoded image data (exclusive with `url`).
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        /// Image URL (exclusive with `data`).
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// MIME type (e.g. `image/png`).
        media_type: String,
    },
    /// A tool call made by the assistant.
    ToolCall {
        /// Provider-assigned call id.
        id: String,
        /// Tool name.
        name: String,
        /// JSON-encoded arguments.
        arguments: Value,
    },
    /// The result of a tool call, fed back to the model.
    ToolResult {
        /// The id of the call this result answers.
        tool_call_id: String,
        /// Result content.
        content: String,
    },
}

/// Message content: plain text or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Multi-part content (text, images, tool calls).
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten the content to plain text. Non-text parts are skipped.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: MessageContent,
}

impl Message {
    /// Build a text message with the given role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Shorthand for a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Shorthand for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Shorthand for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u32,
    /// Tokens generated in the response.
    pub output_tokens: u32,
    /// `input_tokens + output_tokens`.
    pub total_tokens: u32,
}

impl Usage {
    /// Build a usage record, computing the total.
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Accumulate another usage delta into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
    }
}

/// Computed cost of a request, in USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    /// Cost attributed to input tokens.
    pub input: f64,
    /// Cost attributed to output tokens.
    pub output: f64,
    /// `input + output`.
    pub total: f64,
    /// ISO currency code. Always `"USD"` for the bundled price table.
    pub currency: String,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: Value,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the response.
    Stop,
    /// The `max_tokens` limit was reached.
    Length,
    /// The model requested tool calls.
    ToolCalls,
    /// The provider's content filter intervened.
    ContentFilter,
    /// The stream ended with an error.
    Error,
    /// The stream was cancelled by the caller.
    Cancelled,
    /// A provider-specific reason not covered above.
    Other(String),
}

impl FinishReason {
    /// Map a provider wire string to a finish reason.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stop" | "end_turn" | "STOP" | "stop_sequence" => FinishReason::Stop,
            "length" | "max_tokens" | "MAX_TOKENS" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "SAFETY" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// A normalized, provider-agnostic chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResponse {
    /// Generated text, `None` when the model produced only tool calls.
    pub content: Option<String>,
    /// The model that produced the response.
    pub model: String,
    /// Why generation stopped, if reported.
    pub finish_reason: Option<FinishReason>,
    /// Token usage, if reported.
    pub usage: Option<Usage>,
    /// Computed cost, populated by cost tracking when the model is priced.
    pub cost: Option<Cost>,
    /// Tool calls requested by the model.
    pub tool_calls: Option<Vec<ToolCall>>,
    /// The raw provider response body.
    pub raw: Value,
}

/// One incremental chunk of a streaming response.
///
/// The final chunk of every stream has `done = true`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text delta, if this chunk carries content.
    pub content: Option<String>,
    /// Role announcement (first chunk of some providers).
    pub role: Option<String>,
    /// Finish reason, present on terminal chunks.
    pub finish_reason: Option<String>,
    /// Model identifier, if reported per-chunk.
    pub model: Option<String>,
    /// Incremental tool-call fragment.
    pub tool_call_delta: Option<Value>,
    /// Whether this is the terminal chunk of the stream.
    pub done: bool,
    /// Usage totals, usually present only on the terminal chunk.
    pub usage: Option<Usage>,
    /// The raw provider frame this chunk was parsed from.
    pub provider_raw: Option<Value>,
}

impl StreamChunk {
    /// A content-only delta chunk.
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// A terminal chunk with an optional finish reason.
    pub fn finished(finish_reason: Option<String>) -> Self {
        Self {
            finish_reason,
            done: true,
            ..Self::default()
        }
    }
}

/// A model advertised by a provider's listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier (e.g. `"gpt-4o"`).
    pub id: String,
    /// Context window size, if advertised.
    pub context_window: Option<u32>,
    /// Owning organization, if advertised.
    pub owned_by: Option<String>,
}

/// Response from an embeddings call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// One embedding vector per input, in input order.
    pub embeddings: Vec<Vec<f32>>,
    /// The model that produced the embeddings.
    pub model: String,
    /// Token usage, if reported.
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_helpers() {
        let msg = Message::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content.as_text(), "hello");
    }

    #[test]
    fn test_content_parts_flatten() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "Look at ".into(),
            },
            ContentPart::Image {
                data: None,
                url: Some("https://example.com/cat.png".into()),
                media_type: "image/png".into(),
            },
            ContentPart::Text {
                text: "this".into(),
            },
        ]);
        assert_eq!(content.as_text(), "Look at this");
    }

    #[test]
    fn test_usage_totals() {
        let mut usage = Usage::new(3, 3);
        assert_eq!(usage.total_tokens, 6);
        usage.add(&Usage::new(1, 2));
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.total_tokens, 9);
    }

    #[test]
    fn test_finish_reason_wire_mapping() {
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_wire("tool_use"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_wire("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(
            FinishReason::from_wire("weird"),
            FinishReason::Other("weird".into())
        );
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_stream_chunk_constructors() {
        let delta = StreamChunk::delta("Hi");
        assert_eq!(delta.content.as_deref(), Some("Hi"));
        assert!(!delta.done);

        let fin = StreamChunk::finished(Some("stop".into()));
        assert!(fin.done);
        assert_eq!(fin.finish_reason.as_deref(), Some("stop"));
    }
}
