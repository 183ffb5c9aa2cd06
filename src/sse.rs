//! Incremental Server-Sent-Events framer.
//!
//! Feeds on raw bytes and yields complete events: lines of `field: value`
//! grouped until a blank line. Multi-line `data:` values are concatenated
//! with a single `\n`; `data: [DONE]` signals end of stream; comment lines
//! (leading `:`) are ignored. Handles `\r\n`, bare `\n`, and stray `\r`
//! line endings, and is insensitive to how the byte stream is chunked.

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// Concatenated `data:` payload.
    pub data: String,
}

/// Output of feeding bytes into the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    /// A complete event frame.
    Event(SseEvent),
    /// The `data: [DONE]` terminator was seen.
    Done,
}

/// Byte-fed SSE parser.
///
/// # Example
///
/// ```
/// use llm_conduit::sse::{SseParser, SseItem};
///
/// let mut parser = SseParser::new();
/// let items = parser.feed(b"data: {\"delta\":\"Hi\"}\n\ndata: [DONE]\n\n");
/// assert_eq!(items.len(), 2);
/// assert!(matches!(items[1], SseItem::Done));
/// ```
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
    dropped_frames: u64,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of malformed frames dropped so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Feed raw bytes, returning any completed items.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut items = Vec::new();
        loop {
            // Find the next line terminator: \r\n, \n, or a stray \r that
            // is not the last buffered byte (it may be half of a \r\n).
            let Some((line, consumed)) = next_line(&self.buffer) else {
                break;
            };
            let line = line.to_string();
            self.buffer.drain(..consumed);
            if let Some(item) = self.take_line(&line) {
                items.push(item);
            }
        }
        items
    }

    /// Flush a trailing unterminated event (stream closed without a final
    /// blank line).
    pub fn flush(&mut self) -> Option<SseItem> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            if let Some(item) = self.take_line(&line) {
                return Some(item);
            }
        }
        self.finish_event()
    }

    /// Process one complete line.
    fn take_line(&mut self, line: &str) -> Option<SseItem> {
        if line.is_empty() {
            return self.finish_event();
        }
        if let Some(rest) = line.strip_prefix(':') {
            // Comment / keep-alive line.
            let _ = rest;
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            // A field with no colon is a field name with empty value.
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // id / retry / unknown fields are accepted and ignored.
            _ => {}
        }
        None
    }

    /// Emit the accumulated event, if any.
    fn finish_event(&mut self) -> Option<SseItem> {
        if self.data_lines.is_empty() && self.event_type.is_none() {
            return None;
        }

        let event = self.event_type.take();
        let data = std::mem::take(&mut self.data_lines).join("\n");

        if data == "[DONE]" {
            return Some(SseItem::Done);
        }
        if data.is_empty() && event.is_none() {
            self.dropped_frames += 1;
            return None;
        }

        Some(SseItem::Event(SseEvent { event, data }))
    }
}

/// Locate the next complete line in `buffer`.
///
/// Returns `(line, bytes_consumed)`. A trailing `\r` is left in the buffer
/// since it may be the first half of a `\r\n` split across chunks.
fn next_line(buffer: &str) -> Option<(&str, usize)> {
    let bytes = buffer.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'\n' => return Some((&buffer[..i], i + 1)),
            b'\r' => {
                if i + 1 < bytes.len() {
                    let consumed = if bytes[i + 1] == b'\n' { i + 2 } else { i + 1 };
                    return Some((&buffer[..i], consumed));
                }
                // Trailing \r: wait for the next chunk.
                return None;
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(items: Vec<SseItem>) -> Vec<SseEvent> {
        items
            .into_iter()
            .filter_map(|i| match i {
                SseItem::Event(e) => Some(e),
                SseItem::Done => None,
            })
            .collect()
    }

    #[test]
    fn test_basic_event() {
        let mut parser = SseParser::new();
        let items = parser.feed(b"data: {\"delta\":\"Hel\"}\n\n");
        let events = events(items);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"delta\":\"Hel\"}");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_done_terminator() {
        let mut parser = SseParser::new();
        let items = parser.feed(b"data: {\"delta\":\"Hel\"}\n\ndata: [DONE]\n\n");
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], SseItem::Event(_)));
        assert_eq!(items[1], SseItem::Done);
    }

    #[test]
    fn test_event_type_field() {
        let mut parser = SseParser::new();
        let items = parser.feed(b"event: content_block_delta\ndata: {\"x\":1}\n\n");
        let events = events(items);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_multiline_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let items = parser.feed(b"data: line one\ndata: line two\n\n");
        let events = events(items);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_comment_lines_ignored() {
        let mut parser = SseParser::new();
        let items = parser.feed(b": keep-alive\n\ndata: {\"x\":1}\n\n");
        let events = events(items);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = SseParser::new();
        let items = parser.feed(b"data: {\"x\":1}\r\n\r\ndata: {\"x\":2}\r\n\r\n");
        let events = events(items);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"x\":1}");
        assert_eq!(events[1].data, "{\"x\":2}");
    }

    #[test]
    fn test_stray_cr_line_ending() {
        let mut parser = SseParser::new();
        let mut items = parser.feed(b"data: {\"x\":1}\r\rdata: {\"x\":2}\r\r");
        // Trailing \r is held back until the next chunk proves it isn't \r\n.
        items.extend(parser.feed(b"\n"));
        let events = events(items);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_split_across_arbitrary_boundaries() {
        // Parsing is a left fold: byte boundaries don't matter.
        let body = b"event: delta\ndata: {\"content\":\"Hello\"}\n\ndata: [DONE]\n\n";
        for split in 1..body.len() - 1 {
            let mut parser = SseParser::new();
            let mut items = parser.feed(&body[..split]);
            items.extend(parser.feed(&body[split..]));
            assert_eq!(items.len(), 2, "split at {}", split);
            match &items[0] {
                SseItem::Event(e) => {
                    assert_eq!(e.event.as_deref(), Some("delta"));
                    assert_eq!(e.data, "{\"content\":\"Hello\"}");
                }
                other => panic!("unexpected item {:?} at split {}", other, split),
            }
            assert_eq!(items[1], SseItem::Done);
        }
    }

    #[test]
    fn test_data_no_space_after_colon() {
        let mut parser = SseParser::new();
        let items = parser.feed(b"data:{\"x\":1}\n\n");
        let events = events(items);
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_flush_unterminated_event() {
        let mut parser = SseParser::new();
        let items = parser.feed(b"data: {\"x\":1}");
        assert!(items.is_empty());
        let flushed = parser.flush();
        assert!(matches!(flushed, Some(SseItem::Event(_))));
    }

    #[test]
    fn test_empty_frames_dropped() {
        let mut parser = SseParser::new();
        let items = parser.feed(b"\n\n\n\n");
        assert!(items.is_empty());
    }

    #[test]
    fn test_scenario_concatenation() {
        // Concatenated deltas equal the SSE body's payloads minus framing.
        let mut parser = SseParser::new();
        let items = parser.feed(
            b"data: {\"delta\":\"Hel\"}\n\ndata: {\"delta\":\"lo\"}\n\ndata: [DONE]\n\n",
        );
        let mut text = String::new();
        let mut saw_done = false;
        for item in items {
            match item {
                SseItem::Event(e) => {
                    let v: serde_json::Value = serde_json::from_str(&e.data).expect("json");
                    text.push_str(v["delta"].as_str().unwrap_or(""));
                }
                SseItem::Done => saw_done = true,
            }
        }
        assert_eq!(text, "Hello");
        assert!(saw_done);
    }
}
