//! Minimal server-sent-events framing over a byte stream.
//!
//! All three providers emit `data: {json}` lines. This helper buffers the
//! byte stream, splits on newlines, and yields the payload of each `data:`
//! line. The terminator sentinel (`[DONE]` for OpenAI) is the caller's
//! concern.

/// Incremental SSE line parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every complete `data:` payload it finishes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            let trimmed = line.trim();
            if let Some(data) = trimmed.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_lines() {
        let mut parser = SseParser::new();
        let out = parser.feed(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n");
        assert_eq!(out, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn buffers_partial_lines_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"split\"").is_empty());
        let out = parser.feed(b": true}\n");
        assert_eq!(out, vec![r#"{"split": true}"#]);
    }

    #[test]
    fn ignores_comments_and_event_lines() {
        let mut parser = SseParser::new();
        let out = parser.feed(b": keepalive\nevent: message_start\ndata: x\n");
        assert_eq!(out, vec!["x"]);
    }

    #[test]
    fn handles_crlf() {
        let mut parser = SseParser::new();
        let out = parser.feed(b"data: y\r\n");
        assert_eq!(out, vec!["y"]);
    }
}
