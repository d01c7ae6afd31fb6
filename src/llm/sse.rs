//! SSE (Server-Sent Events) frame decoder for chat-completions streams.
//!
//! Buffers raw bytes across TCP chunk boundaries, strips `data: `
//! prefixes, skips `event:` and keep-alive lines, and reports the
//! `[DONE]` terminator as an explicit frame so the stream accumulator
//! can distinguish clean termination from a dropped connection.

use serde_json::Value;

/// A decoded frame from the SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// One `data:` payload parsed as JSON.
    Data(Value),
    /// The `data: [DONE]` terminator.
    Done,
}

/// Incremental SSE decoder.
///
/// # Example
///
/// ```
/// use blockflow::llm::sse::{SseDecoder, SseFrame};
///
/// let mut decoder = SseDecoder::new();
/// let frames = decoder.push(b"data: {\"x\":1}\n\ndata: [DONE]\n\n");
/// assert_eq!(frames.len(), 2);
/// assert!(matches!(frames[1], SseFrame::Done));
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every complete frame now available.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(frame) = decode_line(line.trim()) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drain whatever remains in the buffer (streams that end without a
    /// trailing newline).
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let remaining = std::mem::take(&mut self.buffer);
        remaining
            .lines()
            .filter_map(|line| decode_line(line.trim()))
            .collect()
    }
}

/// Decode one SSE line. `event:` lines and blank keep-alives yield
/// nothing; unparseable data payloads are dropped.
fn decode_line(line: &str) -> Option<SseFrame> {
    if line.is_empty() || line.starts_with("event:") || line.starts_with(':') {
        return None;
    }
    let data = line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))?
        .trim();
    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    serde_json::from_str::<Value>(data).ok().map(SseFrame::Data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_data_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n");
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], SseFrame::Data(v) if v["choices"].is_array()));
    }

    #[test]
    fn test_done_frame_reported() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames, vec![SseFrame::Data(json!({"a": 1})), SseFrame::Done]);
    }

    #[test]
    fn test_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let frames = decoder.push(b": 2}\n\n");
        assert_eq!(frames, vec![SseFrame::Data(json!({"a": 2}))]);
    }

    #[test]
    fn test_event_comment_and_blank_lines_skipped() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: message\n: keep-alive\n\n\ndata: {\"x\":1}\n");
        assert_eq!(frames, vec![SseFrame::Data(json!({"x": 1}))]);
    }

    #[test]
    fn test_no_space_after_colon() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data:{\"x\":3}\n");
        assert_eq!(frames, vec![SseFrame::Data(json!({"x": 3}))]);
    }

    #[test]
    fn test_finish_drains_trailing_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"tail\": true}").is_empty());
        let frames = decoder.finish();
        assert_eq!(frames, vec![SseFrame::Data(json!({"tail": true}))]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_malformed_payload_dropped() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {broken\n\ndata: {\"ok\":1}\n");
        assert_eq!(frames, vec![SseFrame::Data(json!({"ok": 1}))]);
    }
}
