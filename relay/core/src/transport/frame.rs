//! Line Frame Protocol
//!
//! Incremental decoder for the two streaming body styles the backends use:
//!
//! ```text
//! SSE style (OpenAI-compatible):      NDJSON style (Ollama):
//!
//! data: {"choices":[...]}\n            {"response":"Hel","done":false}\n
//! \n                                   {"response":"lo","done":false}\n
//! data: [DONE]\n                       {"response":"","done":true}\n
//! ```
//!
//! One rule covers both: split on `\n`, strip an optional `data:` prefix,
//! treat `[DONE]` as end of stream, decode everything else as JSON and drop
//! lines that do not decode.
//!
//! Bytes are buffered rather than text because a chunk boundary may fall in
//! the middle of a multi-byte UTF-8 sequence. `\n` never occurs inside such a
//! sequence, so splitting on the byte is safe.

use serde::de::DeserializeOwned;

/// Maximum buffered line length (10 MB)
///
/// A backend that never sends a newline would otherwise grow the buffer without bound.
pub const MAX_LINE_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Sentinel that terminates SSE streams
const DONE_SENTINEL: &str = "[DONE]";

/// One decoded unit from a streaming body
#[derive(Debug, PartialEq)]
pub enum LineFrame<T> {
    /// A JSON payload decoded into the caller's wire type
    Data(T),
    /// The `[DONE]` sentinel
    Done,
}

/// Classification of a single line
#[derive(Debug, PartialEq)]
enum Line<'a> {
    Skip,
    Done,
    Payload(&'a str),
}

fn classify_line(raw: &str) -> Line<'_> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with(':') {
        return Line::Skip;
    }

    let payload = line
        .strip_prefix("data:")
        .map_or(line, str::trim_start);

    if payload == DONE_SENTINEL {
        Line::Done
    } else if payload.is_empty() {
        Line::Skip
    } else {
        Line::Payload(payload)
    }
}

/// Decoder state machine for newline-framed streaming bodies
///
/// Buffers incoming bytes and yields complete frames.
#[derive(Debug)]
pub struct LineFrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Lines dropped because they did not decode
    skipped: usize,
}

impl Default for LineFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            skipped: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);

        if self.available() > MAX_LINE_SIZE && !self.buffer[self.read_pos..].contains(&b'\n') {
            tracing::warn!(
                buffered = self.available(),
                "Discarding oversized stream line"
            );
            self.clear();
        }
    }

    /// Number of unconsumed bytes
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Number of lines dropped because they were not valid JSON for `T`
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Try to decode the next frame
    ///
    /// Returns `None` when no complete line is buffered. Lines that fail to
    /// decode are skipped.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Option<LineFrame<T>> {
        loop {
            let rest = &self.buffer[self.read_pos..];
            let newline = rest.iter().position(|b| *b == b'\n')?;
            let line_end = self.read_pos + newline;
            let start = self.read_pos;
            self.read_pos = line_end + 1;

            if let Some(frame) = self.decode_line(start, line_end) {
                return Some(frame);
            }
        }
    }

    /// Flush a trailing line that was not newline-terminated
    ///
    /// Call once the body has ended.
    pub fn finish<T: DeserializeOwned>(&mut self) -> Option<LineFrame<T>> {
        if let Some(frame) = self.next_frame() {
            return Some(frame);
        }
        let (start, end) = (self.read_pos, self.buffer.len());
        self.read_pos = end;
        if start == end {
            return None;
        }
        self.decode_line(start, end)
    }

    fn decode_line<T: DeserializeOwned>(&mut self, start: usize, end: usize) -> Option<LineFrame<T>> {
        let text = String::from_utf8_lossy(&self.buffer[start..end]);
        match classify_line(&text) {
            Line::Skip => None,
            Line::Done => Some(LineFrame::Done),
            Line::Payload(payload) => match serde_json::from_str(payload) {
                Ok(value) => Some(LineFrame::Data(value)),
                Err(e) => {
                    self.skipped += 1;
                    tracing::debug!(error = %e, "Skipping undecodable stream line");
                    None
                }
            },
        }
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Token {
        text: String,
    }

    fn token(text: &str) -> LineFrame<Token> {
        LineFrame::Data(Token {
            text: text.to_string(),
        })
    }

    #[test]
    fn test_sse_lines() {
        let mut decoder = LineFrameDecoder::new();
        decoder.push(b"data: {\"text\":\"a\"}\n\ndata: {\"text\":\"b\"}\n\ndata: [DONE]\n\n");

        assert_eq!(decoder.next_frame::<Token>(), Some(token("a")));
        assert_eq!(decoder.next_frame::<Token>(), Some(token("b")));
        assert_eq!(decoder.next_frame::<Token>(), Some(LineFrame::Done));
        assert_eq!(decoder.next_frame::<Token>(), None);
    }

    #[test]
    fn test_ndjson_lines() {
        let mut decoder = LineFrameDecoder::new();
        decoder.push(b"{\"text\":\"x\"}\n{\"text\":\"y\"}\n");

        assert_eq!(decoder.next_frame::<Token>(), Some(token("x")));
        assert_eq!(decoder.next_frame::<Token>(), Some(token("y")));
        assert_eq!(decoder.next_frame::<Token>(), None);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut decoder = LineFrameDecoder::new();
        decoder.push(b"data: {\"te");
        assert_eq!(decoder.next_frame::<Token>(), None);
        decoder.push(b"xt\":\"joined\"}");
        assert_eq!(decoder.next_frame::<Token>(), None);
        decoder.push(b"\n");
        assert_eq!(decoder.next_frame::<Token>(), Some(token("joined")));
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let line = "{\"text\":\"caf\u{e9} \u{1f600}\"}\n".as_bytes().to_vec();
        let (first, second) = line.split_at(13);

        let mut decoder = LineFrameDecoder::new();
        decoder.push(first);
        assert_eq!(decoder.next_frame::<Token>(), None);
        decoder.push(second);
        assert_eq!(
            decoder.next_frame::<Token>(),
            Some(token("caf\u{e9} \u{1f600}"))
        );
    }

    #[test]
    fn test_invalid_lines_are_dropped() {
        let mut decoder = LineFrameDecoder::new();
        decoder.push(b"data: not json\n: keep-alive\nevent: ping\n{\"text\":\"ok\"}\n");

        assert_eq!(decoder.next_frame::<Token>(), Some(token("ok")));
        assert_eq!(decoder.skipped(), 2);
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut decoder = LineFrameDecoder::new();
        decoder.push(b"data: {\"text\":\"r\"}\r\n\r\ndata: [DONE]\r\n");

        assert_eq!(decoder.next_frame::<Token>(), Some(token("r")));
        assert_eq!(decoder.next_frame::<Token>(), Some(LineFrame::Done));
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = LineFrameDecoder::new();
        decoder.push(b"{\"text\":\"tail\"}");
        assert_eq!(decoder.next_frame::<Token>(), None);
        assert_eq!(decoder.finish::<Token>(), Some(token("tail")));
        assert_eq!(decoder.finish::<Token>(), None);
    }

    #[test]
    fn test_data_prefix_without_space() {
        let mut decoder = LineFrameDecoder::new();
        decoder.push(b"data:{\"text\":\"tight\"}\n");
        assert_eq!(decoder.next_frame::<Token>(), Some(token("tight")));
    }
}
