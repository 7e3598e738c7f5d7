// SSE (Server-Sent Events) observation module
//
// Reads the observer side of the tee and fills in the telemetry event while
// the client is still receiving the same bytes. Upstream speaks the
// chat-completions streaming format:
//
// ```
// data: {"model":"gpt-4","choices":[{"delta":{"content":"Hello"}}]}
//
// data: [DONE]
// ```
//
// Three layers:
//
// 1. **Line splitting**: reassemble lines across arbitrary chunk boundaries,
//    with a hard bound on line length so a misbehaving upstream can't grow
//    memory without limit.
// 2. **Line scanning**: pull model / content / sentinel out of a single line.
// 3. **Observation**: drive the two above over a chunk stream until `[DONE]`
//    or end-of-stream.

use std::ops::ControlFlow;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::events::Event;

use super::types::{first_header, Headers};

/// Appended once when the response transcript hits its cap
pub const TRUNCATION_MARKER: &str = "... [TRUNCATED]";

/// Default response transcript cap (10 KiB)
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024;

/// Default bound on a single SSE line
pub const DEFAULT_MAX_LINE_BYTES: usize = 256 * 1024;

const DONE_SENTINEL: &[u8] = b"[DONE]";

// ============================================================================
// SSE Detection
// ============================================================================

/// Check if a response is SSE based on its content-type header
pub fn is_event_stream(headers: &Headers) -> bool {
    first_header(headers, "content-type").is_some_and(|ct| ct.contains("text/event-stream"))
}

// ============================================================================
// Line Splitting
// ============================================================================

/// Incremental line reassembly over a chunked byte stream
///
/// Lines end in `\n` or `\r\n`. A line longer than `max_line` bytes is dropped
/// in full, including the part that arrives after the limit was crossed.
#[derive(Debug)]
pub struct LineSplitter {
    buf: BytesMut,
    max_line: usize,
    /// Inside an oversize line; skip until the next newline
    discarding: bool,
    /// Prefix of `buf` already known to hold no newline
    searched: usize,
}

impl LineSplitter {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line,
            discarding: false,
            searched: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator, if one is buffered
    pub fn next_line(&mut self) -> Option<Bytes> {
        loop {
            let Some(offset) = self.buf[self.searched..].iter().position(|&b| b == b'\n') else {
                self.searched = self.buf.len();
                if self.buf.len() > self.max_line {
                    self.start_discarding();
                }
                return None;
            };

            let end = self.searched + offset;
            let mut line = self.buf.split_to(end + 1);
            self.searched = 0;
            line.truncate(end);
            strip_cr(&mut line);

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_line {
                tracing::warn!(bytes = line.len(), limit = self.max_line, "Dropping oversize SSE line");
                continue;
            }
            return Some(line.freeze());
        }
    }

    /// Trailing unterminated line at end-of-stream
    pub fn finish(&mut self) -> Option<Bytes> {
        let mut rest = self.buf.split();
        self.searched = 0;
        if std::mem::take(&mut self.discarding) || rest.is_empty() {
            return None;
        }
        strip_cr(&mut rest);
        Some(rest.freeze())
    }

    fn start_discarding(&mut self) {
        if !self.discarding {
            tracing::warn!(limit = self.max_line, "Dropping oversize SSE line");
        }
        self.discarding = true;
        self.buf.clear();
        self.searched = 0;
    }
}

fn strip_cr(line: &mut BytesMut) {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
}

// ============================================================================
// Line Scanning
// ============================================================================

/// The slice of a streaming chunk the observer cares about
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl StreamChunk {
    fn content(&self) -> &str {
        self.choices
            .as_deref()
            .and_then(<[Choice]>::first)
            .and_then(|choice| choice.delta.as_ref())
            .and_then(|delta| delta.content.as_deref())
            .unwrap_or_default()
    }
}

/// Size-capped response transcript
#[derive(Debug, Default)]
pub struct ResponseCapture {
    text: String,
    limit: usize,
    truncated: bool,
}

impl ResponseCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append `content` whole, or append the marker once and stop
    pub fn push(&mut self, content: &str) {
        if self.truncated || content.is_empty() {
            return;
        }
        if self.text.len() + content.len() > self.limit {
            self.text.push_str(TRUNCATION_MARKER);
            self.truncated = true;
            return;
        }
        self.text.push_str(content);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Per-line extraction state for one response
#[derive(Debug)]
pub struct SseScan {
    capture: ResponseCapture,
}

impl SseScan {
    pub fn new(max_response_bytes: usize) -> Self {
        Self {
            capture: ResponseCapture::new(max_response_bytes),
        }
    }

    /// Apply one line to `event`; `Break` on the `[DONE]` sentinel
    ///
    /// Non-data lines and undecodable payloads are skipped. Token count is a
    /// heuristic: one per delta carrying non-empty content.
    pub fn process_line(&mut self, line: &[u8], event: &mut Event) -> ControlFlow<()> {
        let Some(payload) = data_payload(line) else {
            return ControlFlow::Continue(());
        };
        if trim_end(payload) == DONE_SENTINEL {
            return ControlFlow::Break(());
        }

        let chunk: StreamChunk = match serde_json::from_slice(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::trace!(trace_id = %event.trace_id, error = %e, "Skipping undecodable SSE payload");
                return ControlFlow::Continue(());
            }
        };

        if let Some(model) = chunk.model.as_deref() {
            event.capture_model(model);
        }

        let content = chunk.content();
        if !content.is_empty() {
            self.capture.push(content);
            event.token_count = event.token_count.saturating_add(1);
        }

        ControlFlow::Continue(())
    }

    pub fn is_truncated(&self) -> bool {
        self.capture.is_truncated()
    }

    pub fn into_response(self) -> String {
        self.capture.into_text()
    }
}

/// Payload of a `data:` line, with at most one leading space removed
fn data_payload(line: &[u8]) -> Option<&[u8]> {
    let payload = line.strip_prefix(b"data:")?;
    Some(payload.strip_prefix(b" ").unwrap_or(payload))
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let len = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..len]
}

// ============================================================================
// Observation
// ============================================================================

/// Why observation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Upstream sent the `[DONE]` sentinel
    Done,
    /// The stream ended (or was cut) without a sentinel
    Eof,
}

/// Drives line splitting and scanning over the observer side of the tee
#[derive(Debug, Clone, Copy)]
pub struct StreamObserver {
    pub max_response_bytes: usize,
    pub max_line_bytes: usize,
}

impl Default for StreamObserver {
    fn default() -> Self {
        Self {
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl StreamObserver {
    /// Consume `chunks` into `event` and drop them at the first `[DONE]`.
    ///
    /// Never fails: a stream cut short leaves the event with whatever was
    /// parsed so far.
    pub async fn observe<S>(&self, mut chunks: S, event: &mut Event) -> StreamEnd
    where
        S: Stream<Item = Bytes> + Unpin,
    {
        let mut lines = LineSplitter::new(self.max_line_bytes);
        let mut scan = SseScan::new(self.max_response_bytes);
        let mut end = StreamEnd::Eof;

        'read: while let Some(chunk) = chunks.next().await {
            lines.feed(&chunk);
            while let Some(line) = lines.next_line() {
                if scan.process_line(&line, event).is_break() {
                    end = StreamEnd::Done;
                    break 'read;
                }
            }
        }
        drop(chunks);

        if end == StreamEnd::Eof {
            if let Some(line) = lines.finish() {
                if scan.process_line(&line, event).is_break() {
                    end = StreamEnd::Done;
                }
            }
        }

        if scan.is_truncated() {
            tracing::debug!(trace_id = %event.trace_id, "Response transcript truncated");
        }
        event.response = scan.into_response();
        end
    }
}
