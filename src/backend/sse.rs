//! Server-Sent Events decoding for remote backends.
//!
//! Remote MCP servers answer either with plain JSON or with an SSE body
//! (`event: …` / `data: …` lines, events separated by a blank line). The
//! legacy SSE transport additionally keeps one long-lived event stream open.

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Event type with the SSE default applied.
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Decode every complete event in `buf`.
///
/// A trailing event without the closing blank line is still returned, which
/// is what a fully-read response body needs.
pub fn decode_sse_events(buf: &str) -> Vec<SseEvent> {
    let mut out = Vec::new();
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in buf.split('\n') {
        let l = line.trim_end_matches('\r');

        if l.is_empty() {
            if !data_lines.is_empty() {
                out.push(SseEvent {
                    event: event.take(),
                    data: data_lines.join("\n"),
                });
                data_lines.clear();
            }
            event = None;
            continue;
        }

        // Comments (keep-alives) start with ':'.
        if l.starts_with(':') {
            continue;
        }

        if let Some(rest) = l.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = l.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        }
    }

    if !data_lines.is_empty() {
        out.push(SseEvent {
            event,
            data: data_lines.join("\n"),
        });
    }

    out
}

/// Incremental decoder for a long-lived event stream.
///
/// Bytes arrive in arbitrary chunks, possibly splitting a UTF-8 sequence.
/// Raw bytes are buffered and only events terminated by a blank line are
/// decoded; the remainder waits for the next chunk.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain all events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer
            .extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            events.extend(decode_sse_events(&String::from_utf8_lossy(&raw)));
        }
        events
    }
}
