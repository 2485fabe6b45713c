//! Line-buffering parser for server-sent-event streams.
//!
//! TCP chunk boundaries do not align with SSE event boundaries: one chunk
//! may carry several events, and a JSON payload may be split across two
//! chunks. The buffer accumulates partial lines and only emits events for
//! complete lines.

/// A parsed event from the provider stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the prefix stripped.
    Data(String),
    /// The `[DONE]` termination marker used by OpenAI-style streams.
    Done,
}

/// Accumulates raw bytes and yields complete SSE events.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every event completed by it. A
    /// trailing partial line stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']).trim();

            if line.is_empty() {
                continue; // event separator
            }
            if line == "data: [DONE]" {
                events.push(SseEvent::Done);
                continue;
            }
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim_start();
                if !payload.is_empty() {
                    events.push(SseEvent::Data(payload.to_string()));
                }
            }
            // Other SSE fields (event:, id:, retry:, comments) are ignored.
        }

        events
    }
}
