//! Incremental `text/event-stream` parser
//!
//! Bytes arrive in arbitrary chunks; [`SseParser::feed`] buffers partial lines
//! and returns every event completed by the chunk. Events are terminated by a
//! blank line, `:` lines are comments, and an event without an `event:` field
//! has type `"message"`.
//!
//! ```rust
//! use mcp_conduit::mcp::sse::SseParser;
//!
//! let mut parser = SseParser::new();
//! let events = parser.feed(b"id: 4\ndata: {\"ok\":true}\n\n");
//! assert_eq!(events[0].event_type, "message");
//! assert_eq!(parser.last_event_id(), Some("4"));
//! ```

use bytes::{Buf, BytesMut};

const DEFAULT_EVENT_TYPE: &str = "message";

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: String,
    /// Data lines joined with `\n`
    pub data: String,
    pub id: Option<String>,
    /// Reconnection delay hint in milliseconds
    pub retry: Option<u64>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    event_type: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
    last_event_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect the events it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(newline);
            self.buffer.advance(1);

            let text = String::from_utf8_lossy(&line);
            let text = text.strip_suffix('\r').unwrap_or(text.as_ref());
            if let Some(event) = self.process_line(text) {
                events.push(event);
            }
        }

        events
    }

    /// Flush a trailing event when the stream ends without a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    /// Most recent `id:` seen, for `Last-Event-ID` on reconnect
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(retry) = value.parse() {
                    self.retry = Some(retry);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event_type = self.event_type.take();
        let id = self.id.take();
        let retry = self.retry.take();

        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event_type: event_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data,
            id,
            retry,
        })
    }
}

/// Parse a complete event-stream body
pub fn parse_events(body: &[u8]) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.feed(body);
    events.extend(parser.finish());
    events
}
