//! Incremental parser for `text/event-stream` bodies.

use log::warn;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the stream did not name it.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Longest line kept; anything longer is dropped whole.
pub const MAX_LINE_LEN: usize = 64 * 1024;
/// Largest `data` payload of one event.
pub const MAX_EVENT_DATA_LEN: usize = 1024 * 1024;

/// Line-oriented event-stream parser.
///
/// Bytes can be fed in arbitrary chunks; events are returned once their
/// terminating blank line has been seen. Lines end in `\n`, `\r\n` or a
/// bare `\r`.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// The previous chunk ended in `\r`; a leading `\n` belongs to it.
    pending_cr: bool,
    /// The current line outgrew [`MAX_LINE_LEN`].
    overflowed: bool,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    /// The current event outgrew [`MAX_EVENT_DATA_LEN`].
    discarding: bool,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if std::mem::take(&mut self.pending_cr) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\r' | b'\n' => {
                    self.pending_cr = byte == b'\r';
                    let line = std::mem::take(&mut self.buffer);
                    if std::mem::take(&mut self.overflowed) {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&line).into_owned();
                    if let Some(event) = self.process_line(&line) {
                        events.push(event);
                    }
                }
                _ if self.overflowed => {}
                _ if self.buffer.len() >= MAX_LINE_LEN => {
                    warn!(target: "Call/Sse", "Dropping event-stream line longer than {MAX_LINE_LEN} bytes");
                    self.buffer = Vec::new();
                    self.overflowed = true;
                }
                _ => self.buffer.push(byte),
            }
        }
        events
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
            "event" => self.event = Some(value.to_string()),
            "data" => self.push_data(value),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn push_data(&mut self, value: &str) {
        if self.discarding {
            return;
        }
        self.data_len += value.len() + 1;
        if self.data_len > MAX_EVENT_DATA_LEN {
            warn!(target: "Call/Sse", "Dropping event with more than {MAX_EVENT_DATA_LEN} bytes of data");
            self.data.clear();
            self.discarding = true;
            return;
        }
        self.data.push(value.to_string());
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        self.data_len = 0;
        if std::mem::take(&mut self.discarding) || self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id: self.id.clone(),
        })
    }
}
