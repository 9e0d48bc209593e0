use bytes::{Buf, BytesMut};
use serde_json::Value;

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Message(Value),
    /// A `data:` line whose payload was not JSON. The stream keeps going.
    Invalid { line: String, error: String },
    Done,
}

/// Incremental decoder for `text/event-stream` bodies carrying JSON payloads.
///
/// Chunks may split lines anywhere; incomplete lines stay buffered until the
/// next chunk. Once `[DONE]` is seen the decoder ignores all further input.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    /// Leading bytes of `buffer` already known to hold no newline.
    scanned: usize,
    done: bool,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(self.scanned + offset);
            self.buffer.advance(1);
            self.scanned = 0;
            if let Some(event) = decode_line(&line) {
                let finished = event == SseEvent::Done;
                events.push(event);
                if finished {
                    self.done = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        self.scanned = self.buffer.len();
        events
    }

    /// Flushes a trailing line that was not terminated by a newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.done || self.buffer.is_empty() {
            return None;
        }
        let line = self.buffer.split();
        self.scanned = 0;
        let event = decode_line(&line);
        if event == Some(SseEvent::Done) {
            self.done = true;
        }
        event
    }
}

fn decode_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.strip_suffix('\r').unwrap_or(&line);
    let data = line.strip_prefix(DATA_PREFIX)?;
    if data.trim() == DONE_MARKER {
        return Some(SseEvent::Done);
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => Some(SseEvent::Message(value)),
        Err(err) => Some(SseEvent::Invalid {
            line: data.to_owned(),
            error: err.to_string(),
        }),
    }
}
