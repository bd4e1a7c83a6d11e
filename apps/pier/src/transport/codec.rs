//! Framing for inbound JSON-RPC traffic.
//!
//! WebSocket frames are self-delimiting, so [`decode_text_frame`] only has to
//! cope with peers that pack several newline-separated messages into one
//! frame. Raw TCP gives no boundaries at all; [`StreamDecoder`] accumulates
//! bytes and recovers messages with three strategies tried in order on every
//! push: the whole buffer as one message, newline-delimited messages, and a
//! string-aware brace scan that tolerates garbage and partial tails.

use pier_proto::{is_jsonrpc_envelope, WireMessage};
use serde_json::Value;
use tracing::warn;

use crate::error::DecodeError;

/// Bytes a byte-stream peer may leave unresolved before the decoder gives up
/// on the pending object and resynchronises at the next newline.
pub const DEFAULT_MAX_BUFFERED: usize = 8 * 1024 * 1024;

pub type Decoded = Result<WireMessage, DecodeError>;

pub fn encode_message(message: &WireMessage, newline: bool) -> String {
    let mut text = message.to_value().to_string();
    if newline {
        text.push('\n');
    }
    text
}

/// Decode one WebSocket text frame: the whole frame first, then each
/// non-empty line on its own.
pub fn decode_text_frame(text: &str) -> Vec<Decoded> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return vec![classify(value)];
    }
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Value>(line)
                .map_err(|err| DecodeError::Json(err.to_string()))
                .and_then(classify)
        })
        .collect()
}

fn classify(value: Value) -> Decoded {
    WireMessage::from_value(value).map_err(DecodeError::from)
}

#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_BUFFERED)
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    /// Bytes held back waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(bytes);
        let mut out = self.drain();
        if self.buffer.len() > self.limit {
            self.resync();
            out.extend(self.drain());
        }
        out
    }

    /// Drop everything up to and including the next newline, or the whole
    /// buffer when there is none. Recovers from an object that never closes.
    fn resync(&mut self) {
        let dropped = match self.buffer.iter().position(|byte| *byte == b'\n') {
            Some(index) => index + 1,
            None => self.buffer.len(),
        };
        warn!(
            target: "pier::transport",
            dropped,
            limit = self.limit,
            "inbound buffer over limit; discarding unterminated data"
        );
        self.buffer.drain(..dropped);
    }

    fn drain(&mut self) -> Vec<Decoded> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        if let Some(message) = self.take_whole_buffer() {
            return vec![message];
        }
        if let Some(messages) = self.take_lines() {
            return messages;
        }
        self.scan()
    }

    fn take_whole_buffer(&mut self) -> Option<Decoded> {
        let value = serde_json::from_slice::<Value>(&self.buffer).ok()?;
        if !is_jsonrpc_envelope(&value) {
            return None;
        }
        self.buffer.clear();
        Some(classify(value))
    }

    fn take_lines(&mut self) -> Option<Vec<Decoded>> {
        if !self.buffer.contains(&b'\n') {
            return None;
        }
        let mut values = Vec::new();
        for line in self.buffer.split(|byte| *byte == b'\n') {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            let value = serde_json::from_slice::<Value>(line).ok()?;
            if !is_jsonrpc_envelope(&value) {
                return None;
            }
            values.push(value);
        }
        if values.is_empty() {
            return None;
        }
        self.buffer.clear();
        Some(values.into_iter().map(classify).collect())
    }

    /// Walks the buffer from the start. Bytes outside any object are
    /// dropped; each balanced `{...}` span is decoded on its own so one bad
    /// span never poisons its neighbours; an unbalanced tail stays buffered.
    fn scan(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        let mut consumed = 0;
        let mut start: Option<usize> = None;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (index, &byte) in self.buffer.iter().enumerate() {
            let Some(begin) = start else {
                if byte == b'{' {
                    start = Some(index);
                    depth = 1;
                    in_string = false;
                    escaped = false;
                } else {
                    consumed = index + 1;
                }
                continue;
            };

            if in_string {
                if escaped {
                    escaped = false;
                } else if byte == b'\\' {
                    escaped = true;
                } else if byte == b'"' {
                    in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        out.push(decode_span(&self.buffer[begin..=index]));
                        start = None;
                        consumed = index + 1;
                    }
                }
                _ => {}
            }
        }

        self.buffer.drain(..consumed);
        out
    }
}

fn decode_span(span: &[u8]) -> Decoded {
    serde_json::from_slice::<Value>(span)
        .map_err(|err| DecodeError::Json(err.to_string()))
        .and_then(classify)
}
