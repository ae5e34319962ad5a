//! Incremental server-sent events codec.
//!
//! Upstream stages stream `data: {json}\n\n` records over chunked HTTP bodies.
//! Network reads do not respect record boundaries, so [`SseDecoder`] keeps an
//! accumulation buffer and only ever surfaces complete blocks.

use bytes::Bytes;
use serde_json::Value;

use crate::error::DecodeError;

/// Longest slice of an offending payload kept in a decode error.
const MAX_ERROR_SNIPPET: usize = 200;

/// One complete SSE record whose data parsed as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Value,
}

impl SseEvent {
    pub fn new(data: Value) -> Self {
        SseEvent { event: None, data }
    }

    /// Upstream status word: the `status` field, then `type`, then the SSE
    /// event name.
    pub fn status(&self) -> Option<&str> {
        self.data
            .get("status")
            .and_then(Value::as_str)
            .or_else(|| self.data.get("type").and_then(Value::as_str))
            .or(self.event.as_deref())
    }
}

/// Turns arbitrarily chunked bytes into complete [`SseEvent`]s.
///
/// One decoder per connection. Malformed blocks are logged and counted, never
/// returned as errors.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    // bytes of `pending` already searched for a delimiter
    scanned: usize,
    dropped: u64,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw frame and return every block it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        // CRLF streams become LF streams; JSON never carries a raw CR
        self.pending
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(block) = self.next_block() {
            match parse_block(&block) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    self.dropped += 1;
                    log::warn!("Dropping malformed SSE message: {}", e);
                }
            }
        }
        events
    }

    fn next_block(&mut self) -> Option<Vec<u8>> {
        let from = self.scanned.saturating_sub(1);
        match self.pending[from..].windows(2).position(|w| w == b"\n\n") {
            Some(offset) => {
                let pos = from + offset;
                let block = self.pending[..pos].to_vec();
                self.pending.drain(..pos + 2);
                self.scanned = 0;
                Some(block)
            }
            None => {
                self.scanned = self.pending.len();
                None
            }
        }
    }

    /// Number of blocks dropped so far on this connection.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes waiting for a delimiter.
    pub fn residual_len(&self) -> usize {
        self.pending.len()
    }

    /// Discard whatever is left once the connection closed. Returns the number
    /// of bytes thrown away.
    pub fn finish(&mut self) -> usize {
        let residual = self.pending.len();
        if self.pending.iter().any(|b| !b.is_ascii_whitespace()) {
            log::warn!(
                "Discarding {} bytes of unterminated SSE data at end of stream",
                residual
            );
        }
        self.pending.clear();
        self.scanned = 0;
        residual
    }
}

/// Parse one delimiter-free block. `Ok(None)` for blank or comment-only blocks.
pub fn parse_block(block: &[u8]) -> Result<Option<SseEvent>, DecodeError> {
    let text = std::str::from_utf8(block).map_err(|_| DecodeError::InvalidUtf8)?;

    let mut event = None;
    let mut data: Option<String> = None;
    let mut other_fields = false;

    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            "event" => event = Some(value.to_string()),
            _ => other_fields = true,
        }
    }

    let Some(data) = data else {
        return if other_fields || event.is_some() {
            Err(DecodeError::MissingData(snippet(text)))
        } else {
            Ok(None)
        };
    };

    let value = serde_json::from_str(&data).map_err(|e| DecodeError::InvalidJson {
        reason: e.to_string(),
        data: snippet(&data),
    })?;
    Ok(Some(SseEvent { event, data: value }))
}

/// Frame one JSON record for the wire.
pub fn encode_event(data: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", data))
}

fn snippet(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_SNIPPET) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
