//! Task offer stream decoding
//!
//! The broker pushes server-sent events. Bytes arrive in arbitrary chunks,
//! so frames are reassembled here before being decoded into a closed
//! [`StreamEvent`] union.

use super::types::Task;
use serde_json::Value;

/// One raw server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Largest frame the decoder will hold before giving up on it
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental SSE frame decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a separator
    scanned: usize,
    /// Skipping the rest of an oversized frame
    discarding: bool,
}

impl SseDecoder {
    /// Feed a chunk and return every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        let mut start = 0;
        // Step back one byte so a separator split across chunks is found
        let mut from = self.scanned.saturating_sub(1);
        while let Some(offset) = find_separator(&self.buffer[from..]) {
            let end = from + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                let block = String::from_utf8_lossy(&self.buffer[start..end]);
                frames.extend(parse_block(&block));
            }
            start = end + 2;
            from = start;
        }
        self.buffer.drain(..start);

        if !self.discarding && self.buffer.len() > MAX_FRAME_BYTES {
            tracing::warn!(bytes = self.buffer.len(), "Dropping oversized stream frame");
            self.discarding = true;
        }
        if self.discarding {
            // The last byte may open the separator that ends the frame
            let tail = self.buffer.len().saturating_sub(1);
            self.buffer.drain(..tail);
        }
        self.scanned = self.buffer.len();
        frames
    }
}

fn find_separator(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.join("\n"),
    })
}

/// Events the worker understands. Anything else decodes to `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TaskOffer(Task),
    Connected { worker_id: Option<String> },
    Heartbeat,
    Unknown { event: String },
}

impl StreamEvent {
    /// Decode a frame. Returns `None` for a malformed payload, which the
    /// caller drops without closing the stream.
    pub fn decode(frame: &SseFrame) -> Option<Self> {
        let data = frame.data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Some(Self::from_tag(frame.event.as_deref().unwrap_or("message")));
        }

        let payload: Value = serde_json::from_str(data).ok()?;
        let tag = frame
            .event
            .clone()
            .or_else(|| payload.get("type").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "message".to_string());

        match tag.as_str() {
            "task_available" | "task" | "task_assigned" => {
                Task::from_payload(&payload).map(Self::TaskOffer)
            }
            "connected" => Some(Self::Connected {
                worker_id: payload
                    .get("worker_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            // Untagged frames that carry a task are offers too
            "message" => Some(
                Task::from_payload(&payload)
                    .map(Self::TaskOffer)
                    .unwrap_or(Self::Unknown { event: tag }),
            ),
            other => Some(Self::from_tag(other)),
        }
    }

    fn from_tag(tag: &str) -> Self {
        match tag {
            "heartbeat" | "ping" | "keepalive" => Self::Heartbeat,
            "connected" => Self::Connected { worker_id: None },
            other => Self::Unknown {
                event: other.to_string(),
            },
        }
    }
}
