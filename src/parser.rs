//! Frame parsing for SSE chunk streams and WebSocket messages.
//!
//! The backend streams chat responses as Server-Sent Events over a chunked HTTP body:
//!
//! ```text
//! data: {"text":"Hel"}
//!
//! data: {"text":"lo"}
//!
//! event: function_call
//! data: {"functionCall":{"name":"generateImage","args":{}}}
//!
//! event: done
//! data: {"finishReason":"STOP"}
//! ```
//!
//! Network reads do not respect frame boundaries. One read may carry half a frame, several
//! frames, or split a multi-byte UTF-8 character in two. [`SseFrameParser`] keeps a growing
//! buffer and only emits a [`ParsedFrame`] once its double-newline delimiter has arrived.
//!
//! ```text
//! Raw byte chunks
//!     │
//!     │ SseFrameParser::feed()      (zero or more frames per call)
//!     │ SseFrameParser::flush()     (trailing frame without delimiter)
//!     ▼
//! ParsedFrame { event, data }
//! ```
//!
//! # Decoding rules
//!
//! - An `event:` line names the frame. Frames without one are named `message`.
//! - `data:` lines are joined with newlines and decoded as one JSON value.
//! - Comment lines (leading `:`) and `id:`/`retry:` fields are ignored.
//! - Malformed JSON is logged and the frame is dropped. The stream keeps going.
//!
//! WebSocket messages are already discrete, so [`parse_ws_text`] decodes each text message
//! as a single JSON object. Relay meta-events (`backend_connected`, `connected`, `error`,
//! `closed`, ...) carry their name in an `event` field inside the payload, which becomes the
//! frame's event name. Binary messages never reach this module; they are raw audio.

use serde_json::Value;

/// Event name used when a frame carries no `event:` line
pub const DEFAULT_EVENT: &str = "message";

/// One decoded network event, consumed immediately by the turn accumulator
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    /// Frame name (`message` unless an `event:` line or payload field says otherwise)
    pub event: String,
    /// Decoded JSON payload, `Null` for frames without data
    pub data: Value,
}

impl ParsedFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// A default-named frame
    pub fn message(data: Value) -> Self {
        Self::new(DEFAULT_EVENT, data)
    }

    pub fn is_message(&self) -> bool {
        self.event == DEFAULT_EVENT
    }
}

/// Incremental SSE parser.
///
/// # State
///
/// - `buffer` holds decoded text that has not yet formed a complete frame.
/// - `pending` holds the tail of a UTF-8 sequence split across two reads.
/// - `after_cr` records that the last read ended in `\r`.
///
/// Both are drained as frames are emitted, so memory use is bounded by the largest
/// single frame rather than the stream length.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: String,
    pending: Vec<u8>,
    after_cr: bool,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network chunk and returns every frame it completed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use apsara_stream::SseFrameParser;
    ///
    /// let mut parser = SseFrameParser::new();
    /// assert!(parser.feed(b"data: {\"te").is_empty());
    /// let frames = parser.feed(b"xt\":\"Hi\"}\n\n");
    /// assert_eq!(frames.len(), 1);
    /// assert_eq!(frames[0].data["text"], "Hi");
    /// ```
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParsedFrame> {
        self.decode(chunk);
        self.drain_complete()
    }

    /// Emits the frame left in the buffer when the source completes.
    ///
    /// Any incomplete UTF-8 tail is replaced with U+FFFD rather than discarded.
    pub fn flush(&mut self) -> Vec<ParsedFrame> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }

        let mut frames = self.drain_complete();
        let rest = std::mem::take(&mut self.buffer);
        if !rest.trim().is_empty() {
            frames.extend(parse_block(&rest));
        }
        frames
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.buffer.trim().is_empty()
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        let mut decoded = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    decoded.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending[start..valid_end]) {
                        decoded.push_str(text);
                    }
                    match e.error_len() {
                        // Invalid sequence in the middle of the input
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        // Truncated sequence at the end, wait for the next chunk
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        self.push_normalized(&decoded);
    }

    /// Appends `text` with `\r\n` and lone `\r` line endings rewritten to `\n`.
    ///
    /// A chunk ending in `\r` is treated as a line end right away. A `\n` opening the
    /// next chunk then belongs to that same line end and is skipped.
    fn push_normalized(&mut self, text: &str) {
        let mut chars = text.chars().peekable();
        if self.after_cr && chars.peek() == Some(&'\n') {
            chars.next();
        }
        if !text.is_empty() {
            self.after_cr = text.ends_with('\r');
        }

        while let Some(c) = chars.next() {
            if c == '\r' {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                self.buffer.push('\n');
            } else {
                self.buffer.push(c);
            }
        }
    }

    fn drain_complete(&mut self) -> Vec<ParsedFrame> {
        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..idx + 2).collect();
            frames.extend(parse_block(&block[..idx]));
        }
        frames
    }
}

/// Parses one delimiter-free SSE block
fn parse_block(block: &str) -> Option<ParsedFrame> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => event = Some(value.trim().to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    let event = event
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_EVENT.to_string());

    if data_lines.is_empty() {
        return Some(ParsedFrame::new(event, Value::Null));
    }

    let payload = data_lines.join("\n");
    match serde_json::from_str::<Value>(&payload) {
        Ok(data) => Some(ParsedFrame::new(event, data)),
        Err(e) => {
            log::warn!("Dropping malformed SSE frame ({}): {}", event, e);
            None
        }
    }
}

/// Decodes one WebSocket text message.
///
/// Returns `None` for malformed JSON (logged, not fatal) and for empty messages.
pub fn parse_ws_text(text: &str) -> Option<ParsedFrame> {
    if text.trim().is_empty() {
        log::warn!("Received empty WebSocket message");
        return None;
    }

    match serde_json::from_str::<Value>(text) {
        Ok(data) => {
            let event = data
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_EVENT)
                .to_string();
            Some(ParsedFrame::new(event, data))
        }
        Err(e) => {
            log::warn!("Dropping malformed WebSocket message: {}", e);
            None
        }
    }
}
