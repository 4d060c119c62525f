//! Semantic events decoded from parsed frames.
//!
//! [`StreamEvent`] is the closed set of things an SSE chat stream can tell the turn
//! accumulator. [`LiveEvent`] is the closed set of messages a live WebSocket relay can
//! deliver. Both are produced from a [`ParsedFrame`] so the reducers downstream never touch
//! raw JSON.
//!
//! Decoding errors follow the crate taxonomy: a payload whose fields have the wrong shape
//! is an [`Error::Parse`] (drop the frame, keep streaming), while a well-formed frame that
//! breaks the event contract, such as a `function_call` without any call in it, is an
//! [`Error::Protocol`].

use crate::parser::ParsedFrame;
use crate::types::{
    CodeExecutionResult, ExecutableCode, FunctionCall, FunctionResult, InlineData, TurnMetadata,
    UsageMetadata,
};
use crate::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// One unit of change to an in-flight model turn
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text token(s); `thought` marks reasoning text
    TextDelta { text: String, thought: bool },
    InlineImage(InlineData),
    ExecutableCode(ExecutableCode),
    CodeExecutionResult(CodeExecutionResult),
    /// Search provenance, attached to the turn rather than its parts
    Grounding(Value),
    UrlContext(Value),
    FunctionCall(FunctionCall),
    FunctionResult(FunctionResult),
    /// Resolved output of an image function
    ImageResult {
        function_name: Option<String>,
        image: InlineData,
    },
    /// Mid-stream metadata, buffered until the turn finalizes
    Metadata(TurnMetadata),
    /// Terminal marker
    Done(TurnMetadata),
    /// Upstream failure reported in-band
    Error { message: String },
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent::TextDelta {
            text: text.into(),
            thought: false,
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        StreamEvent::TextDelta {
            text: text.into(),
            thought: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::Error { .. })
    }

    /// Decodes one SSE frame into zero or more events.
    ///
    /// Unknown event names are ignored.
    pub fn from_frame(frame: &ParsedFrame) -> Result<Vec<StreamEvent>> {
        let data = &frame.data;
        match frame.event.as_str() {
            "message" => {
                let mut events = Self::from_api_part(data)?;
                if let Some(grounding) = non_null(data.get("groundingMetadata")) {
                    events.push(StreamEvent::Grounding(grounding.clone()));
                }
                if let Some(url_context) = non_null(data.get("urlContextMetadata")) {
                    events.push(StreamEvent::UrlContext(url_context.clone()));
                }
                if let Some(metadata) = metadata_from(data)? {
                    events.push(StreamEvent::Metadata(metadata));
                }
                Ok(events)
            }
            "function_call" => {
                let calls = function_calls_from(data)?;
                if calls.is_empty() {
                    return Err(Error::protocol("function_call frame carries no call"));
                }
                Ok(calls.into_iter().map(StreamEvent::FunctionCall).collect())
            }
            "function_result" => {
                if let Some(nested) = non_null(data.get("functionResult")) {
                    return Ok(vec![StreamEvent::FunctionResult(decode(
                        nested,
                        "functionResult",
                    )?)]);
                }
                let name = data
                    .pointer("/functionCall/name")
                    .or_else(|| data.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::protocol("function_result frame has no function name"))?;
                let result = data
                    .get("result")
                    .or_else(|| data.get("response"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(vec![StreamEvent::FunctionResult(FunctionResult {
                    name: name.to_string(),
                    result,
                })])
            }
            "image_result" => {
                let inline = data
                    .get("inlineData")
                    .ok_or_else(|| Error::protocol("image_result frame has no inlineData"))?;
                let image: InlineData = decode(inline, "inlineData")?;
                let function_name = data
                    .get("functionName")
                    .or_else(|| data.pointer("/functionCall/name"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(vec![StreamEvent::ImageResult {
                    function_name,
                    image,
                }])
            }
            "grounding" => {
                let grounding = data.get("groundingMetadata").unwrap_or(data);
                if grounding.is_null() {
                    return Ok(Vec::new());
                }
                Ok(vec![StreamEvent::Grounding(grounding.clone())])
            }
            "url_context" => {
                let url_context = data.get("urlContextMetadata").unwrap_or(data);
                if url_context.is_null() {
                    return Ok(Vec::new());
                }
                Ok(vec![StreamEvent::UrlContext(url_context.clone())])
            }
            "done" => Ok(vec![StreamEvent::Done(
                metadata_from(data)?.unwrap_or_default(),
            )]),
            "error" => Ok(vec![StreamEvent::Error {
                message: error_message(data),
            }]),
            other => {
                log::debug!("Ignoring unknown stream event: {}", other);
                Ok(Vec::new())
            }
        }
    }

    /// Decodes one upstream API part (`{text}`, `{inlineData}`, `{functionCall}`, ...).
    ///
    /// Used for `data:` frames, non-streaming responses, and live `modelTurn` parts.
    pub fn from_api_part(part: &Value) -> Result<Vec<StreamEvent>> {
        let Some(object) = part.as_object() else {
            return Err(Error::parse("part payload is not a JSON object"));
        };

        let mut events = Vec::new();
        let thought = object.get("thought").and_then(Value::as_bool).unwrap_or(false);

        if let Some(text) = object.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta {
                    text: text.to_string(),
                    thought,
                });
            }
        }
        if let Some(inline) = non_null(object.get("inlineData")) {
            events.push(StreamEvent::InlineImage(decode(inline, "inlineData")?));
        }
        if let Some(file) = non_null(object.get("fileData")) {
            let mime_type = file
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream");
            if let Some(uri) = file.get("fileUri").and_then(Value::as_str) {
                events.push(StreamEvent::InlineImage(InlineData::from_uri(mime_type, uri)));
            }
        }
        if let Some(code) = non_null(object.get("executableCode")) {
            events.push(StreamEvent::ExecutableCode(decode(code, "executableCode")?));
        }
        if let Some(result) = non_null(object.get("codeExecutionResult")) {
            events.push(StreamEvent::CodeExecutionResult(decode(
                result,
                "codeExecutionResult",
            )?));
        }
        if let Some(call) = non_null(object.get("functionCall")) {
            events.push(StreamEvent::FunctionCall(decode(call, "functionCall")?));
        }
        if let Some(response) = non_null(object.get("functionResponse")) {
            let name = response
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::parse("functionResponse without a name"))?;
            events.push(StreamEvent::FunctionResult(FunctionResult {
                name: name.to_string(),
                result: response.get("response").cloned().unwrap_or(Value::Null),
            }));
        }

        Ok(events)
    }
}

/// Server content from a live `serverContent` message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContent {
    /// Displayable model parts, in arrival order
    pub parts: Vec<StreamEvent>,
    /// Audio chunks for playback, never stored as parts
    pub audio: Vec<InlineData>,
    pub turn_complete: bool,
    pub generation_complete: bool,
    pub interrupted: bool,
    pub input_transcription: Option<String>,
    pub output_transcription: Option<String>,
    pub grounding: Option<Value>,
}

impl ServerContent {
    /// True when the model turn has ended
    pub fn is_turn_end(&self) -> bool {
        self.turn_complete || self.generation_complete
    }

    fn from_value(value: &Value) -> Result<Self> {
        let mut content = ServerContent {
            turn_complete: flag(value, "turnComplete"),
            generation_complete: flag(value, "generationComplete"),
            interrupted: flag(value, "interrupted"),
            input_transcription: transcription(value, "inputTranscription"),
            output_transcription: transcription(value, "outputTranscription"),
            grounding: non_null(value.get("groundingMetadata")).cloned(),
            ..Default::default()
        };

        if let Some(parts) = value.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for part in parts {
                for event in StreamEvent::from_api_part(part)? {
                    match event {
                        StreamEvent::InlineImage(inline) if inline.is_audio() => {
                            content.audio.push(inline)
                        }
                        other => content.parts.push(other),
                    }
                }
            }
        }

        Ok(content)
    }
}

/// One message from the live relay, as a closed set
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Relay accepted the socket, upstream still pending
    BackendConnected,
    /// Relay reached the upstream model (informational)
    RelayConnected,
    RelayError { message: String },
    RelayClosed {
        code: Option<u16>,
        reason: Option<String>,
    },
    /// Upstream acknowledged the session configuration
    SetupComplete,
    ServerContent(ServerContent),
    /// Upstream asked for tool execution
    ToolCall { calls: Vec<FunctionCall> },
    ToolCallStarted { calls: Vec<FunctionCall> },
    ToolCallResult { name: String, result: Value },
    ToolCallError { name: String, error: String },
    ImageGenerated {
        edited: bool,
        image: InlineData,
        description: Option<String>,
    },
    MapDisplayUpdate(Value),
    SessionResumptionUpdate { new_handle: Option<String> },
    Usage(UsageMetadata),
    /// Upstream is about to end the session
    GoAway { time_left: Option<String> },
    /// Raw audio from a binary message
    Audio(Bytes),
    Unknown(Value),
}

impl LiveEvent {
    /// Decodes a text-message frame.
    ///
    /// Relay meta-events (named by an `event` field) are dispatched before upstream content.
    pub fn from_frame(frame: &ParsedFrame) -> Result<LiveEvent> {
        let data = &frame.data;
        let event = match frame.event.as_str() {
            "backend_connected" => LiveEvent::BackendConnected,
            "connected" => LiveEvent::RelayConnected,
            "error" => LiveEvent::RelayError {
                message: data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
            },
            "closed" => LiveEvent::RelayClosed {
                code: data
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok()),
                reason: data
                    .get("reason")
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string),
            },
            "tool_call_started" => LiveEvent::ToolCallStarted {
                calls: match data.get("calls") {
                    Some(calls) => decode(calls, "calls")?,
                    None => Vec::new(),
                },
            },
            "tool_call_result" => LiveEvent::ToolCallResult {
                name: required_str(data, "name")?,
                result: data.get("result").cloned().unwrap_or(Value::Null),
            },
            "tool_call_error" => LiveEvent::ToolCallError {
                name: required_str(data, "name")?,
                error: match data.get("error") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "Unknown error".to_string(),
                },
            },
            "imageGenerated" | "imageEdited" => {
                let image_data = required_str(data, "imageData")?;
                let mime_type = data
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                LiveEvent::ImageGenerated {
                    edited: frame.event == "imageEdited",
                    image: InlineData::from_base64(mime_type, image_data),
                    description: data
                        .get("description")
                        .and_then(Value::as_str)
                        .filter(|d| !d.is_empty())
                        .map(str::to_string),
                }
            }
            "map_display_update" => {
                LiveEvent::MapDisplayUpdate(data.get("mapData").cloned().unwrap_or(Value::Null))
            }
            _ => Self::from_upstream(data)?,
        };
        Ok(event)
    }

    /// Wraps a binary message
    pub fn from_binary(bytes: impl Into<Bytes>) -> LiveEvent {
        LiveEvent::Audio(bytes.into())
    }

    fn from_upstream(data: &Value) -> Result<LiveEvent> {
        if data.get("setupComplete").is_some() {
            return Ok(LiveEvent::SetupComplete);
        }
        if let Some(content) = non_null(data.get("serverContent")) {
            return Ok(LiveEvent::ServerContent(ServerContent::from_value(content)?));
        }
        if let Some(calls) = non_null(data.pointer("/toolCall/functionCalls")) {
            return Ok(LiveEvent::ToolCall {
                calls: decode(calls, "toolCall.functionCalls")?,
            });
        }
        if let Some(update) = non_null(data.get("sessionResumptionUpdate")) {
            return Ok(LiveEvent::SessionResumptionUpdate {
                new_handle: update
                    .get("newHandle")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        if let Some(usage) = non_null(data.get("usageMetadata")) {
            return Ok(LiveEvent::Usage(decode(usage, "usageMetadata")?));
        }
        if let Some(go_away) = non_null(data.get("goAway")) {
            return Ok(LiveEvent::GoAway {
                time_left: go_away
                    .get("timeLeft")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        Ok(LiveEvent::Unknown(data.clone()))
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn decode<T: DeserializeOwned>(value: &Value, field: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::parse(format!("invalid {}: {}", field, e)))
}

fn required_str(data: &Value, field: &str) -> Result<String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::protocol(format!("missing `{}`", field)))
}

fn flag(value: &Value, field: &str) -> bool {
    value.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn transcription(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(|t| t.get("text"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Collects `functionCalls: [...]` or a single `functionCall`
fn function_calls_from(data: &Value) -> Result<Vec<FunctionCall>> {
    if let Some(calls) = non_null(data.get("functionCalls")) {
        return decode(calls, "functionCalls");
    }
    if let Some(call) = non_null(data.get("functionCall")) {
        return Ok(vec![decode(call, "functionCall")?]);
    }
    Ok(Vec::new())
}

fn metadata_from(data: &Value) -> Result<Option<TurnMetadata>> {
    let finish_reason = data
        .get("finishReason")
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage_metadata = match non_null(data.get("usageMetadata")) {
        Some(usage) => Some(decode::<UsageMetadata>(usage, "usageMetadata")?),
        None => None,
    };
    let safety_ratings = non_null(data.get("safetyRatings")).cloned();

    if finish_reason.is_none() && usage_metadata.is_none() && safety_ratings.is_none() {
        return Ok(None);
    }
    Ok(Some(TurnMetadata {
        finish_reason,
        usage_metadata,
        safety_ratings,
    }))
}

fn error_message(data: &Value) -> String {
    let message = match data.get("error") {
        Some(Value::String(message)) => Some(message.clone()),
        Some(error) => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        None => data
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    message.unwrap_or_else(|| "Unknown stream error event".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, data: Value) -> ParsedFrame {
        ParsedFrame::new(event, data)
    }

    #[test]
    fn test_text_and_thought() {
        let events = StreamEvent::from_frame(&ParsedFrame::message(json!({ "text": "Hi" }))).unwrap();
        assert_eq!(events, vec![StreamEvent::text("Hi")]);

        let events = StreamEvent::from_frame(&ParsedFrame::message(
            json!({ "text": "hmm", "thought": true }),
        ))
        .unwrap();
        assert_eq!(events, vec![StreamEvent::thought("hmm")]);
    }

    #[test]
    fn test_message_with_metadata() {
        let events = StreamEvent::from_frame(&ParsedFrame::message(json!({
            "finishReason": "STOP",
            "usageMetadata": { "promptTokenCount": 3, "totalTokenCount": 9 }
        })))
        .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Metadata(meta) => {
                assert_eq!(meta.finish_reason.as_deref(), Some("STOP"));
                assert_eq!(meta.usage_metadata.as_ref().unwrap().total_token_count, Some(9));
            }
            other => panic!("Expected metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_function_call_batch_from_backend() {
        let events = StreamEvent::from_frame(&frame(
            "function_call",
            json!({ "functionCalls": [
                { "name": "getWeather", "args": { "city": "Oslo" } },
                { "name": "generateImage", "args": {} }
            ] }),
        ))
        .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], StreamEvent::FunctionCall(c) if c.name == "generateImage"));
    }

    #[test]
    fn test_function_call_without_call_is_protocol_error() {
        let err = StreamEvent::from_frame(&frame("function_call", json!({}))).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_function_result_shapes() {
        let events = StreamEvent::from_frame(&frame(
            "function_result",
            json!({ "functionCall": { "name": "getWeather" }, "result": { "temp": 4 } }),
        ))
        .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::FunctionResult(FunctionResult {
                name: "getWeather".to_string(),
                result: json!({ "temp": 4 }),
            })]
        );

        let events = StreamEvent::from_frame(&frame(
            "function_result",
            json!({ "functionResult": { "name": "lookup", "result": [1, 2] } }),
        ))
        .unwrap();
        assert!(matches!(&events[0], StreamEvent::FunctionResult(r) if r.name == "lookup"));

        let err = StreamEvent::from_frame(&frame("function_result", json!({ "result": 1 })))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_image_result() {
        let events = StreamEvent::from_frame(&frame(
            "image_result",
            json!({ "inlineData": { "mimeType": "image/png", "data": "AAA" } }),
        ))
        .unwrap();
        match &events[0] {
            StreamEvent::ImageResult { function_name, image } => {
                assert!(function_name.is_none());
                assert!(image.is_image());
            }
            other => panic!("Expected image result, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_inline_data_is_parse_error() {
        let err = StreamEvent::from_frame(&ParsedFrame::message(json!({ "inlineData": 5 })))
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_done_and_error() {
        let events = StreamEvent::from_frame(&frame("done", Value::Null)).unwrap();
        assert_eq!(events, vec![StreamEvent::Done(TurnMetadata::default())]);

        let events = StreamEvent::from_frame(&frame(
            "error",
            json!({ "error": { "message": "quota exceeded", "code": 429 } }),
        ))
        .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "quota exceeded".to_string()
            }]
        );
    }

    #[test]
    fn test_unknown_event_ignored() {
        let events = StreamEvent::from_frame(&frame("heartbeat", json!({}))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_live_meta_events() {
        let event = LiveEvent::from_frame(&frame("closed", json!({ "event": "closed", "code": 1011 })))
            .unwrap();
        assert_eq!(
            event,
            LiveEvent::RelayClosed {
                code: Some(1011),
                reason: None
            }
        );

        let event = LiveEvent::from_frame(&frame(
            "error",
            json!({ "event": "error", "message": "upstream refused" }),
        ))
        .unwrap();
        assert_eq!(
            event,
            LiveEvent::RelayError {
                message: "upstream refused".to_string()
            }
        );
    }

    #[test]
    fn test_live_server_content_splits_audio() {
        let event = LiveEvent::from_frame(&ParsedFrame::message(json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "text": "Hi" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } }
                ] },
                "outputTranscription": { "text": "Hi" },
                "turnComplete": true
            }
        })))
        .unwrap();

        match event {
            LiveEvent::ServerContent(content) => {
                assert_eq!(content.parts, vec![StreamEvent::text("Hi")]);
                assert_eq!(content.audio.len(), 1);
                assert!(content.is_turn_end());
                assert_eq!(content.output_transcription.as_deref(), Some("Hi"));
            }
            other => panic!("Expected server content, got {:?}", other),
        }
    }

    #[test]
    fn test_live_upstream_messages() {
        assert_eq!(
            LiveEvent::from_frame(&ParsedFrame::message(json!({ "setupComplete": {} }))).unwrap(),
            LiveEvent::SetupComplete
        );
        assert_eq!(
            LiveEvent::from_frame(&ParsedFrame::message(
                json!({ "sessionResumptionUpdate": { "newHandle": "h2", "resumable": true } })
            ))
            .unwrap(),
            LiveEvent::SessionResumptionUpdate {
                new_handle: Some("h2".to_string())
            }
        );
        assert_eq!(
            LiveEvent::from_frame(&ParsedFrame::message(json!({ "goAway": { "timeLeft": "10s" } })))
                .unwrap(),
            LiveEvent::GoAway {
                time_left: Some("10s".to_string())
            }
        );
        assert!(matches!(
            LiveEvent::from_frame(&ParsedFrame::message(json!({ "somethingNew": 1 }))).unwrap(),
            LiveEvent::Unknown(_)
        ));
    }

    #[test]
    fn test_live_image_generated() {
        let event = LiveEvent::from_frame(&frame(
            "imageEdited",
            json!({ "event": "imageEdited", "imageData": "BBBB", "description": "" }),
        ))
        .unwrap();
        match event {
            LiveEvent::ImageGenerated {
                edited,
                image,
                description,
            } => {
                assert!(edited);
                assert_eq!(image.mime_type, "image/png");
                assert!(description.is_none());
            }
            other => panic!("Expected image event, got {:?}", other),
        }
    }
}
