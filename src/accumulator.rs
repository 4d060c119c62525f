//! Turn accumulation: folding stream events into one model turn.
//!
//! A [`TurnAccumulator`] is the single writer of an in-flight model [`Turn`]. It consumes
//! [`StreamEvent`]s in arrival order and moves through these states:
//!
//! ```text
//! Empty ──► Accumulating ──► Finalizing ──► Finalized
//!   │            │
//!   └────────────┴──► Aborted | Errored
//! ```
//!
//! # Folding rules
//!
//! - Consecutive text deltas merge into the last text part. Thought text merges only with
//!   thought text, so reasoning and answer never share a part.
//! - Images, executable code, and code results always push a new part.
//! - Grounding and URL-context metadata overwrite side-channel fields on the turn.
//! - A call to an image function pushes an [`ImagePlaceholder`], any other call pushes a
//!   [`Part::FunctionCall`].
//! - A function result replaces the most recent call part with the same name (reverse scan,
//!   first match). Without a match, the result is appended.
//! - An image result replaces the oldest pending placeholder (matching by function name
//!   when the frame carries one). Without a placeholder, the image is appended.
//! - Metadata seen mid-stream is buffered and only attached at finalize, so a finalized
//!   turn's metadata is always one consistent snapshot.
//!
//! Frames that arrive after a terminal state are discarded.

use crate::config::is_image_function;
use crate::event::StreamEvent;
use crate::parser::ParsedFrame;
use crate::types::{
    FunctionResult, ImagePlaceholder, InlineData, Part, Role, Turn, TurnMetadata,
};
use serde_json::Value;

/// Marker appended when the user stops a response
pub const ABORT_MARKER: &str = "[Request stopped by user]";

/// Text given to a turn that finalized without any part
pub const EMPTY_RESPONSE_TEXT: &str = "(Empty Response)";

/// Prefix of the single text part of an errored turn
pub const STREAM_ERROR_PREFIX: &str = "Stream Error: ";

/// Loading text once an image function has returned but its image has not arrived
pub const PROCESSING_IMAGE_TEXT: &str = "Processing image...";

/// Lifecycle of an in-flight turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    Empty,
    Accumulating,
    Finalizing,
    Finalized,
    /// Stopped by the user, distinct from normal completion
    Aborted,
    Errored,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnState::Finalized | TurnState::Aborted | TurnState::Errored
        )
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

/// Single writer of one model turn
#[derive(Debug, Clone)]
pub struct TurnAccumulator {
    turn: Turn,
    state: TurnState,
    pending_metadata: Option<TurnMetadata>,
}

impl Default for TurnAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnAccumulator {
    /// Starts an empty model turn with a fresh id
    pub fn new() -> Self {
        Self::for_turn(Turn::model(Vec::new()))
    }

    /// Starts accumulating into an existing placeholder turn.
    ///
    /// Any parts already on the turn are kept.
    pub fn for_turn(turn: Turn) -> Self {
        let state = if turn.parts.is_empty() {
            TurnState::Empty
        } else {
            TurnState::Accumulating
        };
        Self {
            turn,
            state,
            pending_metadata: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn turn(&self) -> &Turn {
        &self.turn
    }

    /// Independent copy of the current turn for publishing
    pub fn snapshot(&self) -> Turn {
        self.turn.clone()
    }

    pub fn into_turn(self) -> Turn {
        self.turn
    }

    /// Pure form of [`apply`](Self::apply): `(state, event) -> state`
    pub fn reduce(mut self, event: StreamEvent) -> Self {
        self.apply(event);
        self
    }

    /// Decodes and applies one parsed frame, returning the resulting state.
    ///
    /// Malformed payloads are logged and dropped. Contract violations error the turn.
    pub fn apply_frame(&mut self, frame: &ParsedFrame) -> TurnState {
        if self.state.is_terminal() {
            log::debug!("Discarding '{}' frame after terminal state", frame.event);
            return self.state;
        }

        match StreamEvent::from_frame(frame) {
            Ok(events) => {
                for event in events {
                    self.apply(event);
                }
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("Dropping '{}' frame: {}", frame.event, e);
            }
            Err(e) => {
                log::warn!("Stream failed on '{}' frame: {}", frame.event, e);
                self.fail(&e.to_string());
            }
        }
        self.state
    }

    /// Applies one event in arrival order
    pub fn apply(&mut self, event: StreamEvent) {
        if self.state.is_terminal() {
            log::debug!("Discarding event after terminal state: {:?}", event);
            return;
        }

        match event {
            StreamEvent::Done(metadata) => {
                self.buffer_metadata(metadata);
                self.finalize();
                return;
            }
            StreamEvent::Error { message } => {
                self.fail(&message);
                return;
            }
            _ => {}
        }

        if self.state == TurnState::Empty {
            self.state = TurnState::Accumulating;
        }

        match event {
            StreamEvent::TextDelta { text, thought } => self.push_text(text, thought),
            StreamEvent::InlineImage(inline) => self.turn.parts.push(Part::InlineImage(inline)),
            StreamEvent::ExecutableCode(code) => self.turn.parts.push(Part::ExecutableCode(code)),
            StreamEvent::CodeExecutionResult(result) => {
                self.turn.parts.push(Part::CodeExecutionResult(result))
            }
            StreamEvent::Grounding(grounding) => self.turn.grounding_metadata = Some(grounding),
            StreamEvent::UrlContext(url_context) => {
                self.turn.url_context_metadata = Some(url_context)
            }
            StreamEvent::FunctionCall(call) => {
                if is_image_function(&call.name) {
                    self.turn
                        .parts
                        .push(Part::ImagePlaceholder(ImagePlaceholder::for_function(call.name)));
                } else {
                    self.turn.parts.push(Part::FunctionCall(call));
                }
            }
            StreamEvent::FunctionResult(result) => self.resolve_function(result),
            StreamEvent::ImageResult {
                function_name,
                image,
            } => self.resolve_image(function_name.as_deref(), image),
            StreamEvent::Metadata(metadata) => self.buffer_metadata(metadata),
            StreamEvent::Done(_) | StreamEvent::Error { .. } => {}
        }
    }

    /// Completes the turn. Returns false if it was already terminal.
    pub fn finalize(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TurnState::Finalizing;

        if self.turn.parts.is_empty() {
            self.turn.parts.push(Part::text(EMPTY_RESPONSE_TEXT));
        }
        self.turn.metadata = Some(self.pending_metadata.take().unwrap_or_default());

        self.state = TurnState::Finalized;
        true
    }

    /// Stops the turn on user request. Idempotent.
    ///
    /// Pending image placeholders are removed and a stop marker is appended. Parts already
    /// folded are kept.
    pub fn abort(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        self.turn.parts.retain(|part| !part.is_pending_image());
        let marker = if self.turn.parts.is_empty() {
            ABORT_MARKER.to_string()
        } else {
            format!("\n\n{}", ABORT_MARKER)
        };
        self.turn.parts.push(Part::Text(marker));

        self.state = TurnState::Aborted;
        true
    }

    /// Switches the turn to an error turn. Returns false if it was already terminal.
    pub fn fail(&mut self, message: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        self.turn.role = Role::Error;
        self.turn.parts = vec![Part::Text(format!("{}{}", STREAM_ERROR_PREFIX, message))];
        self.pending_metadata = None;

        self.state = TurnState::Errored;
        true
    }

    fn push_text(&mut self, text: String, thought: bool) {
        if let Some(last) = self.turn.parts.last_mut() {
            match (last, thought) {
                (Part::Text(existing), false) | (Part::Thought(existing), true) => {
                    existing.push_str(&text);
                    return;
                }
                _ => {}
            }
        }

        let part = if thought {
            Part::Thought(text)
        } else {
            Part::Text(text)
        };
        self.turn.parts.push(part);
    }

    fn buffer_metadata(&mut self, metadata: TurnMetadata) {
        let pending = self.pending_metadata.get_or_insert_with(TurnMetadata::default);
        if metadata.finish_reason.is_some() {
            pending.finish_reason = metadata.finish_reason;
        }
        if let Some(usage) = metadata.usage_metadata {
            pending
                .usage_metadata
                .get_or_insert_with(Default::default)
                .merge(&usage);
        }
        if metadata.safety_ratings.is_some() {
            pending.safety_ratings = metadata.safety_ratings;
        }
    }

    fn resolve_function(&mut self, result: FunctionResult) {
        if is_image_function(&result.name) {
            let image = result
                .result
                .get("inlineData")
                .and_then(|inline| serde_json::from_value::<InlineData>(inline.clone()).ok());
            let slot = self.find_placeholder_rev(&result.name);

            match (slot, image) {
                (Some(index), Some(image)) => self.turn.parts[index] = Part::InlineImage(image),
                (Some(index), None) => {
                    if let Part::ImagePlaceholder(placeholder) = &mut self.turn.parts[index] {
                        placeholder.loading_text = PROCESSING_IMAGE_TEXT.to_string();
                    }
                }
                (None, Some(image)) => self.turn.parts.push(Part::InlineImage(image)),
                (None, None) => self.turn.parts.push(Part::FunctionResult(result)),
            }
            return;
        }

        let slot = self.turn.parts.iter().rposition(
            |part| matches!(part, Part::FunctionCall(call) if call.name == result.name),
        );
        match slot {
            Some(index) => self.turn.parts[index] = Part::FunctionResult(result),
            None => {
                log::debug!("Result for '{}' has no pending call, appending", result.name);
                self.turn.parts.push(Part::FunctionResult(result));
            }
        }
    }

    fn resolve_image(&mut self, function_name: Option<&str>, image: InlineData) {
        let slot = self.turn.parts.iter().position(|part| match part {
            Part::ImagePlaceholder(placeholder) => {
                function_name.is_none_or(|name| placeholder.function_name == name)
            }
            _ => false,
        });

        match slot {
            Some(index) => self.turn.parts[index] = Part::InlineImage(image),
            None => self.turn.parts.push(Part::InlineImage(image)),
        }
    }

    fn find_placeholder_rev(&self, function_name: &str) -> Option<usize> {
        self.turn.parts.iter().rposition(|part| {
            matches!(part, Part::ImagePlaceholder(p) if p.function_name == function_name)
        })
    }
}

/// Folds a complete (non-streaming) response body into a finalized turn.
///
/// Expects `{response: [parts], finishReason?, usageMetadata?, safetyRatings?,
/// groundingMetadata?}`.
pub fn fold_response(turn: Turn, body: &Value) -> crate::Result<Turn> {
    let parts = body
        .get("response")
        .and_then(Value::as_array)
        .ok_or_else(|| crate::Error::protocol("response body has no `response` parts"))?;

    let mut accumulator = TurnAccumulator::for_turn(turn);
    for part in parts {
        match StreamEvent::from_api_part(part) {
            Ok(events) => events.into_iter().for_each(|e| accumulator.apply(e)),
            Err(e) => log::warn!("Dropping response part: {}", e),
        }
    }

    if let Some(grounding) = body.get("groundingMetadata").filter(|g| !g.is_null()) {
        accumulator.apply(StreamEvent::Grounding(grounding.clone()));
    }

    // The trailer fields share the `done` frame shape
    match StreamEvent::from_frame(&ParsedFrame::new("done", body.clone())) {
        Ok(events) => events.into_iter().for_each(|e| accumulator.apply(e)),
        Err(e) => log::warn!("Dropping response metadata: {}", e),
    }
    accumulator.finalize();

    Ok(accumulator.into_turn())
}
