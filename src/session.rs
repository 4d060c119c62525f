//! Chat turn driver.
//!
//! A [`TurnDriver`] owns one model turn from the moment its placeholder is appended until
//! it reaches a terminal state. It pulls raw frames from a [`FrameSource`], parses them,
//! folds each frame through a [`TurnAccumulator`], and publishes a snapshot to the
//! [`ConversationStore`] after every applied frame.
//!
//! ```text
//! FrameSource ──► SseFrameParser ──► TurnAccumulator ──► ConversationStore
//!   (raw)            (frames)          (fold)              (snapshots)
//! ```
//!
//! Abort is checked between frames, so frames that were already parsed but not yet
//! applied are discarded once the user stops the turn. The store lock is never held
//! across a network read.
//!
//! A driver that is dropped before its turn is terminal (the caller's future was
//! cancelled by a timeout, a `select!` or a task abort) ends the turn as `Aborted`, so
//! the conversation never stays in flight.

use crate::accumulator::{TurnAccumulator, TurnState, fold_response};
use crate::parser::{ParsedFrame, SseFrameParser, parse_ws_text};
use crate::store::{ConversationStore, TurnSnapshot};
use crate::transport::{AbortHandle, FrameSource, RawFrame};
use crate::types::Turn;
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How a turn ended
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub state: TurnState,
    pub turn: Arc<Turn>,
}

impl TurnOutcome {
    pub fn is_finalized(&self) -> bool {
        self.state == TurnState::Finalized
    }
}

impl From<TurnSnapshot> for TurnOutcome {
    fn from(snapshot: TurnSnapshot) -> Self {
        Self {
            conversation_id: snapshot.conversation_id,
            state: snapshot.state,
            turn: snapshot.turn,
        }
    }
}

/// Drives one in-flight turn to completion
pub struct TurnDriver {
    store: Arc<Mutex<ConversationStore>>,
    conversation_id: String,
    accumulator: TurnAccumulator,
    parser: SseFrameParser,
    /// Set once the terminal turn was handed to the store
    published: bool,
}

impl TurnDriver {
    /// `placeholder` must be the turn returned by `start_turn` or `start_regeneration`
    pub fn new(
        store: Arc<Mutex<ConversationStore>>,
        conversation_id: impl Into<String>,
        placeholder: Turn,
    ) -> Self {
        Self {
            store,
            conversation_id: conversation_id.into(),
            accumulator: TurnAccumulator::for_turn(placeholder),
            parser: SseFrameParser::new(),
            published: false,
        }
    }

    pub fn state(&self) -> TurnState {
        self.accumulator.state()
    }

    /// Consumes the source until the turn is terminal, then publishes the result.
    ///
    /// The source is dropped (closing its connection) as soon as the turn ends, even if
    /// frames remain.
    pub async fn run(mut self, mut source: FrameSource) -> Result<TurnOutcome> {
        let abort = source.abort_handle().clone();
        while !self.accumulator.state().is_terminal() {
            match source.next().await {
                Some(Ok(RawFrame::Chunk(bytes))) => {
                    let frames = self.parser.feed(&bytes);
                    self.apply_frames(&frames, &abort).await;
                }
                Some(Ok(RawFrame::Text(text))) => {
                    if let Some(frame) = parse_ws_text(&text) {
                        self.apply_frames(&[frame], &abort).await;
                    }
                }
                Some(Ok(RawFrame::Binary(data))) => {
                    log::debug!("Ignoring {} byte binary frame on chat stream", data.len());
                }
                Some(Ok(RawFrame::Close { code, .. })) => {
                    log::debug!("Chat stream closed by peer ({:?})", code);
                    self.finish_stream(&abort).await;
                }
                Some(Err(Error::Cancelled)) => {
                    self.accumulator.abort();
                }
                Some(Err(e)) => {
                    log::error!("Stream for {} failed: {}", self.conversation_id, e);
                    self.accumulator.fail(&failure_message(&e));
                }
                None => self.finish_stream(&abort).await,
            }
        }

        drop(source);
        self.finish().await
    }

    /// Ends a turn whose transport never opened.
    ///
    /// A cancelled open aborts the turn. Any other error turns it into an error turn.
    pub async fn fail_open(mut self, error: Error) -> Result<TurnOutcome> {
        if error.is_cancelled() {
            self.accumulator.abort();
        } else {
            log::error!("Failed to open stream for {}: {}", self.conversation_id, error);
            self.accumulator.fail(&failure_message(&error));
        }
        self.finish().await
    }

    /// Folds a complete non-streaming response body into the turn
    pub async fn complete(mut self, body: &Value) -> Result<TurnOutcome> {
        match fold_response(self.accumulator.snapshot(), body) {
            Ok(turn) => self.publish_terminal(turn, TurnState::Finalized).await,
            Err(e) => {
                log::error!("Unusable response for {}: {}", self.conversation_id, e);
                self.accumulator.fail(&failure_message(&e));
                self.finish().await
            }
        }
    }

    async fn apply_frames(&mut self, frames: &[ParsedFrame], abort: &AbortHandle) {
        for frame in frames {
            if abort.is_aborted() {
                self.accumulator.abort();
                return;
            }
            let state = self.accumulator.apply_frame(frame);
            if state.is_terminal() {
                return;
            }
            self.publish(state).await;
        }
    }

    /// Applies whatever the parser still holds and finalizes
    async fn finish_stream(&mut self, abort: &AbortHandle) {
        let frames = self.parser.flush();
        self.apply_frames(&frames, abort).await;
        if abort.is_aborted() {
            self.accumulator.abort();
        } else {
            self.accumulator.finalize();
        }
    }

    async fn publish(&self, state: TurnState) {
        let mut store = self.store.lock().await;
        if let Err(e) =
            store.apply_turn_snapshot(&self.conversation_id, self.accumulator.snapshot(), state)
        {
            log::warn!("Dropped snapshot for {}: {}", self.conversation_id, e);
        }
    }

    async fn finish(self) -> Result<TurnOutcome> {
        let state = self.accumulator.state();
        let turn = self.accumulator.snapshot();
        self.publish_terminal(turn, state).await
    }

    async fn publish_terminal(mut self, turn: Turn, state: TurnState) -> Result<TurnOutcome> {
        let finished = self
            .store
            .lock()
            .await
            .finish_turn(&self.conversation_id, turn, state);
        self.published = true;
        Ok(finished?.into())
    }
}

impl Drop for TurnDriver {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        self.published = true;
        self.accumulator.abort();
        let state = self.accumulator.state();
        let turn = self.accumulator.snapshot();
        let conversation_id = std::mem::take(&mut self.conversation_id);
        log::info!(
            "Turn for {} dropped before completion, ending it as {:?}",
            conversation_id,
            state
        );

        if let Ok(mut store) = self.store.try_lock() {
            release_turn(&mut store, &conversation_id, turn, state);
            return;
        }

        // Store busy: finish on the runtime once the lock frees up
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    release_turn(&mut *store.lock().await, &conversation_id, turn, state);
                });
            }
            Err(_) => log::error!(
                "No runtime to release dropped turn of {}, it stays in flight",
                conversation_id
            ),
        }
    }
}

fn release_turn(
    store: &mut ConversationStore,
    conversation_id: &str,
    turn: Turn,
    state: TurnState,
) {
    if let Err(e) = store.finish_turn(conversation_id, turn, state) {
        log::warn!("Could not release dropped turn of {}: {}", conversation_id, e);
    }
}

/// Text shown on an error turn
fn failure_message(error: &Error) -> String {
    match error {
        Error::Transport { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
