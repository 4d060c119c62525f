//! # Apsara Stream
//!
//! Streaming reassembly engine for a Gemini-family chat backend: it turns Server-Sent
//! Event streams and live WebSocket traffic into well-formed conversation turns.
//!
//! ## Overview
//!
//! The backend speaks two protocols:
//!
//! - `POST /chat/stream` answers with SSE frames (`data:` text deltas, `function_call`,
//!   `function_result`, `image_result`, `grounding`, `done`, `error`)
//! - `/live` is a WebSocket relay for time-boxed text/audio/video sessions
//!
//! Both arrive in arbitrary fragments. This crate reassembles them incrementally so a
//! caller always sees a consistent turn, whether the stream completes, fails, or is
//! stopped by the user halfway through.
//!
//! ## Key Features
//!
//! - **Incremental parsing**: frames split across reads (even mid UTF-8 character) are
//!   reassembled, malformed frames are dropped without killing the stream
//! - **Deterministic folding**: adjacent text merges, image-function placeholders are
//!   swapped for images, function results land on their calls
//! - **Cooperative cancellation**: stopping a turn keeps what arrived and appends a marker
//! - **Snapshot publishing**: subscribers receive immutable copies, never a half-applied turn
//! - **Live sessions**: status machine gated on `setupComplete`, a fixed session timer,
//!   scoped microphone capture
//!
//! ## Chat
//!
//! ```rust,no_run
//! use apsara_stream::{ChatOptions, Client, TurnState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ChatOptions::builder()
//!         .model("gemini-2.0-flash")
//!         .base_url("http://localhost:9000")
//!         .google_search(true)
//!         .build()?;
//!
//!     let client = Client::new(options)?;
//!     let conversation = client.create_conversation().await;
//!
//!     let outcome = client.send(&conversation, "What's new in Rust?", Vec::new()).await?;
//!     if outcome.state == TurnState::Finalized {
//!         println!("{}", outcome.turn.text());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Watching a Turn Stream In
//!
//! ```rust,no_run
//! use apsara_stream::{ChatOptions, Client};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! # let client = Client::new(ChatOptions::builder().model("m").base_url("http://localhost:9000").build()?)?;
//! let mut snapshots = client.subscribe().await;
//! tokio::spawn(async move {
//!     while let Some(snapshot) = snapshots.next().await {
//!         println!("{:?}: {}", snapshot.state, snapshot.turn.text());
//!     }
//! });
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **transport**: HTTP and WebSocket adapters yielding raw frames, abort handle
//! - **parser**: SSE feed/flush parser and WebSocket message decoding
//! - **event**: closed sets of chat and live events decoded from frames
//! - **accumulator**: the turn state machine that folds events into parts
//! - **store**: conversations, in-flight tracking, snapshot subscribers
//! - **session**: drives one chat turn from transport to store
//! - **live**: live-session reducer and controller
//! - **client**: the public façade
//! - **types**, **config**, **error**: data model, settings, error taxonomy

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Turn state machine: folds stream events into an ordered list of parts.
mod accumulator;
/// Client façade over the store, the chat transport and the live connector.
mod client;
/// Backend URL and model resolution, protocol constants.
mod config;
/// Error types shared by every module.
mod error;
/// Decoded chat and live events.
mod event;
/// Live session state and controller.
mod live;
/// SSE and WebSocket frame parsing.
mod parser;
/// Chat turn driver.
mod session;
/// Conversation store and persistence seam.
mod store;
/// HTTP and WebSocket transports.
mod transport;
/// Data model, request shaping and option builders.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Core Client API ---
pub use client::{Client, query};

// --- Configuration ---
pub use config::{
    DEFAULT_BACKEND_URL, DEFAULT_LIVE_MODEL, DEFAULT_MODEL, DEFAULT_VOICE, ENV_BACKEND_URL,
    ENV_MODEL, IMAGE_FUNCTIONS, IMAGE_GENERATION_MODEL, LIVE_SESSION_DURATION, NEW_CHAT_TITLE,
    TITLE_MAX_CHARS, get_backend_url, get_model, is_image_function, title_from_prompt,
};

// --- Error Handling ---
pub use error::{Error, Result};

// --- Core Types ---
pub use types::{
    ChatOptions, ChatOptionsBuilder, ChatRequest, CodeExecutionResult, Conversation,
    ExecutableCode, FileData, FunctionCall, FunctionCallingMode, FunctionResult,
    GenerationConfig, ImagePlaceholder, InlineData, LiveOptions, LiveOptionsBuilder, Modality,
    Part, RequestConfig, Role, ThinkingConfig, Turn, TurnMetadata, UsageMetadata,
    validate_api_part,
};

// --- Transport ---
pub use transport::{
    AbortHandle, ChatTransport, ClientMessage, FrameSource, HttpTransport, LiveConnector,
    LiveSink, RawFrame, WsConnector,
};

// --- Parsing and Events ---
pub use event::{LiveEvent, ServerContent, StreamEvent};
pub use parser::{DEFAULT_EVENT, ParsedFrame, SseFrameParser, parse_ws_text};

// --- Turn Accumulation ---
pub use accumulator::{
    ABORT_MARKER, EMPTY_RESPONSE_TEXT, PROCESSING_IMAGE_TEXT, STREAM_ERROR_PREFIX,
    TurnAccumulator, TurnState, fold_response,
};

// --- Conversation Store ---
pub use store::{ConversationSink, ConversationStore, MemorySink, TurnSnapshot};

// --- Sessions ---
pub use live::{
    AudioCapture, CaptureGuard, LiveSession, LiveState, LiveStatus, LiveUpdate,
    SESSION_EXPIRED_TEXT, SessionInfo,
};
pub use session::{TurnDriver, TurnOutcome};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use apsara_stream::prelude::*;`.
///
/// This includes:
/// - Configuration: ChatOptions, LiveOptions, Modality
/// - Client: Client, query()
/// - Turns: Turn, Part, Role, TurnState, TurnOutcome
/// - Live: LiveSession, LiveStatus, LiveUpdate
/// - Cancellation: AbortHandle
/// - Errors: Error, Result
pub mod prelude {
    pub use crate::{
        AbortHandle, ChatOptions, Client, Error, LiveOptions, LiveSession, LiveStatus,
        LiveUpdate, Modality, Part, Result, Role, Turn, TurnOutcome, TurnState, query,
    };
}
