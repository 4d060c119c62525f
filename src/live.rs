//! Live sessions: a time-boxed, bidirectional conversation over the `/live` relay.
//!
//! The module is split in two:
//!
//! - [`LiveState`] is a pure reducer. It folds [`LiveEvent`]s into the session record, the
//!   live transcript and the in-progress model turn, and returns the [`LiveUpdate`]s a
//!   caller should render. It never touches a socket, so it can be tested in isolation.
//! - [`LiveSession`] is the controller. It owns the socket, the session timer and the
//!   microphone capture, and releases all three on every exit path.
//!
//! # Status
//!
//! ```text
//! Disconnected ──connect──► Connecting ──setupComplete──► Connected
//!      ▲                        │                            │
//!      │                        └──────── error ─────────────┤
//!      │                                   ▼                 │
//!      └──────────── close / expiry ◄── Error ◄──────────────┘
//! ```
//!
//! `Connected` is reached only on `setupComplete` from upstream, never on socket open.
//! The session timer starts on that transition and ends the session when it fires,
//! whatever the activity. Sessions are not renewed. From `Error` the only way forward
//! is another `connect`.
//!
//! # Exclusivity
//!
//! At most one live socket and one microphone capture exist per process. Each is held
//! through a lease that is taken on `connect` (or on recording start) and returned on
//! every teardown path. A second session asking for a held resource gets
//! [`Error::Busy`].

use crate::accumulator::TurnAccumulator;
use crate::config::LIVE_SESSION_DURATION;
use crate::event::{LiveEvent, ServerContent, StreamEvent};
use crate::parser::parse_ws_text;
use crate::transport::{AbortHandle, ClientMessage, FrameSource, LiveConnector, LiveSink, RawFrame};
use crate::types::{InlineData, LiveOptions, Modality, Part, Turn, UsageMetadata};
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Close code reported when a socket ends without a close handshake
const ABNORMAL_CLOSURE: u16 = 1006;

const NORMAL_CLOSURE: u16 = 1000;

/// Notice appended when the session timer fires
pub const SESSION_EXPIRED_TEXT: &str = "Session timer expired. Disconnecting.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Session record
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub status: LiveStatus,
    pub modalities: BTreeSet<Modality>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub resume_handle: Option<String>,
}

/// Something the caller should render or play
#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
    Status(LiveStatus),
    /// A finished turn was appended to the live transcript
    TurnAppended(Turn),
    /// Snapshot of the model turn still being received
    ModelTurn(Turn),
    /// Raw audio from a binary frame
    Audio(Bytes),
    /// Base64 audio carried inside `serverContent`
    AudioInline(InlineData),
    /// The user interrupted the model; stop playback
    Interrupted,
    /// Latest token usage for the session
    Usage(UsageMetadata),
    MapDisplay(Value),
    ResumeHandle(String),
    GoAway { time_left: Option<String> },
    /// The session timer fired
    Expired,
}

/// Pure live-session reducer
#[derive(Debug, Clone)]
pub struct LiveState {
    info: SessionInfo,
    transcript: Vec<Turn>,
    model_turn: Option<TurnAccumulator>,
    input_transcript: String,
    output_transcript: String,
    last_output_chunk: Option<String>,
    usage: UsageMetadata,
    map_display: Option<Value>,
    expired: bool,
}

impl LiveState {
    pub fn new(modalities: BTreeSet<Modality>) -> Self {
        Self {
            info: SessionInfo {
                status: LiveStatus::Disconnected,
                modalities,
                start_time: None,
                end_time: None,
                resume_handle: None,
            },
            transcript: Vec::new(),
            model_turn: None,
            input_transcript: String::new(),
            output_transcript: String::new(),
            last_output_chunk: None,
            usage: UsageMetadata::default(),
            map_display: None,
            expired: false,
        }
    }

    pub fn status(&self) -> LiveStatus {
        self.info.status
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Finished turns, in order
    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    /// The model turn still being received, if any
    pub fn model_turn(&self) -> Option<&Turn> {
        self.model_turn.as_ref().map(TurnAccumulator::turn)
    }

    pub fn usage(&self) -> &UsageMetadata {
        &self.usage
    }

    pub fn map_display(&self) -> Option<&Value> {
        self.map_display.as_ref()
    }

    /// True once the session timer fired, until the next connect
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Pure form of [`apply`](Self::apply)
    pub fn reduce(mut self, event: LiveEvent) -> Self {
        self.apply(event);
        self
    }

    /// Folds one relay event and returns what changed
    pub fn apply(&mut self, event: LiveEvent) -> Vec<LiveUpdate> {
        let mut updates = Vec::new();

        match event {
            LiveEvent::BackendConnected => {
                self.append(Turn::system("Backend ready. AI connection pending."), &mut updates)
            }
            LiveEvent::RelayConnected => {
                self.append(Turn::system("Live AI connection active."), &mut updates)
            }
            LiveEvent::RelayError { message } => {
                log::error!("Live relay error: {}", message);
                self.append(Turn::error(format!("Error: {}", message)), &mut updates);
                self.set_status(LiveStatus::Error, &mut updates);
            }
            LiveEvent::RelayClosed { code, reason } => {
                log::info!("Live relay closed ({:?}): {:?}", code, reason);
                self.flush_model_turn(&mut updates);
                let code = code.map_or_else(|| "N/A".to_string(), |c| c.to_string());
                self.append(
                    Turn::system(format!("AI connection closed ({}).", code)),
                    &mut updates,
                );
                self.leave(&mut updates);
            }
            LiveEvent::SetupComplete => {
                if self.info.status == LiveStatus::Connecting {
                    log::info!("Live session setup complete");
                    self.info.start_time = Some(Utc::now());
                    self.set_status(LiveStatus::Connected, &mut updates);
                }
            }
            LiveEvent::ServerContent(content) => self.apply_server_content(content, &mut updates),
            LiveEvent::ToolCall { calls } => {
                let events = calls.into_iter().map(StreamEvent::FunctionCall).collect();
                self.fold_model_events(events, &mut updates);
            }
            LiveEvent::ToolCallStarted { calls } => {
                for call in calls {
                    self.append(
                        Turn::system(format!("Using tool: {}...", call.name)),
                        &mut updates,
                    );
                }
            }
            LiveEvent::ToolCallResult { name, result } => self.append(
                Turn::system(format!("Tool {} result: {}", name, result)),
                &mut updates,
            ),
            LiveEvent::ToolCallError { name, error } => self.append(
                Turn::error(format!("Tool {} error: {}", name, error)),
                &mut updates,
            ),
            LiveEvent::ImageGenerated {
                edited,
                image,
                description,
            } => self.apply_image(edited, image, description, &mut updates),
            LiveEvent::MapDisplayUpdate(map) => {
                self.map_display = Some(map.clone());
                updates.push(LiveUpdate::MapDisplay(map));
            }
            LiveEvent::SessionResumptionUpdate { new_handle } => {
                if let Some(handle) = new_handle {
                    log::debug!("Stored new session resume handle");
                    self.info.resume_handle = Some(handle.clone());
                    updates.push(LiveUpdate::ResumeHandle(handle));
                }
            }
            LiveEvent::Usage(usage) => {
                self.usage.merge(&usage);
                updates.push(LiveUpdate::Usage(self.usage.clone()));
            }
            LiveEvent::GoAway { time_left } => {
                let when = time_left.as_deref().unwrap_or("unknown");
                log::info!("Upstream will end the session in {}", when);
                self.append(
                    Turn::system(format!("Session will end in approximately {}.", when)),
                    &mut updates,
                );
                updates.push(LiveUpdate::GoAway { time_left });
            }
            LiveEvent::Audio(audio) => updates.push(LiveUpdate::Audio(audio)),
            LiveEvent::Unknown(value) => {
                log::debug!("Ignoring unrecognized live message: {}", value);
            }
        }

        updates
    }

    /// A connect request. Clears the previous session's timing.
    pub fn begin_connect(&mut self) -> Vec<LiveUpdate> {
        let mut updates = Vec::new();
        self.expired = false;
        self.info.start_time = None;
        self.info.end_time = None;
        self.set_status(LiveStatus::Connecting, &mut updates);
        updates
    }

    /// A user message sent over the socket
    pub fn push_user_text(&mut self, text: &str) -> Vec<LiveUpdate> {
        let mut updates = Vec::new();
        self.append(Turn::user(text), &mut updates);
        updates
    }

    /// The socket ended. `clean` is true when a close handshake was received.
    pub fn socket_closed(&mut self, code: Option<u16>, clean: bool) -> Vec<LiveUpdate> {
        let mut updates = Vec::new();
        self.flush_model_turn(&mut updates);
        let code = code.unwrap_or(ABNORMAL_CLOSURE);
        if !clean && code != NORMAL_CLOSURE {
            self.append(
                Turn::system(format!("Connection lost (Code: {}).", code)),
                &mut updates,
            );
        }
        self.leave(&mut updates);
        updates
    }

    /// The socket failed
    pub fn socket_error(&mut self, message: &str) -> Vec<LiveUpdate> {
        log::error!("Live socket error: {}", message);
        let mut updates = Vec::new();
        self.flush_model_turn(&mut updates);
        self.append(Turn::error("WebSocket connection error."), &mut updates);
        self.set_status(LiveStatus::Error, &mut updates);
        updates
    }

    /// The session timer fired
    pub fn expire(&mut self) -> Vec<LiveUpdate> {
        let mut updates = Vec::new();
        self.flush_model_turn(&mut updates);
        self.expired = true;
        self.append(Turn::system(SESSION_EXPIRED_TEXT), &mut updates);
        self.set_status(LiveStatus::Disconnected, &mut updates);
        updates.push(LiveUpdate::Expired);
        updates
    }

    /// Explicit close from any state
    pub fn close(&mut self) -> Vec<LiveUpdate> {
        let mut updates = Vec::new();
        self.flush_model_turn(&mut updates);
        self.set_status(LiveStatus::Disconnected, &mut updates);
        updates
    }

    fn apply_server_content(&mut self, content: ServerContent, updates: &mut Vec<LiveUpdate>) {
        if content.interrupted {
            updates.push(LiveUpdate::Interrupted);
        }

        updates.extend(content.audio.into_iter().map(LiveUpdate::AudioInline));

        if let Some(text) = content.input_transcription {
            self.input_transcript.push_str(&text);
        }
        if let Some(text) = content.output_transcription {
            // The relay repeats chunks verbatim
            if self.last_output_chunk.as_deref() != Some(text.as_str()) {
                self.output_transcript.push_str(&text);
                self.last_output_chunk = Some(text);
            }
        }

        let mut events = content.parts;
        if let Some(grounding) = content.grounding {
            events.push(StreamEvent::Grounding(grounding));
        }
        if !events.is_empty() {
            self.fold_model_events(events, updates);
        }

        if content.turn_complete || content.generation_complete {
            self.end_turn(updates);
        }
    }

    fn apply_image(
        &mut self,
        edited: bool,
        image: InlineData,
        description: Option<String>,
        updates: &mut Vec<LiveUpdate>,
    ) {
        log::debug!("Live image {}", if edited { "edited" } else { "generated" });

        let pending = self
            .model_turn
            .as_ref()
            .is_some_and(|acc| acc.turn().parts.iter().any(Part::is_pending_image));

        if pending {
            let mut events = vec![StreamEvent::ImageResult {
                function_name: None,
                image,
            }];
            events.extend(description.map(StreamEvent::text));
            self.fold_model_events(events, updates);
        } else {
            let mut parts: Vec<Part> = description.into_iter().map(Part::Text).collect();
            parts.push(Part::InlineImage(image));
            self.append(Turn::model(parts), updates);
        }
    }

    fn fold_model_events(&mut self, events: Vec<StreamEvent>, updates: &mut Vec<LiveUpdate>) {
        let accumulator = self.model_turn.get_or_insert_with(TurnAccumulator::new);
        for event in events {
            accumulator.apply(event);
        }
        updates.push(LiveUpdate::ModelTurn(accumulator.snapshot()));
    }

    /// Input transcription, then the model turn, then output transcription
    fn end_turn(&mut self, updates: &mut Vec<LiveUpdate>) {
        let input = std::mem::take(&mut self.input_transcript);
        if !input.trim().is_empty() {
            self.append(Turn::user(input.trim()), updates);
        }

        self.flush_model_turn(updates);

        let output = std::mem::take(&mut self.output_transcript);
        self.last_output_chunk = None;
        if !output.trim().is_empty() {
            self.append(Turn::system(output.trim()), updates);
        }
    }

    fn flush_model_turn(&mut self, updates: &mut Vec<LiveUpdate>) {
        if let Some(mut accumulator) = self.model_turn.take() {
            accumulator.finalize();
            self.append(accumulator.into_turn(), updates);
        }
    }

    fn append(&mut self, turn: Turn, updates: &mut Vec<LiveUpdate>) {
        self.transcript.push(turn.clone());
        updates.push(LiveUpdate::TurnAppended(turn));
    }

    /// Disconnected unless an error is already showing
    fn leave(&mut self, updates: &mut Vec<LiveUpdate>) {
        if self.info.status != LiveStatus::Error {
            self.set_status(LiveStatus::Disconnected, updates);
        }
    }

    fn set_status(&mut self, status: LiveStatus, updates: &mut Vec<LiveUpdate>) {
        if self.info.status == status {
            return;
        }
        log::debug!("Live status {:?} -> {:?}", self.info.status, status);
        if self.info.status == LiveStatus::Connected {
            self.info.end_time = Some(Utc::now());
        }
        self.info.status = status;
        updates.push(LiveUpdate::Status(status));
    }
}

// ============================================================================
// PROCESS-WIDE LEASES
// ============================================================================

static LIVE_SOCKET: AtomicBool = AtomicBool::new(false);
static MICROPHONE: AtomicBool = AtomicBool::new(false);

/// Exclusive hold on a process-wide resource, returned on drop
struct Lease {
    held: &'static AtomicBool,
    resource: &'static str,
}

impl Lease {
    fn acquire(held: &'static AtomicBool, resource: &'static str) -> Result<Self> {
        held.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy(resource))?;
        log::trace!("Acquired {} lease", resource);
        Ok(Self { held, resource })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
        log::trace!("Released {} lease", self.resource);
    }
}

// ============================================================================
// AUDIO CAPTURE
// ============================================================================

/// Microphone capture owned by a live session
pub trait AudioCapture: Send {
    fn start(&mut self) -> Result<()>;

    /// Must be safe to call on an already stopped capture
    fn stop(&mut self);
}

/// Scoped capture. Dropping the guard stops the capture and frees the microphone.
pub struct CaptureGuard {
    capture: Box<dyn AudioCapture>,
    _lease: Lease,
}

impl CaptureGuard {
    /// Starts `capture`, failing with [`Error::Busy`] while another guard is alive
    pub fn acquire(mut capture: Box<dyn AudioCapture>) -> Result<Self> {
        let lease = Lease::acquire(&MICROPHONE, "microphone")?;
        capture.start()?;
        log::debug!("Audio capture started");
        Ok(Self {
            capture,
            _lease: lease,
        })
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.capture.stop();
        log::debug!("Audio capture released");
    }
}

impl std::fmt::Debug for CaptureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureGuard").finish_non_exhaustive()
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

enum Wake {
    Expired,
    Frame(Option<Result<RawFrame>>),
}

/// Owns one live connection at a time, its timer and its microphone capture.
///
/// Drive it by calling [`recv`](Self::recv) in a loop. Updates are returned in the
/// order their events arrived.
///
/// # Examples
///
/// ```rust,no_run
/// use apsara_stream::{LiveOptions, LiveSession, Modality};
///
/// # async fn run() -> apsara_stream::Result<()> {
/// let options = LiveOptions::builder()
///     .base_url("http://localhost:9000")
///     .modality(Modality::Text)
///     .build()?;
///
/// let mut session = LiveSession::new(options);
/// session.connect().await?;
/// while let Some(update) = session.recv().await {
///     println!("{:?}", update);
/// }
/// # Ok(())
/// # }
/// ```
pub struct LiveSession {
    options: LiveOptions,
    connector: Arc<dyn LiveConnector>,
    state: LiveState,
    sink: Option<Box<dyn LiveSink>>,
    source: Option<FrameSource>,
    abort: AbortHandle,
    socket_lease: Option<Lease>,
    capture: Option<CaptureGuard>,
    duration: Duration,
    deadline: Option<Instant>,
    pending: VecDeque<LiveUpdate>,
}

impl LiveSession {
    /// Session over the real WebSocket connector
    pub fn new(options: LiveOptions) -> Self {
        Self::with_connector(options, Arc::new(crate::transport::WsConnector))
    }

    pub fn with_connector(options: LiveOptions, connector: Arc<dyn LiveConnector>) -> Self {
        let mut state = LiveState::new(options.modalities.clone());
        state.info.resume_handle = options.resume_handle.clone();
        Self {
            options,
            connector,
            state,
            sink: None,
            source: None,
            abort: AbortHandle::new(),
            socket_lease: None,
            capture: None,
            duration: LIVE_SESSION_DURATION,
            deadline: None,
            pending: VecDeque::new(),
        }
    }

    /// Overrides the session length
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn state(&self) -> &LiveState {
        &self.state
    }

    pub fn status(&self) -> LiveStatus {
        self.state.status()
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    /// Time left before the session timer fires
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Opens a new connection, closing any existing one first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] while another session holds the live socket.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_open() {
            log::info!("Replacing existing live connection");
            self.teardown().await;
        }

        let url = self.options.to_url()?;
        // Still held if an earlier connect was dropped mid-handshake
        if self.socket_lease.is_none() {
            self.socket_lease = Some(Lease::acquire(&LIVE_SOCKET, "live socket")?);
        }
        self.abort = AbortHandle::new();
        let updates = self.state.begin_connect();
        self.pending.extend(updates);

        match self.connector.connect(&url, self.abort.clone()).await {
            Ok((sink, source)) => {
                log::info!("Live socket open, waiting for setup");
                self.sink = Some(sink);
                self.source = Some(source);
                Ok(())
            }
            Err(Error::Cancelled) => {
                self.socket_lease = None;
                let updates = self.state.close();
                self.pending.extend(updates);
                Err(Error::Cancelled)
            }
            Err(e) => {
                self.socket_lease = None;
                let updates = self.state.socket_error(&e.to_string());
                self.pending.extend(updates);
                Err(e)
            }
        }
    }

    /// Reconnects with the latest resume handle from upstream
    pub async fn resume(&mut self) -> Result<()> {
        let handle = self
            .state
            .info
            .resume_handle
            .clone()
            .ok_or_else(|| Error::invalid_input("no session resume handle available"))?;
        self.options.resume_handle = Some(handle);
        self.connect().await
    }

    /// Next update, or `None` once the connection is gone and everything was delivered
    pub async fn recv(&mut self) -> Option<LiveUpdate> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }

            let deadline = self.deadline;
            let source = self.source.as_mut()?;
            let wake = match deadline {
                Some(deadline) => tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => Wake::Expired,
                    frame = source.next() => Wake::Frame(frame),
                },
                None => Wake::Frame(source.next().await),
            };

            match wake {
                Wake::Expired => self.expire().await,
                Wake::Frame(Some(Ok(RawFrame::Text(text)))) => self.handle_text(&text).await,
                Wake::Frame(Some(Ok(RawFrame::Binary(audio)))) => {
                    let updates = self.state.apply(LiveEvent::from_binary(audio));
                    self.pending.extend(updates);
                }
                Wake::Frame(Some(Ok(RawFrame::Close { code, .. }))) => {
                    self.teardown().await;
                    let updates = self.state.socket_closed(code, true);
                    self.pending.extend(updates);
                }
                Wake::Frame(Some(Ok(RawFrame::Chunk(bytes)))) => {
                    log::debug!("Ignoring {} byte chunk on live socket", bytes.len());
                }
                Wake::Frame(Some(Err(Error::Cancelled))) => {
                    self.teardown().await;
                    let updates = self.state.close();
                    self.pending.extend(updates);
                }
                Wake::Frame(Some(Err(e))) => {
                    self.teardown().await;
                    let updates = self.state.socket_error(&e.to_string());
                    self.pending.extend(updates);
                }
                Wake::Frame(None) => {
                    self.teardown().await;
                    let updates = self.state.socket_closed(None, false);
                    self.pending.extend(updates);
                }
            }
        }
    }

    /// Sends a user text message and records it in the transcript
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::invalid_input("message cannot be empty"));
        }
        let message = ClientMessage::Text {
            text: text.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
        };
        self.connected_sink()?.send_message(&message).await?;

        let updates = self.state.push_user_text(text);
        self.pending.extend(updates);
        Ok(())
    }

    /// Sends raw PCM audio
    pub async fn send_audio(&mut self, pcm: Bytes) -> Result<()> {
        self.connected_sink()?.send_audio(pcm).await
    }

    /// Sends one camera frame
    pub async fn send_video_frame(&mut self, frame: InlineData) -> Result<()> {
        let message = ClientMessage::VideoChunk { chunk: frame };
        self.connected_sink()?.send_message(&message).await
    }

    /// Sends one screen-share frame
    pub async fn send_screen_frame(&mut self, frame: InlineData) -> Result<()> {
        let message = ClientMessage::ScreenChunk { chunk: frame };
        self.connected_sink()?.send_message(&message).await
    }

    /// Starts microphone capture. At most one capture is active per process.
    pub fn start_recording(&mut self, capture: Box<dyn AudioCapture>) -> Result<()> {
        if self.status() != LiveStatus::Connected {
            return Err(Error::transport("Live session is not connected"));
        }
        if self.capture.is_some() {
            return Err(Error::invalid_input("already recording"));
        }
        self.capture = Some(CaptureGuard::acquire(capture)?);
        Ok(())
    }

    /// Stops microphone capture. Returns false if nothing was recording.
    pub fn stop_recording(&mut self) -> bool {
        self.capture.take().is_some()
    }

    /// Ends the session from any state
    pub async fn close(&mut self) {
        // Capture goes first, before any await
        self.capture = None;
        self.teardown().await;
        let updates = self.state.close();
        self.pending.extend(updates);
        log::info!("Live session closed");
    }

    async fn handle_text(&mut self, text: &str) {
        let Some(frame) = parse_ws_text(text) else {
            return;
        };

        let event = match LiveEvent::from_frame(&frame) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping live '{}' message: {}", frame.event, e);
                return;
            }
        };

        let was_connected = self.status() == LiveStatus::Connected;
        let ends_session = matches!(
            event,
            LiveEvent::RelayError { .. } | LiveEvent::RelayClosed { .. }
        );

        let updates = self.state.apply(event);
        self.pending.extend(updates);

        if !was_connected && self.status() == LiveStatus::Connected {
            self.deadline = Some(Instant::now() + self.duration);
            log::info!("Live session timer started ({}s)", self.duration.as_secs());
        }
        if ends_session {
            self.teardown().await;
        }
    }

    async fn expire(&mut self) {
        log::info!("Live session expired");
        self.capture = None;
        self.teardown().await;
        let updates = self.state.expire();
        self.pending.extend(updates);
    }

    fn connected_sink(&mut self) -> Result<&mut Box<dyn LiveSink>> {
        if self.state.is_expired() {
            return Err(Error::SessionExpired);
        }
        if self.status() != LiveStatus::Connected {
            return Err(Error::transport("Live session is not connected"));
        }
        self.sink
            .as_mut()
            .ok_or_else(|| Error::transport("Live session is not connected"))
    }

    /// Releases the capture, the timer and the socket
    async fn teardown(&mut self) {
        self.capture = None;
        self.deadline = None;
        self.abort.abort();
        self.source = None;
        self.socket_lease = None;
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                log::debug!("Error closing live socket: {}", e);
            }
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.capture = None;
        self.abort.abort();
        self.socket_lease = None;
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("status", &self.status())
            .field("open", &self.is_open())
            .field("recording", &self.is_recording())
            .finish()
    }
}
