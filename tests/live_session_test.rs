//! Live session controller tests
//!
//! A fake connector hands the session channel-backed sockets, so relay traffic is
//! injected frame by frame and everything the session sends is recorded.

use apsara_stream::{
    AbortHandle, AudioCapture, CaptureGuard, ClientMessage, Error, FrameSource, LiveConnector,
    LiveOptions, LiveSession, LiveSink, LiveStatus, LiveUpdate, Modality, RawFrame, Result, Role,
    SESSION_EXPIRED_TEXT,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_test::{assert_err, assert_ok};

type FrameSender = mpsc::UnboundedSender<Result<RawFrame>>;

/// The live socket and the microphone are process-wide, so these tests take turns
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything the session pushed through its sockets
#[derive(Default)]
struct Recorded {
    messages: Mutex<Vec<Value>>,
    audio: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

struct FakeSink {
    recorded: Arc<Recorded>,
}

#[async_trait]
impl LiveSink for FakeSink {
    async fn send_message(&mut self, message: &ClientMessage) -> Result<()> {
        self.recorded
            .messages
            .lock()
            .unwrap()
            .push(serde_json::to_value(message)?);
        Ok(())
    }

    async fn send_audio(&mut self, pcm: Bytes) -> Result<()> {
        self.recorded.audio.lock().unwrap().push(pcm);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.recorded.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one queued socket per connect, refusing once the queue is empty
#[derive(Default)]
struct FakeConnector {
    sockets: Mutex<Vec<mpsc::UnboundedReceiver<Result<RawFrame>>>>,
    urls: Mutex<Vec<String>>,
    recorded: Arc<Recorded>,
}

impl FakeConnector {
    fn push_socket(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.lock().unwrap().push(rx);
        tx
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(
        &self,
        url: &reqwest::Url,
        abort: AbortHandle,
    ) -> Result<(Box<dyn LiveSink>, FrameSource)> {
        self.urls.lock().unwrap().push(url.to_string());
        let mut sockets = self.sockets.lock().unwrap();
        if sockets.is_empty() {
            return Err(Error::transport("connection refused"));
        }
        let rx = sockets.remove(0);
        Ok((
            Box::new(FakeSink {
                recorded: self.recorded.clone(),
            }),
            FrameSource::from_stream(UnboundedReceiverStream::new(rx), abort),
        ))
    }
}

/// Counts start/stop calls
#[derive(Clone, Default)]
struct FakeCapture {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl AudioCapture for FakeCapture {
    fn start(&mut self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn options() -> LiveOptions {
    LiveOptions::builder()
        .base_url("http://localhost:9000")
        .modality(Modality::Text)
        .build()
        .unwrap()
}

fn message(value: Value) -> Result<RawFrame> {
    Ok(RawFrame::Text(value.to_string()))
}

async fn next(session: &mut LiveSession) -> LiveUpdate {
    tokio::time::timeout(Duration::from_secs(5), session.recv())
        .await
        .expect("no update within 5s")
        .expect("session ended")
}

/// Connects and drives the session through `setupComplete`
async fn connected(connector: &Arc<FakeConnector>) -> (LiveSession, FrameSender) {
    let tx = connector.push_socket();
    let mut session = LiveSession::with_connector(options(), connector.clone());
    assert_ok!(session.connect().await);
    tx.send(message(json!({ "setupComplete": {} }))).unwrap();

    assert_eq!(next(&mut session).await, LiveUpdate::Status(LiveStatus::Connecting));
    assert_eq!(next(&mut session).await, LiveUpdate::Status(LiveStatus::Connected));
    (session, tx)
}

fn appended_text(update: &LiveUpdate) -> Option<String> {
    match update {
        LiveUpdate::TurnAppended(turn) => Some(turn.text()),
        _ => None,
    }
}

#[tokio::test]
async fn test_connected_waits_for_setup_complete() {
    let _serial = serial();
    let _ = env_logger::builder().is_test(true).try_init();

    // GIVEN: An open socket on which the relay reports its own progress
    let connector = Arc::new(FakeConnector::default());
    let tx = connector.push_socket();
    let mut session = LiveSession::with_connector(options(), connector.clone());
    session.connect().await.unwrap();

    tx.send(message(json!({ "event": "backend_connected" }))).unwrap();
    tx.send(message(json!({ "event": "connected" }))).unwrap();

    // WHEN: Both relay notices have been processed
    assert_eq!(next(&mut session).await, LiveUpdate::Status(LiveStatus::Connecting));
    let first = next(&mut session).await;
    let second = next(&mut session).await;

    // THEN: They were recorded, but the session is still connecting and cannot send
    assert_eq!(
        appended_text(&first).as_deref(),
        Some("Backend ready. AI connection pending.")
    );
    assert_eq!(appended_text(&second).as_deref(), Some("Live AI connection active."));
    assert_eq!(session.status(), LiveStatus::Connecting);
    assert!(session.time_remaining().is_none());
    assert!(matches!(
        session.send_text("too early").await,
        Err(Error::Transport { .. })
    ));

    // AND: setupComplete moves it to Connected and starts the timer
    tx.send(message(json!({ "setupComplete": {} }))).unwrap();
    assert_eq!(next(&mut session).await, LiveUpdate::Status(LiveStatus::Connected));
    assert!(session.time_remaining().is_some());
    assert!(session.state().info().start_time.is_some());
}

#[tokio::test]
async fn test_connect_url_carries_options() {
    let _serial = serial();
    // GIVEN: A session with a resume handle
    let connector = Arc::new(FakeConnector::default());
    let _tx = connector.push_socket();
    let options = LiveOptions::builder()
        .base_url("https://backend.example.com")
        .modality(Modality::Audio)
        .voice("Kore")
        .resume_handle("h-1")
        .build()
        .unwrap();
    let mut session = LiveSession::with_connector(options, connector.clone());

    // WHEN: It connects
    session.connect().await.unwrap();

    // THEN: The socket URL is the secure /live endpoint with the session parameters
    let url = connector.urls.lock().unwrap()[0].clone();
    assert!(url.starts_with("wss://backend.example.com/live?"));
    assert!(url.contains("modalities=AUDIO"));
    assert!(url.contains("voice=Kore"));
    assert!(url.contains("resumeHandle=h-1"));
}

#[tokio::test]
async fn test_send_text_reaches_socket_and_transcript() {
    let _serial = serial();
    // GIVEN: A connected session
    let connector = Arc::new(FakeConnector::default());
    let (mut session, _tx) = connected(&connector).await;

    // WHEN: The user sends a message
    assert_ok!(session.send_text("  hello there  ").await);

    // THEN: The relay received a text message with a fresh message id
    let messages = connector.recorded.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "text");
    assert_eq!(messages[0]["text"], "hello there");
    assert!(!messages[0]["messageId"].as_str().unwrap().is_empty());

    // AND: The transcript gained a user turn
    let update = next(&mut session).await;
    assert_eq!(appended_text(&update).as_deref(), Some("hello there"));
    assert_eq!(session.state().transcript()[0].role, Role::User);

    // AND: Empty messages are refused
    assert!(matches!(
        session.send_text("   ").await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_model_turn_streams_then_lands_in_transcript() {
    let _serial = serial();
    // GIVEN: A connected session
    let connector = Arc::new(FakeConnector::default());
    let (mut session, tx) = connected(&connector).await;

    // WHEN: Upstream streams a model turn in two pieces and completes it
    tx.send(message(json!({ "serverContent": { "modelTurn": { "parts": [{ "text": "Hi " }] } } })))
        .unwrap();
    tx.send(message(json!({ "serverContent": { "modelTurn": { "parts": [{ "text": "you" }] } } })))
        .unwrap();
    tx.send(message(json!({ "serverContent": { "turnComplete": true } })))
        .unwrap();

    // THEN: Snapshots grow, then one finished model turn is appended
    assert!(matches!(next(&mut session).await, LiveUpdate::ModelTurn(t) if t.text() == "Hi "));
    assert!(matches!(next(&mut session).await, LiveUpdate::ModelTurn(t) if t.text() == "Hi you"));
    match next(&mut session).await {
        LiveUpdate::TurnAppended(turn) => {
            assert_eq!(turn.role, Role::Model);
            assert_eq!(turn.text(), "Hi you");
        }
        other => panic!("Expected an appended turn, got {:?}", other),
    }
    assert!(session.state().model_turn().is_none());
}

#[tokio::test]
async fn test_relay_error_tears_down_socket() {
    let _serial = serial();
    // GIVEN: A connected, recording session
    let connector = Arc::new(FakeConnector::default());
    let (mut session, tx) = connected(&connector).await;
    let capture = FakeCapture::default();
    session.start_recording(Box::new(capture.clone())).unwrap();

    // WHEN: The relay reports an upstream failure
    tx.send(message(json!({ "event": "error", "message": "quota exceeded" })))
        .unwrap();

    // THEN: An error turn is shown and the status becomes Error
    let update = next(&mut session).await;
    assert_eq!(appended_text(&update).as_deref(), Some("Error: quota exceeded"));
    assert_eq!(next(&mut session).await, LiveUpdate::Status(LiveStatus::Error));

    // AND: The socket and the microphone were released
    assert!(!session.is_open());
    assert!(!session.is_recording());
    assert_eq!(capture.stops.load(Ordering::SeqCst), 1);
    assert!(connector.recorded.closed.load(Ordering::SeqCst));
    assert!(session.recv().await.is_none());
}

#[tokio::test]
async fn test_close_releases_capture() {
    let _serial = serial();
    // GIVEN: A connected session with an active capture
    let connector = Arc::new(FakeConnector::default());
    let (mut session, _tx) = connected(&connector).await;
    let capture = FakeCapture::default();
    session.start_recording(Box::new(capture.clone())).unwrap();

    // AND: A second capture is refused
    assert!(session.start_recording(Box::new(FakeCapture::default())).is_err());
    assert_eq!(capture.starts.load(Ordering::SeqCst), 1);

    // WHEN: The session is closed
    session.close().await;

    // THEN: Capture stopped exactly once and the session is disconnected
    assert_eq!(capture.stops.load(Ordering::SeqCst), 1);
    assert!(!session.is_recording());
    assert_eq!(session.status(), LiveStatus::Disconnected);
    assert!(session.state().info().end_time.is_some());
    assert!(connector.recorded.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_recording_requires_connection() {
    let _serial = serial();
    // GIVEN: A session that never connected
    let connector = Arc::new(FakeConnector::default());
    let mut session = LiveSession::with_connector(options(), connector);
    let capture = FakeCapture::default();

    // WHEN: Recording is requested
    let result = session.start_recording(Box::new(capture.clone()));

    // THEN: It is refused without touching the microphone
    assert_err!(result);
    assert_eq!(capture.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_session_timer_expires() {
    let _serial = serial();
    // GIVEN: A connected, recording session with a short timer
    let connector = Arc::new(FakeConnector::default());
    let tx = connector.push_socket();
    let mut session = LiveSession::with_connector(options(), connector.clone())
        .with_duration(Duration::from_secs(60));
    session.connect().await.unwrap();
    tx.send(message(json!({ "setupComplete": {} }))).unwrap();
    assert_eq!(session.recv().await, Some(LiveUpdate::Status(LiveStatus::Connecting)));
    assert_eq!(session.recv().await, Some(LiveUpdate::Status(LiveStatus::Connected)));

    let remaining = session.time_remaining().unwrap();
    assert!(remaining <= Duration::from_secs(60));
    assert!(remaining > Duration::from_secs(59));

    let capture = FakeCapture::default();
    session.start_recording(Box::new(capture.clone())).unwrap();

    // WHEN: The socket stays quiet until the timer fires
    let update = session.recv().await.unwrap();

    // THEN: The expiry notice is shown and the session is disconnected
    assert_eq!(appended_text(&update).as_deref(), Some(SESSION_EXPIRED_TEXT));
    assert_eq!(
        session.recv().await,
        Some(LiveUpdate::Status(LiveStatus::Disconnected))
    );
    assert_eq!(session.recv().await, Some(LiveUpdate::Expired));
    assert!(session.recv().await.is_none());

    // AND: Capture and socket were released, and sending is refused
    assert_eq!(capture.stops.load(Ordering::SeqCst), 1);
    assert!(!session.is_open());
    assert!(matches!(
        session.send_text("still there?").await,
        Err(Error::SessionExpired)
    ));
    assert!(matches!(
        session.send_audio(Bytes::from_static(&[0, 1])).await,
        Err(Error::SessionExpired)
    ));
    assert!(connector.recorded.audio.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unclean_socket_end_reports_abnormal_closure() {
    let _serial = serial();
    // GIVEN: A connected session
    let connector = Arc::new(FakeConnector::default());
    let (mut session, tx) = connected(&connector).await;

    // WHEN: The socket ends without a close handshake
    drop(tx);

    // THEN: The loss is reported with code 1006
    let update = next(&mut session).await;
    assert_eq!(
        appended_text(&update).as_deref(),
        Some("Connection lost (Code: 1006).")
    );
    assert_eq!(
        next(&mut session).await,
        LiveUpdate::Status(LiveStatus::Disconnected)
    );
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_normal_close_is_silent() {
    let _serial = serial();
    // GIVEN: A connected session
    let connector = Arc::new(FakeConnector::default());
    let (mut session, tx) = connected(&connector).await;

    // WHEN: The peer closes normally
    tx.send(Ok(RawFrame::Close {
        code: Some(1000),
        reason: None,
    }))
    .unwrap();

    // THEN: No notice is shown, only the status change
    assert_eq!(
        next(&mut session).await,
        LiveUpdate::Status(LiveStatus::Disconnected)
    );
    assert!(session.state().transcript().is_empty());
}

#[tokio::test]
async fn test_failed_connect_sets_error() {
    let _serial = serial();
    // GIVEN: A connector that refuses every connection
    let connector = Arc::new(FakeConnector::default());
    let mut session = LiveSession::with_connector(options(), connector);

    // WHEN: The session connects
    let result = session.connect().await;

    // THEN: The error is returned and shown
    assert_err!(result);
    assert_eq!(next(&mut session).await, LiveUpdate::Status(LiveStatus::Connecting));
    let update = next(&mut session).await;
    assert_eq!(appended_text(&update).as_deref(), Some("WebSocket connection error."));
    assert_eq!(next(&mut session).await, LiveUpdate::Status(LiveStatus::Error));
    assert!(session.recv().await.is_none());
}

#[tokio::test]
async fn test_resume_uses_latest_handle() {
    let _serial = serial();
    // GIVEN: A session that received a resumption handle
    let connector = Arc::new(FakeConnector::default());
    let (mut session, tx) = connected(&connector).await;
    tx.send(message(json!({ "sessionResumptionUpdate": { "newHandle": "h-42" } })))
        .unwrap();
    assert_eq!(
        next(&mut session).await,
        LiveUpdate::ResumeHandle("h-42".to_string())
    );
    session.close().await;

    // WHEN: It resumes
    let _tx2 = connector.push_socket();
    session.resume().await.unwrap();

    // THEN: The new connection carries the handle
    let urls = connector.urls.lock().unwrap();
    assert_eq!(urls.len(), 2);
    assert!(urls[1].contains("resumeHandle=h-42"));
    assert_eq!(session.status(), LiveStatus::Connecting);
}

#[tokio::test]
async fn test_second_session_cannot_take_the_socket() {
    let _serial = serial();

    // GIVEN: One session connected and recording
    let connector = Arc::new(FakeConnector::default());
    let (mut first, _tx) = connected(&connector).await;
    let capture = FakeCapture::default();
    assert_ok!(first.start_recording(Box::new(capture.clone())));

    // WHEN: A second session tries to connect
    let _spare = connector.push_socket();
    let mut second = LiveSession::with_connector(options(), connector.clone());
    let result = second.connect().await;

    // THEN: It is refused without touching the relay
    assert!(matches!(result, Err(Error::Busy("live socket"))));
    assert!(!second.is_open());
    assert_eq!(second.status(), LiveStatus::Disconnected);
    assert_eq!(connector.urls.lock().unwrap().len(), 1);
    assert!(first.is_open());
    assert!(first.is_recording());
    assert_eq!(capture.starts.load(Ordering::SeqCst), 1);

    // AND: Once the first session closes, the second one can connect
    first.close().await;
    assert_eq!(capture.stops.load(Ordering::SeqCst), 1);
    assert_ok!(second.connect().await);
    assert!(second.is_open());
}

#[tokio::test]
async fn test_microphone_is_exclusive() {
    let _serial = serial();

    // GIVEN: A capture already holding the microphone
    let first = FakeCapture::default();
    let guard = assert_ok!(CaptureGuard::acquire(Box::new(first.clone())));

    // WHEN: A second capture asks for it
    let second = FakeCapture::default();
    let refused = assert_err!(CaptureGuard::acquire(Box::new(second.clone())));

    // THEN: It is refused and never started
    assert!(matches!(refused, Error::Busy("microphone")));
    assert_eq!(second.starts.load(Ordering::SeqCst), 0);

    // AND: Dropping the holder frees the microphone
    drop(guard);
    assert_eq!(first.stops.load(Ordering::SeqCst), 1);
    let _guard = assert_ok!(CaptureGuard::acquire(Box::new(second.clone())));
    assert_eq!(second.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropped_session_frees_the_socket() {
    let _serial = serial();

    // GIVEN: A connected session that is dropped without closing
    let connector = Arc::new(FakeConnector::default());
    let (session, _tx) = connected(&connector).await;
    drop(session);

    // WHEN: Another session connects
    let _next = connector.push_socket();
    let mut next = LiveSession::with_connector(options(), connector.clone());

    // THEN: The socket is available
    assert_ok!(next.connect().await);
}
