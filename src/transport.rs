//! Transport adapters: raw frames from an HTTP stream or a WebSocket.
//!
//! Every transport hands back a [`FrameSource`], a lazy sequence of [`RawFrame`]s bound to
//! one underlying connection. Sources cannot be restarted. Opening again means a new
//! connection.
//!
//! Cancellation is cooperative. An [`AbortHandle`] is passed down when a source is opened.
//! Once it fires, the source drops its connection, discards anything still queued, yields
//! a single `Err(Error::Cancelled)`, and then ends. `Cancelled` is a distinguished outcome,
//! not a transport failure.
//!
//! No transport retries. A failed open or a broken stream surfaces as
//! [`Error::Transport`] carrying the HTTP status or socket close code when one is known.

use crate::types::{ChatRequest, InlineData};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, SplitSink};
use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One undecoded unit from a transport
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    /// Arbitrary slice of an HTTP body, not aligned to frame boundaries
    Chunk(Bytes),
    /// WebSocket text message
    Text(String),
    /// WebSocket binary message (raw audio)
    Binary(Bytes),
    /// WebSocket close handshake
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Cooperative abort signal shared between a controller and a transport.
///
/// Cloning shares the same signal. Aborting more than once is a no-op.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        if !self.token.is_cancelled() {
            log::debug!("Abort requested");
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`abort`](Self::abort) has been called
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

/// Lazy sequence of raw frames from one connection
pub struct FrameSource {
    inner: BoxStream<'static, Result<RawFrame>>,
    abort: AbortHandle,
    finished: bool,
}

impl FrameSource {
    /// Wraps any frame stream. Transports and tests build sources this way.
    pub fn from_stream<S>(stream: S, abort: AbortHandle) -> Self
    where
        S: Stream<Item = Result<RawFrame>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            abort,
            finished: false,
        }
    }

    /// Source over a fixed list of frames
    pub fn from_frames(frames: Vec<RawFrame>, abort: AbortHandle) -> Self {
        Self::from_stream(stream::iter(frames.into_iter().map(Ok)), abort)
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Waits for the next frame.
    ///
    /// Returns `Some(Err(Error::Cancelled))` exactly once after an abort, then `None`.
    /// A transport error also ends the source.
    pub async fn next(&mut self) -> Option<Result<RawFrame>> {
        if self.finished {
            return None;
        }
        if self.abort.is_aborted() {
            return Some(self.cancel());
        }

        let item = tokio::select! {
            biased;
            _ = self.abort.aborted() => None,
            item = self.inner.next() => Some(item),
        };

        match item {
            None => Some(self.cancel()),
            Some(None) => {
                self.finished = true;
                None
            }
            Some(Some(Err(e))) => {
                self.finished = true;
                self.release();
                Some(Err(e))
            }
            Some(Some(Ok(frame))) => Some(Ok(frame)),
        }
    }

    fn cancel(&mut self) -> Result<RawFrame> {
        self.finished = true;
        self.release();
        Err(Error::Cancelled)
    }

    /// Drops the connection and anything it had queued
    fn release(&mut self) {
        self.inner = stream::empty().boxed();
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSource")
            .field("aborted", &self.abort.is_aborted())
            .field("finished", &self.finished)
            .finish()
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Request/response transport for chat turns.
///
/// [`HttpTransport`] talks to the backend. Tests substitute scripted transports.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Opens a streaming response (`POST /chat/stream`)
    async fn open(&self, request: &ChatRequest, abort: AbortHandle) -> Result<FrameSource>;

    /// Fetches a complete response (`POST /chat`)
    async fn complete(&self, request: &ChatRequest) -> Result<Value>;
}

/// Backend transport over `reqwest`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, request: &ChatRequest) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        log::debug!("POST {} (model: {})", url, request.model_id);

        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|e| {
                log::warn!("Failed to read error response body: {}", e);
                String::new()
            });
            return Err(Error::transport_status(
                status.as_u16(),
                error_body_message(&body)
                    .unwrap_or_else(|| format!("Stream failed! status: {}", status.as_u16())),
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: &ChatRequest, abort: AbortHandle) -> Result<FrameSource> {
        let response = tokio::select! {
            biased;
            _ = abort.aborted() => return Err(Error::Cancelled),
            response = self.post("/chat/stream", request) => response?,
        };

        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(RawFrame::Chunk)
                .map_err(|e| Error::transport(e.to_string()))
        });
        Ok(FrameSource::from_stream(body, abort))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Value> {
        let response = self.post("/chat", request).await?;
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| Error::transport(format!("Failed to read response body: {}", e)))?;
        Ok(body)
    }
}

/// Pulls `error.message` or `error` out of a JSON error body
fn error_body_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(message) => Some(message.clone()),
        error => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

// ============================================================================
// WEBSOCKET
// ============================================================================

/// JSON message sent to the live relay
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Text {
        text: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    VideoChunk {
        chunk: InlineData,
    },
    ScreenChunk {
        chunk: InlineData,
    },
}

/// Outbound half of a live connection
#[async_trait]
pub trait LiveSink: Send {
    async fn send_message(&mut self, message: &ClientMessage) -> Result<()>;

    /// Sends raw PCM audio as a binary message
    async fn send_audio(&mut self, pcm: Bytes) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens live connections. [`WsConnector`] is the real one.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(
        &self,
        url: &reqwest::Url,
        abort: AbortHandle,
    ) -> Result<(Box<dyn LiveSink>, FrameSource)>;
}

/// `tokio-tungstenite` connector for the `/live` relay
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl LiveConnector for WsConnector {
    async fn connect(
        &self,
        url: &reqwest::Url,
        abort: AbortHandle,
    ) -> Result<(Box<dyn LiveSink>, FrameSource)> {
        log::info!("Connecting live socket: {}{}", url.host_str().unwrap_or(""), url.path());

        let (ws_stream, _) = tokio::select! {
            biased;
            _ = abort.aborted() => return Err(Error::Cancelled),
            connected = connect_async(url.as_str()) => connected?,
        };
        let (write, read) = ws_stream.split();

        let frames = read.filter_map(|message| async move {
            match message {
                Ok(WsMessage::Text(text)) => Some(Ok(RawFrame::Text(text))),
                Ok(WsMessage::Binary(data)) => Some(Ok(RawFrame::Binary(Bytes::from(data)))),
                Ok(WsMessage::Close(frame)) => Some(Ok(close_frame(frame))),
                // Pings are answered by tungstenite
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            }
        });

        Ok((
            Box::new(WsSink { write }),
            FrameSource::from_stream(frames, abort),
        ))
    }
}

fn close_frame(frame: Option<CloseFrame<'_>>) -> RawFrame {
    match frame {
        Some(frame) => RawFrame::Close {
            code: Some(u16::from(frame.code)),
            reason: Some(frame.reason.into_owned()).filter(|r| !r.is_empty()),
        },
        None => RawFrame::Close {
            code: None,
            reason: None,
        },
    }
}

struct WsSink {
    write: SplitSink<WsConnection, WsMessage>,
}

#[async_trait]
impl LiveSink for WsSink {
    async fn send_message(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.write.send(WsMessage::Text(json)).await?;
        Ok(())
    }

    async fn send_audio(&mut self, pcm: Bytes) -> Result<()> {
        self.write.send(WsMessage::Binary(pcm.to_vec())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.write.send(WsMessage::Close(None)).await?;
        self.write.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(s: &str) -> RawFrame {
        RawFrame::Chunk(Bytes::from(s.to_string()))
    }

    #[tokio::test]
    async fn test_source_yields_frames_then_ends() {
        let mut source =
            FrameSource::from_frames(vec![chunk("a"), chunk("b")], AbortHandle::new());
        assert_eq!(source.next().await.unwrap().unwrap(), chunk("a"));
        assert_eq!(source.next().await.unwrap().unwrap(), chunk("b"));
        assert!(source.next().await.is_none());
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_discards_queued_frames() {
        let abort = AbortHandle::new();
        let mut source = FrameSource::from_frames(vec![chunk("a"), chunk("b")], abort.clone());

        assert!(source.next().await.unwrap().is_ok());
        abort.abort();
        abort.abort();

        assert!(matches!(source.next().await, Some(Err(Error::Cancelled))));
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_wakes_pending_read() {
        let abort = AbortHandle::new();
        let mut source = FrameSource::from_stream(stream::pending(), abort.clone());

        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            trigger.abort();
        });

        assert!(matches!(source.next().await, Some(Err(Error::Cancelled))));
    }

    #[tokio::test]
    async fn test_transport_error_ends_source() {
        let frames = stream::iter(vec![
            Ok(chunk("a")),
            Err(Error::transport("connection reset")),
            Ok(chunk("never")),
        ]);
        let mut source = FrameSource::from_stream(frames, AbortHandle::new());

        assert!(source.next().await.unwrap().is_ok());
        assert!(matches!(
            source.next().await,
            Some(Err(Error::Transport { .. }))
        ));
        assert!(source.next().await.is_none());
    }

    #[test]
    fn test_client_message_shape() {
        let message = ClientMessage::Text {
            text: "hello".to_string(),
            message_id: "m1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "type": "text", "text": "hello", "messageId": "m1" })
        );

        let video = ClientMessage::VideoChunk {
            chunk: InlineData::from_base64("image/jpeg", "/9j/"),
        };
        assert_eq!(
            serde_json::to_value(&video).unwrap(),
            json!({ "type": "video_chunk", "chunk": { "mimeType": "image/jpeg", "data": "/9j/" } })
        );
    }

    #[test]
    fn test_error_body_message() {
        assert_eq!(
            error_body_message(r#"{"error":"model overloaded"}"#).as_deref(),
            Some("model overloaded")
        );
        assert_eq!(
            error_body_message(r#"{"error":{"message":"bad key","code":401}}"#).as_deref(),
            Some("bad key")
        );
        assert_eq!(error_body_message("<html>"), None);
    }
}
