//! Error types for the Apsara streaming engine
//!
//! The taxonomy follows how failures surface to a user:
//!
//! - [`Error::Parse`] is recoverable. A malformed frame is logged and dropped,
//!   the stream keeps going.
//! - [`Error::Transport`] and [`Error::Protocol`] terminate the in-flight turn,
//!   which is then shown as an inline error message.
//! - [`Error::Cancelled`] is not a failure. It marks a user-initiated stop.
//! - [`Error::SessionExpired`] ends a live session with an informational notice.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Network or socket failure, carrying the upstream status when known
    #[error("{}", transport_message(.status, .message))]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// Malformed frame (recoverable, the frame is dropped)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed frame that violates the event contract
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// User-initiated abort
    #[error("Request stopped by user")]
    Cancelled,

    /// Live session timer fired
    #[error("Live session expired")]
    SessionExpired,

    /// A second turn was started while one is still streaming
    #[error("Conversation {conversation_id} already has a turn in flight")]
    AlreadyInFlight { conversation_id: String },

    /// A process-wide resource (the live socket or the microphone) is held elsewhere
    #[error("{0} is already in use by another live session")]
    Busy(&'static str),

    /// Unknown conversation or turn
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn transport_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("Transport error ({}): {}", code, message),
        None => format!("Transport error: {}", message),
    }
}

impl Error {
    /// Create a transport error without a status code
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport {
            status: None,
            message: msg.into(),
        }
    }

    /// Create a transport error carrying an HTTP status or socket close code
    pub fn transport_status(status: u16, msg: impl Into<String>) -> Self {
        Error::Transport {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Create a new parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an in-flight conflict error
    pub fn already_in_flight(conversation_id: impl Into<String>) -> Self {
        Error::AlreadyInFlight {
            conversation_id: conversation_id.into(),
        }
    }

    /// True for a user-initiated stop
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True when the stream may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Parse(_))
    }

    /// True when this error should end the in-flight turn as `Errored`
    pub fn is_turn_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Protocol(_) | Error::Http(_) | Error::Json(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => Error::transport_status(
                response.status().as_u16(),
                "WebSocket handshake rejected",
            ),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Error::transport("WebSocket connection closed")
            }
            other => Error::transport(other.to_string()),
        }
    }
}
