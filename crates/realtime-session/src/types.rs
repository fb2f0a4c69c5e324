//! Public types for the realtime-session crate.

use std::fmt;

use tokio_tungstenite::tungstenite;

/// A boxed error type returned by listener callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Identifies who is connected.
///
/// Two sessions are the same when both the user and the credential match; a
/// `connect` with a different session tears the current one down first.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub token: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Lifecycle state of the supervised connection. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("timed out waiting for in-flight connection attempt")]
    WaitTimeout,

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection attempt superseded by a newer session or disconnect")]
    Superseded,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("supervisor has shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure may clear up on its own and is worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Authentication(_)
                | Error::Config(_)
                | Error::Url(_)
                | Error::Shutdown
                | Error::Superseded
        )
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
