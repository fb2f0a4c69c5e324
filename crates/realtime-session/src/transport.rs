//! The seam between the supervisor and whatever carries frames on the wire.
//!
//! [`WebSocketTransport`](crate::WebSocketTransport) is the production
//! implementation; tests plug in scripted transports through the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::Error;

/// One named message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Credentials presented when opening a link.
#[derive(Clone)]
pub struct AuthParams {
    pub user_id: String,
    pub token: String,
}

/// Why a link stopped carrying frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote end deliberately closed the connection.
    Server(Option<String>),
    /// The connection dropped underneath us: idle timeout, network error, EOF.
    Transport(String),
}

/// Everything a link reports back to its owner, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(Frame),
    Error(String),
    Closed(CloseReason),
    /// Frames accepted by [`LinkSender::send`] that never reached the wire,
    /// oldest first. Reported before the `Closed` or `AuthRejected` that
    /// ended the connection.
    Unsent(Vec<Frame>),
    /// Transport-owned retry: one attempt failed.
    RetryFailed(String),
    /// Transport-owned retry: connection is back.
    Reopened,
    /// Transport-owned retry: the transport gave up.
    RetriesExhausted,
    /// The server rejected the credential mid-session.
    AuthRejected(String),
}

/// Write half of an open link.
pub trait LinkSender: Send {
    /// Hand a frame to the transport. Must not block; fails with
    /// [`Error::NotConnected`] when the link cannot currently carry frames.
    /// An accepted frame that is not written before the connection drops
    /// comes back in [`LinkEvent::Unsent`].
    fn send(&mut self, frame: Frame) -> Result<(), Error>;

    /// Close the link. Idempotent.
    fn close(&mut self);
}

/// An open connection handed back by [`Transport::open`].
pub struct Link {
    pub sender: Box<dyn LinkSender>,
    pub events: mpsc::Receiver<LinkEvent>,
    /// The transport retries transport-layer drops on its own and reports
    /// progress through [`LinkEvent::RetryFailed`] / [`LinkEvent::Reopened`].
    pub auto_reconnect: bool,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link and complete the handshake. Resolves once the remote end
    /// has acknowledged the session.
    async fn open(&self, url: &url::Url, auth: &AuthParams) -> Result<Link, Error>;
}
