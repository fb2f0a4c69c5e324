//! WebSocket transport: handshake, socket task, and transport-owned retry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use url::Url;

use crate::config::{Config, TransportRetry};
use crate::protocol::{
    WireFormat, control, decode_binary, decode_text, encode_frame, error_message,
    is_auth_rejection,
};
use crate::transport::{AuthParams, CloseReason, Frame, Link, LinkEvent, LinkSender, Transport};
use crate::types::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// [`Transport`] over a single WebSocket connection.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    format: WireFormat,
    idle_timeout: Duration,
    handshake_timeout: Duration,
    retry: TransportRetry,
}

impl WebSocketTransport {
    pub fn new(format: WireFormat, idle_timeout: Duration, retry: TransportRetry) -> Self {
        Self {
            format,
            idle_timeout,
            handshake_timeout: crate::config::DEFAULT_CONNECT_TIMEOUT,
            retry,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            format: config.wire_format,
            idle_timeout: config.idle_timeout,
            handshake_timeout: config.connect_timeout,
            retry: config.transport_retry,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url, auth: &AuthParams) -> Result<Link, Error> {
        let (ws_write, ws_read) = connect_and_handshake(url, auth).await?;
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let gate = Gate::open();

        tokio::spawn(run_socket(
            SocketState {
                ws_read,
                ws_write,
                url: url.clone(),
                auth: auth.clone(),
                format: self.format,
                idle_timeout: self.idle_timeout,
                handshake_timeout: self.handshake_timeout,
                retry: self.retry,
                event_tx,
                gate: gate.clone(),
            },
            out_rx,
        ));

        Ok(Link {
            sender: Box::new(WsSender { out_tx, gate }),
            events: event_rx,
            auto_reconnect: self.retry.max_attempts > 0,
        })
    }
}

enum Outbound {
    Frame(Frame),
    Close,
}

/// Whether the socket currently accepts frames. The sender holds the lock
/// across its channel push, so once the socket task has shut the gate and
/// drained `out_rx`, nothing else can land there.
#[derive(Clone)]
struct Gate(Arc<Mutex<bool>>);

impl Gate {
    fn open() -> Self {
        Self(Arc::new(Mutex::new(true)))
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, open: bool) {
        *self.lock() = open;
    }
}

struct WsSender {
    out_tx: mpsc::UnboundedSender<Outbound>,
    gate: Gate,
}

impl LinkSender for WsSender {
    fn send(&mut self, frame: Frame) -> Result<(), Error> {
        let open = self.gate.lock();
        if !*open {
            return Err(Error::NotConnected);
        }
        self.out_tx
            .send(Outbound::Frame(frame))
            .map_err(|_| Error::NotConnected)
    }

    fn close(&mut self) {
        self.gate.set(false);
        let _ = self.out_tx.send(Outbound::Close);
    }
}

// ---------------------------------------------------------------------------
// Connect + handshake
// ---------------------------------------------------------------------------

fn build_request(url: &Url, auth: &AuthParams) -> Result<tungstenite::handshake::client::Request, Error> {
    let mut target = url.clone();
    target
        .query_pairs_mut()
        .append_pair("userId", &auth.user_id)
        .append_pair("token", &auth.token);
    let mut request = target.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", auth.token))
        .map_err(|e| Error::Authentication(format!("token is not a valid header value: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    Ok(request)
}

fn classify_connect_error(e: tungstenite::Error) -> Error {
    if let tungstenite::Error::Http(ref response) = e {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Error::Authentication(format!("server refused upgrade with HTTP {status}"));
        }
    }
    e.into()
}

async fn connect_and_handshake(url: &Url, auth: &AuthParams) -> Result<(WsWrite, WsRead), Error> {
    let request = build_request(url, auth)?;
    let (ws, _resp) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(classify_connect_error)?;
    let (ws_write, mut ws_read) = ws.split();
    wait_for_connected(&mut ws_read).await?;
    Ok((ws_write, ws_read))
}

fn decode_message(msg: &tungstenite::Message) -> Option<Result<Frame, Error>> {
    match msg {
        tungstenite::Message::Text(text) => Some(decode_text(text.as_str())),
        tungstenite::Message::Binary(data) => Some(decode_binary(data)),
        _ => None,
    }
}

async fn wait_for_connected(ws_read: &mut WsRead) -> Result<(), Error> {
    while let Some(msg) = ws_read.next().await {
        let msg = msg?;
        if let tungstenite::Message::Close(close) = &msg {
            let reason = close.as_ref().map(|c| c.reason.as_str().to_string()).unwrap_or_default();
            return Err(Error::Protocol(format!(
                "connection closed during handshake: {reason}"
            )));
        }
        let Some(frame) = decode_message(&msg) else {
            continue;
        };
        let frame = frame?;
        match frame.event.as_str() {
            control::CONNECTED => return Ok(()),
            control::ERROR => {
                let message = error_message(&frame.data);
                if is_auth_rejection(&frame.data) {
                    return Err(Error::Authentication(message));
                }
                return Err(Error::Protocol(message));
            }
            other => {
                tracing::debug!(event = other, "Ignoring pre-connected frame");
            }
        }
    }
    Err(Error::Protocol(
        "connection closed before connected received".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

struct SocketState {
    ws_read: WsRead,
    ws_write: WsWrite,
    url: Url,
    auth: AuthParams,
    format: WireFormat,
    idle_timeout: Duration,
    handshake_timeout: Duration,
    retry: TransportRetry,
    event_tx: mpsc::Sender<LinkEvent>,
    gate: Gate,
}

enum LoopAction {
    Continue,
    Stop,
    Drop(CloseReason),
    Rejected(String),
}

/// How a live connection ended.
enum Exit {
    Dropped(CloseReason),
    Rejected(String),
}

async fn run_socket(mut p: SocketState, mut out_rx: mpsc::UnboundedReceiver<Outbound>) {
    'outer: loop {
        let mut last_inbound = Instant::now();
        // Taken off `out_rx` but never written.
        let mut unsent = Vec::new();
        let exit = loop {
            let idle_deadline = last_inbound + p.idle_timeout;

            let action = tokio::select! {
                msg = p.ws_read.next() => {
                    match msg {
                        Some(Ok(tungstenite::Message::Close(close))) => {
                            let reason = close
                                .map(|c| c.reason.as_str().to_string())
                                .filter(|r| !r.is_empty());
                            LoopAction::Drop(CloseReason::Server(reason))
                        }
                        Some(Ok(msg)) => {
                            last_inbound = Instant::now();
                            match decode_message(&msg) {
                                Some(Ok(frame)) => handle_inbound(&p, frame).await,
                                Some(Err(e)) => {
                                    tracing::warn!("Failed to decode frame: {e}");
                                    LoopAction::Continue
                                }
                                // Ping/pong are answered by tungstenite.
                                None => LoopAction::Continue,
                            }
                        }
                        Some(Err(e)) => LoopAction::Drop(CloseReason::Transport(e.to_string())),
                        None => LoopAction::Drop(CloseReason::Transport("stream ended".to_string())),
                    }
                }

                cmd = out_rx.recv() => {
                    match cmd {
                        Some(Outbound::Frame(frame)) => match encode_frame(&frame, p.format) {
                            Ok(msg) => match p.ws_write.send(msg).await {
                                Ok(()) => {
                                    tracing::trace!(event = %frame.event, "frame sent");
                                    LoopAction::Continue
                                }
                                Err(e) => {
                                    unsent.push(frame);
                                    LoopAction::Drop(CloseReason::Transport(e.to_string()))
                                }
                            },
                            Err(e) => {
                                tracing::warn!(event = %frame.event, "Failed to encode frame: {e}");
                                LoopAction::Continue
                            }
                        },
                        Some(Outbound::Close) | None => {
                            tracing::debug!("Close requested");
                            let _ = p.ws_write.send(tungstenite::Message::Close(None)).await;
                            LoopAction::Stop
                        }
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline) => {
                    tracing::warn!("Idle timeout");
                    LoopAction::Drop(CloseReason::Transport("idle timeout".to_string()))
                }
            };

            match action {
                LoopAction::Continue => {}
                LoopAction::Stop => {
                    p.gate.set(false);
                    return;
                }
                LoopAction::Drop(reason) => break Exit::Dropped(reason),
                LoopAction::Rejected(message) => break Exit::Rejected(message),
            }
        };

        // --- Connection lost ---
        if drain_outbound(&p.gate, &mut out_rx, &mut unsent) {
            tracing::debug!("Close requested");
            let _ = p.ws_write.send(tungstenite::Message::Close(None)).await;
            return;
        }
        if !unsent.is_empty() {
            tracing::info!(count = unsent.len(), "Returning unsent frames");
            if p.event_tx.send(LinkEvent::Unsent(unsent)).await.is_err() {
                return;
            }
        }
        let reason = match exit {
            Exit::Dropped(reason) => reason,
            Exit::Rejected(message) => {
                tracing::warn!("Credential rejected mid-session: {message}");
                let _ = p.ws_write.send(tungstenite::Message::Close(None)).await;
                let _ = p.event_tx.send(LinkEvent::AuthRejected(message)).await;
                return;
            }
        };
        let server_closed = matches!(reason, CloseReason::Server(_));
        tracing::info!(?reason, "WebSocket closed");
        if p.event_tx.send(LinkEvent::Closed(reason)).await.is_err() {
            return;
        }
        if server_closed || p.retry.max_attempts == 0 {
            return;
        }

        // --- Transport-owned retry ---
        for attempt in 1..=p.retry.max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(p.retry.delay) => {}
                _ = wait_for_close(&mut out_rx) => {
                    tracing::debug!("Close requested during retry");
                    return;
                }
            }

            let result =
                tokio::time::timeout(p.handshake_timeout, connect_and_handshake(&p.url, &p.auth))
                    .await;
            let event = match result {
                Ok(Ok((ws_write, ws_read))) => {
                    p.ws_write = ws_write;
                    p.ws_read = ws_read;
                    p.gate.set(true);
                    tracing::info!(attempt, "WebSocket reopened");
                    if p.event_tx.send(LinkEvent::Reopened).await.is_err() {
                        return;
                    }
                    continue 'outer;
                }
                Ok(Err(Error::Authentication(message))) => {
                    let _ = p.event_tx.send(LinkEvent::AuthRejected(message)).await;
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, "Transport retry failed: {e}");
                    LinkEvent::RetryFailed(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(attempt, "Transport retry timed out");
                    LinkEvent::RetryFailed("handshake timed out".to_string())
                }
            };
            if p.event_tx.send(event).await.is_err() {
                return;
            }
        }

        let _ = p.event_tx.send(LinkEvent::RetriesExhausted).await;
        return;
    }
}

/// Shut the gate and move every frame still waiting in `out_rx` onto
/// `unsent`, preserving order. Returns whether the owner asked to close.
fn drain_outbound(
    gate: &Gate,
    out_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    unsent: &mut Vec<Frame>,
) -> bool {
    gate.set(false);
    let mut close_requested = false;
    while let Ok(cmd) = out_rx.try_recv() {
        match cmd {
            Outbound::Frame(frame) => unsent.push(frame),
            Outbound::Close => close_requested = true,
        }
    }
    close_requested
}

/// Resolve when the owner closes the link. The gate is shut while
/// retrying, so no frames arrive here.
async fn wait_for_close(out_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match out_rx.recv().await {
            Some(Outbound::Frame(frame)) => {
                tracing::debug!(event = %frame.event, "frame sent while reconnecting, ignoring");
            }
            Some(Outbound::Close) | None => return,
        }
    }
}

async fn handle_inbound(p: &SocketState, frame: Frame) -> LoopAction {
    match frame.event.as_str() {
        control::PONG | control::CONNECTED => {
            tracing::trace!(event = %frame.event, "control frame received");
            LoopAction::Continue
        }
        control::ERROR => {
            let message = error_message(&frame.data);
            if is_auth_rejection(&frame.data) {
                return LoopAction::Rejected(message);
            }
            forward(p, LinkEvent::Error(message)).await
        }
        _ => forward(p, LinkEvent::Message(frame)).await,
    }
}

async fn forward(p: &SocketState, event: LinkEvent) -> LoopAction {
    match p.event_tx.send(event).await {
        Ok(()) => LoopAction::Continue,
        // Owner went away.
        Err(_) => LoopAction::Stop,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
