use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use realtime_session::protocol::{decode_binary, decode_text, encode_frame};
use realtime_session::{
    AuthParams, CloseReason, Config, ConnectionState, Error, Event, EventKind, Frame, JobStatus,
    LinkEvent, Listener, Session, Supervisor, Transport, TransportRetry, WebSocketTransport,
    WireFormat,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;
type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

struct MockRealtimeServer {
    listener: TcpListener,
    port: u16,
}

#[derive(Debug, Clone)]
struct UpgradeRequest {
    uri: String,
    authorization: Option<String>,
}

impl MockRealtimeServer {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    fn config(&self) -> Config {
        Config::for_server(format!("http://127.0.0.1:{}/api", self.port))
    }

    /// Accept one upgrade and record what the client sent with it.
    async fn accept_raw(&self) -> TestResult<(WsStream, UpgradeRequest)> {
        let (tcp, _) = self.listener.accept().await?;
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let ws = tokio_tungstenite::accept_hdr_async(
            tcp,
            move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *s.lock().unwrap() = Some(UpgradeRequest {
                    uri: req.uri().to_string(),
                    authorization: req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                });
                Ok(resp)
            },
        )
        .await?;
        let request = seen.lock().unwrap().take().ok_or("no upgrade request")?;
        Ok((ws, request))
    }

    /// Accept one connection and acknowledge it with `connected`.
    async fn accept_and_handshake(&self) -> TestResult<WsStream> {
        let (mut ws, _) = self.accept_raw().await?;
        send_frame(&mut ws, "connected", json!({})).await?;
        Ok(ws)
    }

    /// Refuse the upgrade with HTTP 401.
    async fn reject_upgrade(&self) -> TestResult<()> {
        let (tcp, _) = self.listener.accept().await?;
        let result = tokio_tungstenite::accept_hdr_async(
            tcp,
            |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                let mut err = ErrorResponse::new(Some("invalid token".into()));
                *err.status_mut() = StatusCode::UNAUTHORIZED;
                Err(err)
            },
        )
        .await;
        assert!(result.is_err());
        Ok(())
    }
}

async fn send_frame(ws: &mut WsStream, event: &str, data: serde_json::Value) -> TestResult<()> {
    let frame = Frame::new(event, data);
    ws.send(encode_frame(&frame, WireFormat::Json)?).await?;
    Ok(())
}

async fn read_frame(ws: &mut WsStream) -> TestResult<Frame> {
    loop {
        let msg = ws.next().await.ok_or("WebSocket closed unexpectedly")??;
        match msg {
            tungstenite::Message::Text(text) => return Ok(decode_text(text.as_str())?),
            tungstenite::Message::Binary(data) => return Ok(decode_binary(&data)?),
            _ => continue,
        }
    }
}

/// Add the `seq` of every `client-note` read before the connection ends.
async fn collect_notes_until_closed(ws: &mut WsStream, seen: &mut BTreeSet<u64>) {
    while let Some(Ok(msg)) = ws.next().await {
        let frame = match msg {
            tungstenite::Message::Text(text) => decode_text(text.as_str()),
            tungstenite::Message::Binary(data) => decode_binary(&data),
            _ => continue,
        };
        match frame {
            Ok(frame) if frame.event == "client-note" => {
                seen.insert(frame.data["seq"].as_u64().unwrap());
            }
            _ => {}
        }
    }
}

fn alice() -> Session {
    Session::new("alice", "token-a")
}

/// Forward every event of the given kinds into a channel.
fn record(sup: &Supervisor, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Listener::infallible(move |event| {
        let _ = tx.send(event.clone());
    });
    for kind in kinds {
        sup.on(*kind, &listener);
    }
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("listener channel closed")
}

async fn next_link_event(rx: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("link event channel closed")
}

fn auth() -> AuthParams {
    AuthParams {
        user_id: "alice".into(),
        token: "token-a".into(),
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_presents_credentials() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let sup = Supervisor::new(config.clone(), WebSocketTransport::from_config(&config)).unwrap();

    let accept = tokio::spawn(async move {
        let (mut ws, request) = server.accept_raw().await.unwrap();
        send_frame(&mut ws, "connected", json!({})).await.unwrap();
        (ws, request)
    });

    sup.connect(alice()).await.unwrap();
    assert_eq!(sup.state(), ConnectionState::Connected);

    let (_ws, request) = accept.await.unwrap();
    assert!(request.uri.starts_with("/socket?"), "{}", request.uri);
    assert!(request.uri.contains("userId=alice"));
    assert!(request.uri.contains("token=token-a"));
    assert_eq!(request.authorization.as_deref(), Some("Bearer token-a"));
}

#[tokio::test]
async fn http_401_is_authentication_error() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let sup = Supervisor::new(config.clone(), WebSocketTransport::from_config(&config)).unwrap();

    let reject = tokio::spawn(async move { server.reject_upgrade().await.unwrap() });

    let err = sup.connect(alice()).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)), "{err:?}");
    assert_eq!(sup.state(), ConnectionState::Disconnected);
    reject.await.unwrap();
}

#[tokio::test]
async fn error_frame_during_handshake_is_authentication_error() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let transport = WebSocketTransport::from_config(&config);
    let url = config.endpoint().unwrap();

    let accept = tokio::spawn(async move {
        let (mut ws, _) = server.accept_raw().await.unwrap();
        send_frame(
            &mut ws,
            "error",
            json!({ "code": 401, "message": "Authentication error: invalid token" }),
        )
        .await
        .unwrap();
        ws
    });

    let err = transport.open(&url, &auth()).await.err().unwrap();
    match err {
        Error::Authentication(message) => assert!(message.contains("invalid token")),
        other => panic!("expected Authentication, got {other:?}"),
    }
    drop(accept.await.unwrap());
}

#[tokio::test]
async fn non_auth_error_frame_is_protocol_error() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let transport = WebSocketTransport::from_config(&config);
    let url = config.endpoint().unwrap();

    let accept = tokio::spawn(async move {
        let (mut ws, _) = server.accept_raw().await.unwrap();
        send_frame(&mut ws, "error", json!({ "code": 503, "message": "draining" }))
            .await
            .unwrap();
        ws
    });

    let err = transport.open(&url, &auth()).await.err().unwrap();
    assert!(matches!(err, Error::Protocol(ref m) if m == "draining"), "{err:?}");
    assert!(err.is_retryable());
    drop(accept.await.unwrap());
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_json_and_msgpack_frames_reach_listeners() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let sup = Supervisor::new(config.clone(), WebSocketTransport::from_config(&config)).unwrap();
    let mut events = record(&sup, &[EventKind::JobStatusUpdate, EventKind::QueueStatsUpdate]);

    let serve = tokio::spawn(async move {
        let mut ws = server.accept_and_handshake().await.unwrap();
        // Missing jobId: dropped without disturbing what follows.
        send_frame(&mut ws, "segmentation-update", json!({ "status": "processing" }))
            .await
            .unwrap();
        send_frame(&mut ws, "unknown-event", json!({})).await.unwrap();
        send_frame(
            &mut ws,
            "segmentationUpdate",
            json!({ "imageId": "img-1", "status": "segmented", "progress": 100 }),
        )
        .await
        .unwrap();
        let stats = Frame::new(
            "queue-stats",
            json!({ "projectId": "p-1", "queued": 3, "processing": 1, "total": 4 }),
        );
        ws.send(encode_frame(&stats, WireFormat::Msgpack).unwrap())
            .await
            .unwrap();
        ws
    });

    sup.connect(alice()).await.unwrap();

    match next_event(&mut events).await {
        Event::JobStatusUpdate(update) => {
            assert_eq!(update.job_id, "img-1");
            assert_eq!(update.status, JobStatus::Completed);
            assert_eq!(update.progress, Some(100.0));
        }
        other => panic!("expected JobStatusUpdate, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::QueueStatsUpdate(stats) => {
            assert_eq!(stats.scope_id, "p-1");
            assert_eq!((stats.queued, stats.processing, stats.total), (3, 1, 4));
        }
        other => panic!("expected QueueStatsUpdate, got {other:?}"),
    }
    assert_eq!(sup.state(), ConnectionState::Connected);
    drop(serve.await.unwrap());
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_messages_flush_in_order_on_connect() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let sup = Supervisor::new(config.clone(), WebSocketTransport::from_config(&config)).unwrap();

    for i in 1..=3 {
        sup.emit("client-note", json!({ "seq": i })).await.unwrap();
    }

    let serve = tokio::spawn(async move {
        let mut ws = server.accept_and_handshake().await.unwrap();
        let mut seqs = Vec::new();
        for _ in 0..4 {
            let frame = read_frame(&mut ws).await.unwrap();
            assert_eq!(frame.event, "client-note");
            seqs.push(frame.data["seq"].as_u64().unwrap());
        }
        (ws, seqs)
    });

    sup.connect(alice()).await.unwrap();
    sup.emit("client-note", json!({ "seq": 4 })).await.unwrap();

    let (_ws, seqs) = serve.await.unwrap();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert_eq!(sup.snapshot().await.unwrap().queued, 0);
}

#[tokio::test]
async fn msgpack_wire_format_sends_binary_frames() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = Config {
        wire_format: WireFormat::Msgpack,
        ..server.config()
    };
    let transport = WebSocketTransport::from_config(&config);
    let url = config.endpoint().unwrap();

    let serve = tokio::spawn(async move {
        let mut ws = server.accept_and_handshake().await.unwrap();
        loop {
            match ws.next().await.unwrap().unwrap() {
                tungstenite::Message::Binary(data) => return decode_binary(&data).unwrap(),
                tungstenite::Message::Text(text) => panic!("unexpected text frame: {text:?}"),
                _ => continue,
            }
        }
    });

    let mut link = transport.open(&url, &auth()).await.unwrap();
    link.sender
        .send(Frame::new("join-room", json!({ "roomId": "p-9" })))
        .unwrap();

    let frame = serve.await.unwrap();
    assert_eq!(frame.event, "join-room");
    assert_eq!(frame.data, json!({ "roomId": "p-9" }));
}

// ---------------------------------------------------------------------------
// Connection loss
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_close_reconnects_and_rejoins_rooms() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let sup = Supervisor::new(config.clone(), WebSocketTransport::from_config(&config)).unwrap();
    let mut events = record(
        &sup,
        &[EventKind::ConnectionOpened, EventKind::ConnectionClosed],
    );

    let serve = tokio::spawn(async move {
        let mut first = server.accept_and_handshake().await.unwrap();
        let join = read_frame(&mut first).await.unwrap();
        assert_eq!(join.event, "join-room");
        first
            .send(tungstenite::Message::Close(None))
            .await
            .unwrap();

        let mut second = server.accept_and_handshake().await.unwrap();
        let rejoin = read_frame(&mut second).await.unwrap();
        (second, rejoin)
    });

    sup.connect(alice()).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::ConnectionOpened);
    sup.join_room("project-1").await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::ConnectionClosed {
            reason: Some("server closed the connection".into())
        }
    );
    assert_eq!(next_event(&mut events).await, Event::ConnectionOpened);

    let (_second, rejoin) = serve.await.unwrap();
    assert_eq!(rejoin.event, "join-room");
    assert_eq!(rejoin.data, json!({ "roomId": "project-1" }));
    assert_eq!(sup.state(), ConnectionState::Connected);
    assert_eq!(sup.snapshot().await.unwrap().backoff_attempt, 0);
}

#[tokio::test]
async fn queued_messages_survive_close_right_after_flush() {
    const NOTES: u64 = 20;
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let sup = Supervisor::new(config.clone(), WebSocketTransport::from_config(&config)).unwrap();

    for seq in 1..=NOTES {
        sup.emit("client-note", json!({ "seq": seq })).await.unwrap();
    }

    let serve = tokio::spawn(async move {
        let mut seen = BTreeSet::new();
        let mut first = server.accept_and_handshake().await.unwrap();
        first
            .send(tungstenite::Message::Close(None))
            .await
            .unwrap();
        collect_notes_until_closed(&mut first, &mut seen).await;

        let mut second = server.accept_and_handshake().await.unwrap();
        while seen.len() < NOTES as usize {
            let frame = read_frame(&mut second).await.unwrap();
            if frame.event == "client-note" {
                seen.insert(frame.data["seq"].as_u64().unwrap());
            }
        }
        (second, seen)
    });

    sup.connect(alice()).await.unwrap();
    let (_second, seen) = tokio::time::timeout(Duration::from_secs(10), serve)
        .await
        .expect("not every queued message arrived")
        .unwrap();
    assert_eq!(seen, (1..=NOTES).collect::<BTreeSet<_>>());
    assert_eq!(sup.state(), ConnectionState::Connected);
    assert_eq!(sup.snapshot().await.unwrap().queued, 0);
}

#[tokio::test]
async fn mid_session_auth_rejection_sends_close_frame() {
    let server = MockRealtimeServer::start().await.unwrap();
    let config = server.config();
    let transport = WebSocketTransport::from_config(&config);
    let url = config.endpoint().unwrap();

    let serve = tokio::spawn(async move {
        let mut ws = server.accept_and_handshake().await.unwrap();
        send_frame(
            &mut ws,
            "error",
            json!({ "code": 401, "message": "Authentication error: token expired" }),
        )
        .await
        .unwrap();
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
                _ => return false,
            }
        }
    });

    let mut link = transport.open(&url, &auth()).await.unwrap();
    match next_link_event(&mut link.events).await {
        LinkEvent::AuthRejected(message) => assert!(message.contains("token expired")),
        other => panic!("expected AuthRejected, got {other:?}"),
    }
    assert!(serve.await.unwrap(), "server saw no close frame");
    assert!(matches!(
        link.sender.send(Frame::new("late", json!(null))),
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn silent_connection_hits_idle_timeout() {
    let server = MockRealtimeServer::start().await.unwrap();
    let transport = WebSocketTransport::new(
        WireFormat::Json,
        Duration::from_millis(200),
        TransportRetry::default(),
    );
    let url = server.config().endpoint().unwrap();

    let serve = tokio::spawn(async move {
        let ws = server.accept_and_handshake().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(ws);
    });

    let mut link = transport.open(&url, &auth()).await.unwrap();
    assert!(!link.auto_reconnect);
    assert_eq!(
        next_link_event(&mut link.events).await,
        LinkEvent::Closed(CloseReason::Transport("idle timeout".into()))
    );
    // No transport-owned retry: the event stream ends.
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), link.events.recv())
            .await
            .unwrap(),
        None
    );
    assert!(matches!(
        link.sender.send(Frame::new("late", json!(null))),
        Err(Error::NotConnected)
    ));
    serve.abort();
}

#[tokio::test]
async fn transport_retry_reopens_dropped_connection() {
    let server = MockRealtimeServer::start().await.unwrap();
    let transport = WebSocketTransport::new(
        WireFormat::Json,
        Duration::from_secs(30),
        TransportRetry {
            max_attempts: 3,
            delay: Duration::from_millis(50),
        },
    );
    let url = server.config().endpoint().unwrap();

    let serve = tokio::spawn(async move {
        let first = server.accept_and_handshake().await.unwrap();
        // Vanish without a close handshake.
        drop(first);
        let mut second = server.accept_and_handshake().await.unwrap();
        let frame = read_frame(&mut second).await.unwrap();
        (second, frame)
    });

    let mut link = transport.open(&url, &auth()).await.unwrap();
    assert!(link.auto_reconnect);

    let closed = next_link_event(&mut link.events).await;
    assert!(
        matches!(closed, LinkEvent::Closed(CloseReason::Transport(_))),
        "{closed:?}"
    );
    assert_eq!(next_link_event(&mut link.events).await, LinkEvent::Reopened);

    link.sender
        .send(Frame::new("after-reopen", json!(null)))
        .unwrap();
    let (_second, frame) = serve.await.unwrap();
    assert_eq!(frame.event, "after-reopen");
}
