//! Connection supervisor: the session lifecycle state machine.
//!
//! [`Supervisor`] is a cheap, cloneable handle. All mutable state (the link,
//! backoff counter, outbound queue, heartbeat and room set) is owned by one
//! background task that processes handle commands, link events and timers
//! one at a time, so no two of them ever interleave.
//!
//! Listeners run on that task. A listener that wants to send should use
//! [`Supervisor::emit_detached`]; the message is processed after the current
//! event, never in the middle of a queue flush.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::backoff::BackoffState;
use crate::config::Config;
use crate::dispatcher::{EventDispatcher, Listener};
use crate::events::{Event, EventKind};
use crate::heartbeat::HeartbeatMonitor;
use crate::protocol::control;
use crate::queue::OutboundMessageQueue;
use crate::rooms::RoomSubscriptionManager;
use crate::transport::{AuthParams, CloseReason, Frame, Link, LinkEvent, Transport};
use crate::types::{ConnectionState, Error, Session};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect {
        session: Session,
        reply: Reply<Result<(), Error>>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Emit {
        frame: Frame,
        reply: Option<Reply<Result<(), Error>>>,
    },
    JoinRoom {
        room: String,
        reply: Reply<Result<(), Error>>,
    },
    LeaveRoom {
        room: String,
        reply: Reply<Result<(), Error>>,
    },
    Snapshot {
        reply: Reply<Snapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Point-in-time view of the supervisor's internals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub user_id: Option<String>,
    pub queued: usize,
    pub heartbeat_active: bool,
    pub link_open: bool,
    pub listeners: usize,
    pub rooms: Vec<String>,
    pub backoff_attempt: u32,
}

/// Handle to a supervised realtime session.
///
/// The owning task shuts down when [`shutdown`](Self::shutdown) is called or
/// the last handle is dropped. Handles captured by registered listeners keep
/// it alive until the listeners are cleared.
#[derive(Clone)]
pub struct Supervisor {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: Arc<EventDispatcher>,
    connect_wait_timeout: Duration,
}

impl Supervisor {
    /// Validate `config`, resolve the endpoint and spawn the owning task.
    /// Must be called from within a tokio runtime.
    pub fn new<T: Transport>(config: Config, transport: T) -> Result<Self, Error> {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let dispatcher = Arc::new(EventDispatcher::new());
        let connect_wait_timeout = config.connect_wait_timeout;

        tracing::info!(%endpoint, "Starting realtime supervisor");
        let task = SupervisorTask {
            backoff: BackoffState::new(config.backoff_policy()),
            queue: OutboundMessageQueue::new(config.max_queued_messages, config.overflow_policy),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval),
            rooms: RoomSubscriptionManager::new(),
            config,
            endpoint,
            transport: Arc::new(transport),
            dispatcher: Arc::clone(&dispatcher),
            state_tx,
            session: None,
            link: None,
            attempt: None,
            waiters: Vec::new(),
            retry_at: None,
            library_retrying: false,
            lost_signalled: false,
        };
        tokio::spawn(task.run(command_rx));

        Ok(Self {
            commands,
            state,
            dispatcher,
            connect_wait_timeout,
        })
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Shutdown)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Connect `session`, or wait on the attempt already in flight for it.
    ///
    /// A no-op when that session is already connected. A different session
    /// tears the current one down (listeners included) before connecting.
    /// Gives up with [`Error::WaitTimeout`] after `connect_wait_timeout`.
    pub async fn connect(&self, session: Session) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { session, reply })?;
        match tokio::time::timeout(self.connect_wait_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::WaitTimeout),
        }
    }

    /// Tear everything down: heartbeat, retry timers, link, queue, listeners,
    /// rooms and backoff. Safe in any state.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Send now if connected, otherwise queue for the next connection.
    pub async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), Error> {
        let frame = Frame::new(event, payload);
        self.request(|reply| Command::Emit {
            frame,
            reply: Some(reply),
        })
        .await?
    }

    /// Like [`emit`](Self::emit) but does not wait for the outcome. Usable
    /// from inside a listener. A full queue is logged instead of returned.
    pub fn emit_detached(&self, event: &str, payload: serde_json::Value) -> Result<(), Error> {
        self.send(Command::Emit {
            frame: Frame::new(event, payload),
            reply: None,
        })
    }

    pub async fn join_room(&self, room: &str) -> Result<(), Error> {
        let room = room.to_string();
        self.request(|reply| Command::JoinRoom { room, reply })
            .await?
    }

    pub async fn leave_room(&self, room: &str) -> Result<(), Error> {
        let room = room.to_string();
        self.request(|reply| Command::LeaveRoom { room, reply })
            .await?
    }

    /// Register `listener` for `kind`. Returns `false` if already registered.
    pub fn on(&self, kind: EventKind, listener: &Listener) -> bool {
        self.dispatcher.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        self.dispatcher.off(kind, listener)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn snapshot(&self) -> Result<Snapshot, Error> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Disconnect and stop the owning task. Later calls on any handle fail
    /// with [`Error::Shutdown`].
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Owning task
// ---------------------------------------------------------------------------

struct SupervisorTask {
    config: Config,
    endpoint: Url,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    state_tx: watch::Sender<ConnectionState>,
    session: Option<Session>,
    link: Option<Link>,
    attempt: Option<JoinHandle<Result<Link, Error>>>,
    waiters: Vec<Reply<Result<(), Error>>>,
    /// Next supervisor-owned reconnect attempt.
    retry_at: Option<Instant>,
    /// The link is down and the transport is retrying on its own.
    library_retrying: bool,
    lost_signalled: bool,
    backoff: BackoffState,
    queue: OutboundMessageQueue,
    heartbeat: HeartbeatMonitor,
    rooms: RoomSubscriptionManager,
}

impl SupervisorTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown("shutdown", &Error::Shutdown);
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.teardown("all handles dropped", &Error::Shutdown);
                        break;
                    }
                },
                result = wait_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    match result {
                        Ok(link) => self.on_connected(link),
                        Err(e) => self.on_attempt_failed(e),
                    }
                }
                event = next_link_event(&mut self.link) => self.on_link_event(event),
                () = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.start_attempt();
                }
                () = self.heartbeat.tick() => self.send_heartbeat(),
            }
        }
        tracing::info!("Realtime supervisor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { session, reply } => self.on_connect(session, reply),
            Command::Disconnect { reply } => {
                self.teardown("client disconnect", &Error::Superseded);
                let _ = reply.send(());
            }
            Command::Emit { frame, reply } => {
                let event = frame.event.clone();
                let result = self.send_or_queue(frame);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!(%event, "Detached emit failed: {e}");
                        }
                    }
                }
            }
            Command::JoinRoom { room, reply } => {
                let result = if self.rooms.join(&room) {
                    tracing::info!(%room, "Joining room");
                    self.send_or_queue(RoomSubscriptionManager::join_frame(&room))
                } else {
                    tracing::debug!(%room, "Room already joined");
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::LeaveRoom { room, reply } => {
                let result = if self.rooms.leave(&room) {
                    tracing::info!(%room, "Leaving room");
                    self.send_or_queue(RoomSubscriptionManager::leave_frame(&room))
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// The heartbeat never outlives the `Connected` state.
    fn set_state(&mut self, next: ConnectionState) {
        if next != ConnectionState::Connected {
            self.heartbeat.stop();
        }
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "Connection state changed");
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state(),
            user_id: self.session.as_ref().map(|s| s.user_id.clone()),
            queued: self.queue.len(),
            heartbeat_active: self.heartbeat.is_active(),
            link_open: self.link.is_some(),
            listeners: self.dispatcher.total_listeners(),
            rooms: self.rooms.rooms(),
            backoff_attempt: self.backoff.attempt(),
        }
    }

    // --- Connect / disconnect ---

    fn on_connect(&mut self, session: Session, reply: Reply<Result<(), Error>>) {
        let same = self.session.as_ref() == Some(&session);
        if !same && self.session.is_some() {
            tracing::info!(user_id = %session.user_id, "Session changed, tearing down current session");
            self.teardown("session replaced", &Error::Superseded);
        }
        if same && self.state() == ConnectionState::Connected {
            let _ = reply.send(Ok(()));
            return;
        }

        self.waiters.push(reply);
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Reconnecting if same => {
                tracing::debug!(
                    waiters = self.waiters.len(),
                    "Waiting on in-flight connection"
                );
            }
            _ => {
                tracing::info!(user_id = %session.user_id, "Connecting");
                self.session = Some(session);
                self.backoff.reset();
                self.lost_signalled = false;
                self.set_state(ConnectionState::Connecting);
                self.start_attempt();
            }
        }
    }

    /// Full teardown. Pending `connect` callers receive `waiter_error`.
    fn teardown(&mut self, reason: &str, waiter_error: &Error) {
        let was_connected = self.state() == ConnectionState::Connected;
        self.heartbeat.stop();
        self.retry_at = None;
        self.cancel_attempt();
        self.close_link();
        self.queue.clear();
        self.rooms.clear();
        self.backoff.reset();
        self.fail_waiters(waiter_error);
        self.session = None;
        self.lost_signalled = false;
        self.set_state(ConnectionState::Disconnected);
        if was_connected {
            self.dispatcher.dispatch(&Event::ConnectionClosed {
                reason: Some(reason.to_string()),
            });
        }
        self.dispatcher.clear();
        tracing::info!(reason, "Session torn down");
    }

    fn start_attempt(&mut self) {
        let Some(auth) = self.session.as_ref().map(|session| AuthParams {
            user_id: session.user_id.clone(),
            token: session.token.clone(),
        }) else {
            return;
        };
        self.cancel_attempt();
        let transport = Arc::clone(&self.transport);
        let url = self.endpoint.clone();
        let limit = self.config.connect_timeout;
        tracing::debug!(attempt = self.backoff.attempt() + 1, "Opening link");
        self.attempt = Some(tokio::spawn(async move {
            match tokio::time::timeout(limit, transport.open(&url, &auth)).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout),
            }
        }));
    }

    fn cancel_attempt(&mut self) {
        if let Some(handle) = self.attempt.take() {
            handle.abort();
        }
    }

    fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.sender.close();
        }
        self.library_retrying = false;
    }

    fn fail_waiters(&mut self, e: &Error) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(share_error(e)));
        }
    }

    // --- (Re)connection outcomes ---

    fn on_connected(&mut self, link: Link) {
        let reconnected = self.state() == ConnectionState::Reconnecting;
        self.link = Some(link);
        self.library_retrying = false;
        self.retry_at = None;
        self.backoff.reset();
        self.lost_signalled = false;
        self.set_state(ConnectionState::Connected);

        if let Some(link) = self.link.as_mut() {
            self.queue.flush_to(link.sender.as_mut());
        }
        if reconnected && self.config.rejoin_rooms_on_reconnect {
            for frame in self.rooms.rejoin_frames() {
                if let Err(e) = self.send_or_queue(frame) {
                    tracing::warn!("Failed to rejoin room: {e}");
                }
            }
        }
        self.heartbeat.start();

        tracing::info!(reconnected, "Connected");
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.dispatcher.dispatch(&Event::ConnectionOpened);
    }

    fn on_attempt_failed(&mut self, e: Error) {
        if let Error::Authentication(message) = &e {
            tracing::warn!("Connection rejected: {message}");
            self.dispatcher.dispatch(&Event::ConnectionError {
                message: message.clone(),
            });
            if self.state() == ConnectionState::Connecting {
                self.fail_waiters(&e);
                self.session = None;
                self.set_state(ConnectionState::Disconnected);
            } else {
                self.enter_failed();
            }
            return;
        }

        let attempt = self.backoff.record_failure();
        tracing::warn!(attempt, "Connection attempt failed: {e}");
        self.fail_waiters(&e);
        self.schedule_retry(attempt);
    }

    /// Arm the supervisor-owned retry timer after `attempt` failures, or give
    /// up when the budget is spent.
    fn schedule_retry(&mut self, attempt: u32) {
        if attempt >= self.config.max_reconnect_attempts {
            self.enter_failed();
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.notify_reconnecting(attempt);
        let delay = self.backoff.next_delay();
        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    fn notify_reconnecting(&self, attempt: u32) {
        if attempt > self.config.reconnect_notice_threshold {
            self.dispatcher.dispatch(&Event::Reconnecting { attempt });
        }
    }

    fn enter_failed(&mut self) {
        self.retry_at = None;
        self.cancel_attempt();
        self.close_link();
        self.set_state(ConnectionState::Failed);
        self.fail_waiters(&Error::NotConnected);
        if !self.lost_signalled {
            self.lost_signalled = true;
            let attempts = self.backoff.attempt();
            tracing::error!(attempts, "Giving up on connection");
            self.dispatcher
                .dispatch(&Event::ConnectionLost { attempts });
        }
    }

    // --- Link events ---

    fn on_link_event(&mut self, event: Option<LinkEvent>) {
        let Some(event) = event else {
            // The transport dropped its end without a final report.
            if self.library_retrying {
                self.on_library_exhausted();
            } else {
                self.on_link_lost(CloseReason::Transport("link ended".to_string()));
            }
            return;
        };
        match event {
            LinkEvent::Message(frame) => {
                tracing::trace!(event = %frame.event, "frame received");
                self.dispatcher.dispatch_frame(&frame);
            }
            LinkEvent::Error(message) => {
                tracing::warn!("Server error: {message}");
                self.dispatcher
                    .dispatch(&Event::ConnectionError { message });
            }
            LinkEvent::Unsent(frames) => {
                // Stale keep-alives are not worth resending.
                let frames: Vec<Frame> = frames
                    .into_iter()
                    .filter(|frame| frame.event != control::PING)
                    .collect();
                if !frames.is_empty() {
                    tracing::info!(count = frames.len(), "Requeueing frames the link did not write");
                    self.queue.requeue_front(frames);
                }
            }
            LinkEvent::Closed(reason) => self.on_link_lost(reason),
            LinkEvent::RetryFailed(reason) => {
                let attempt = self.backoff.record_failure();
                tracing::warn!(attempt, "Transport retry failed: {reason}");
                self.fail_waiters(&Error::Protocol(reason));
                if attempt >= self.config.max_reconnect_attempts {
                    self.enter_failed();
                } else {
                    self.notify_reconnecting(attempt);
                }
            }
            LinkEvent::Reopened => {
                if let Some(link) = self.link.take() {
                    self.on_connected(link);
                }
            }
            LinkEvent::RetriesExhausted => self.on_library_exhausted(),
            LinkEvent::AuthRejected(message) => {
                tracing::warn!("Credential rejected mid-session: {message}");
                self.close_link();
                self.dispatcher
                    .dispatch(&Event::ConnectionError { message });
                self.enter_failed();
            }
        }
    }

    fn on_link_lost(&mut self, reason: CloseReason) {
        let was_connected = self.state() == ConnectionState::Connected;
        let library_owned = matches!(reason, CloseReason::Transport(_))
            && self.link.as_ref().is_some_and(|l| l.auto_reconnect);

        if library_owned {
            self.library_retrying = true;
        } else {
            self.close_link();
        }
        self.set_state(ConnectionState::Reconnecting);
        tracing::info!(?reason, library_owned, "Link lost");
        if was_connected {
            self.dispatcher.dispatch(&Event::ConnectionClosed {
                reason: Some(describe(&reason)),
            });
        }
        if !library_owned {
            // Server-initiated closes get one immediate attempt; backoff
            // applies from the first failure on.
            self.start_attempt();
        }
    }

    /// The transport gave up; the supervisor takes over with whatever budget
    /// is left.
    fn on_library_exhausted(&mut self) {
        self.close_link();
        if self.state() == ConnectionState::Failed {
            return;
        }
        tracing::info!(
            attempt = self.backoff.attempt(),
            "Transport retries exhausted, supervisor taking over"
        );
        let attempt = self.backoff.attempt();
        self.schedule_retry(attempt);
    }

    // --- Outbound ---

    /// Send through the live link, preserving FIFO order with anything still
    /// queued. Falls back to the queue when not connected or the send fails.
    fn send_or_queue(&mut self, frame: Frame) -> Result<(), Error> {
        let connected = self.state() == ConnectionState::Connected;
        if let Some(link) = self.link.as_mut().filter(|_| connected) {
            self.queue.flush_to(link.sender.as_mut());
            if self.queue.is_empty() {
                match link.sender.send(frame.clone()) {
                    Ok(()) => {
                        tracing::trace!(event = %frame.event, "frame sent");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(event = %frame.event, "Send failed, queueing: {e}");
                    }
                }
            }
        }
        self.queue.enqueue(&frame.event, frame.data)
    }

    fn send_heartbeat(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let ping = Frame::new(control::PING, json!({ "timestamp": Utc::now().to_rfc3339() }));
        match link.sender.send(ping) {
            Ok(()) => tracing::debug!("Heartbeat sent"),
            Err(e) => tracing::debug!("Heartbeat not sent: {e}"),
        }
    }
}

async fn wait_attempt(attempt: &mut Option<JoinHandle<Result<Link, Error>>>) -> Result<Link, Error> {
    match attempt.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Protocol(format!("connection attempt aborted: {e}"))),
        },
        None => std::future::pending().await,
    }
}

async fn next_link_event(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link.as_mut() {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn describe(reason: &CloseReason) -> String {
    match reason {
        CloseReason::Server(Some(reason)) => reason.clone(),
        CloseReason::Server(None) => "server closed the connection".to_string(),
        CloseReason::Transport(reason) => reason.clone(),
    }
}

/// Copy of `e` for each waiting caller. Variants that carry foreign error
/// types collapse into [`Error::Protocol`] with the same message.
fn share_error(e: &Error) -> Error {
    match e {
        Error::Authentication(m) => Error::Authentication(m.clone()),
        Error::Protocol(m) => Error::Protocol(m.clone()),
        Error::ConnectTimeout => Error::ConnectTimeout,
        Error::WaitTimeout => Error::WaitTimeout,
        Error::NotConnected => Error::NotConnected,
        Error::Superseded => Error::Superseded,
        Error::QueueFull => Error::QueueFull,
        Error::Shutdown => Error::Shutdown,
        Error::Config(m) => Error::Config(m.clone()),
        other => Error::Protocol(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
