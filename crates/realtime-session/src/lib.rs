//! Client-side realtime session coordinator.
//!
//! Keeps one logical session to a realtime server alive across connection
//! churn and delivers typed status events (job progress, queue statistics,
//! completion notices, system messages) to registered listeners.
//!
//! # Features
//! - Single in-flight connection attempt per session; concurrent `connect`
//!   callers share it
//! - Exponential reconnect backoff with a hard cap and a terminal
//!   "connection lost" signal
//! - Outbound queue flushed in FIFO order after every (re)connect
//! - Heartbeat keep-alive while connected
//! - Per-listener failure isolation
//! - Room membership replayed after reconnect
//! - JSON or MessagePack wire frames over WebSocket
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), realtime_session::Error> {
//! use realtime_session::{Config, Event, EventKind, Listener, Session, Supervisor, WebSocketTransport};
//!
//! let config = Config::for_server("https://app.example.com/api");
//! let transport = WebSocketTransport::from_config(&config);
//! let supervisor = Supervisor::new(config, transport)?;
//!
//! supervisor.on(
//!     EventKind::JobStatusUpdate,
//!     &Listener::infallible(|event| {
//!         if let Event::JobStatusUpdate(update) = event {
//!             println!("{} is {:?}", update.job_id, update.status);
//!         }
//!     }),
//! );
//! supervisor.connect(Session::new("user-1", "token")).await?;
//! supervisor.join_room("project-1").await?;
//! # Ok(())
//! # }
//! ```

mod backoff;
pub mod config;
mod dispatcher;
mod events;
mod heartbeat;
pub mod protocol;
mod queue;
mod rooms;
mod supervisor;
mod transport;
mod types;
mod websocket;

pub use backoff::{BackoffPolicy, BackoffState};
pub use config::{Config, TransportRetry, load};
pub use dispatcher::{DispatchReport, EventDispatcher, Listener};
pub use events::{
    Event, EventKind, JobNotification, JobStatus, JobStatusUpdate, QueueStats, Severity,
    SystemMessage, normalize,
};
pub use heartbeat::HeartbeatMonitor;
pub use protocol::WireFormat;
pub use queue::{OutboundMessageQueue, OverflowPolicy, QueuedMessage};
pub use rooms::RoomSubscriptionManager;
pub use supervisor::{Snapshot, Supervisor};
pub use transport::{AuthParams, CloseReason, Frame, Link, LinkEvent, LinkSender, Transport};
pub use types::{BoxError, ConnectionState, Error, Session};
pub use websocket::WebSocketTransport;
