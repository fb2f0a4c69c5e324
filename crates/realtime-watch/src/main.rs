//! Connect one realtime session and print every event as a JSON line.
//!
//! ```sh
//! REALTIME_TOKEN=... realtime-watch --server https://app.example.com/api \
//!     --user user-1 --room project-1
//! ```
//!
//! Events go to stdout (pipe to `jq`), logs to stderr.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use realtime_session::{
    Config, ConnectionState, Error, EventKind, Listener, Session, Supervisor, WebSocketTransport,
    WireFormat,
};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "realtime-watch", version)]
struct Cli {
    /// YAML config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Server URL, absolute or relative to --origin
    #[arg(long, env = "REALTIME_SERVER")]
    server: Option<String>,
    /// Origin used to resolve a relative server URL
    #[arg(long)]
    origin: Option<String>,
    #[arg(long, env = "REALTIME_USER")]
    user: String,
    #[arg(long, env = "REALTIME_TOKEN", hide_env_values = true)]
    token: String,
    /// Room to join after connecting (repeatable)
    #[arg(long = "room")]
    rooms: Vec<String>,
    /// Send MessagePack frames instead of JSON
    #[arg(long)]
    msgpack: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Error> {
    let mut config = match &cli.config {
        Some(path) => realtime_session::load(path).await?,
        None => Config::default(),
    };
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(origin) = cli.origin {
        config.origin = Some(origin);
    }
    if cli.msgpack {
        config.wire_format = WireFormat::Msgpack;
    }

    let transport = WebSocketTransport::from_config(&config);
    let supervisor = Supervisor::new(config, transport)?;

    let printer = Listener::new(|event| {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    });
    for kind in EventKind::ALL {
        supervisor.on(kind, &printer);
    }

    match supervisor.connect(Session::new(cli.user, cli.token)).await {
        Ok(()) => {}
        Err(e) if e.is_retryable() => {
            tracing::warn!("Initial connect failed, retrying in background: {e}");
        }
        Err(e) => return Err(e),
    }
    for room in &cli.rooms {
        supervisor.join_room(room).await?;
    }

    let mut states = supervisor.state_changes();
    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                break ExitCode::SUCCESS;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break ExitCode::FAILURE;
                }
                if *states.borrow_and_update() == ConnectionState::Failed {
                    tracing::error!("Connection lost");
                    break ExitCode::FAILURE;
                }
            }
        }
    };

    supervisor.shutdown().await?;
    Ok(code)
}
