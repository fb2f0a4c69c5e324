//! Supervisor configuration: tunables, YAML loading, endpoint resolution.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::protocol::WireFormat;
use crate::queue::OverflowPolicy;
use crate::types::Error;

pub(crate) const DEFAULT_API_SUFFIX: &str = "/api";
pub(crate) const DEFAULT_SOCKET_PATH: &str = "/socket";
pub(crate) const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_CONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_RECONNECT_NOTICE_THRESHOLD: u32 = 2;
pub(crate) const DEFAULT_MAX_QUEUED_MESSAGES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Absolute server URL (`https://host/api`) or a path relative to `origin`.
    pub server_url: String,
    /// Origin used to resolve a relative `server_url`.
    pub origin: Option<String>,
    /// Suffix stripped from the resolved server path (e.g. the REST prefix).
    pub api_suffix: String,
    /// Path of the realtime endpoint, appended after suffix stripping.
    pub socket_path: String,
    pub max_reconnect_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Bound on a single connection attempt, handshake included.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Bound on how long a `connect` caller waits on an in-flight attempt.
    #[serde(rename = "connect_wait_timeout_ms", with = "duration_ms")]
    pub connect_wait_timeout: Duration,
    /// Transport-layer close when nothing arrives for this long.
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Consecutive failures tolerated before the "reconnecting" signal fires.
    pub reconnect_notice_threshold: u32,
    /// `None` leaves the outbound queue unbounded.
    pub max_queued_messages: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    pub rejoin_rooms_on_reconnect: bool,
    pub wire_format: WireFormat,
    pub transport_retry: TransportRetry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "/".to_string(),
            origin: None,
            api_suffix: DEFAULT_API_SUFFIX.to_string(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_wait_timeout: DEFAULT_CONNECT_WAIT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reconnect_notice_threshold: DEFAULT_RECONNECT_NOTICE_THRESHOLD,
            max_queued_messages: Some(DEFAULT_MAX_QUEUED_MESSAGES),
            overflow_policy: OverflowPolicy::default(),
            rejoin_rooms_on_reconnect: true,
            wire_format: WireFormat::default(),
            transport_retry: TransportRetry::default(),
        }
    }
}

/// Retry budget for the transport's own reconnect loop. `max_attempts: 0`
/// leaves every retry to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportRetry {
    pub max_attempts: u32,
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            delay: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Config pointing at an absolute server URL, defaults elsewhere.
    pub fn for_server(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.max_delay)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let nonzero = [
            ("base_delay_ms", self.base_delay),
            ("heartbeat_interval_ms", self.heartbeat_interval),
            ("connect_timeout_ms", self.connect_timeout),
            ("connect_wait_timeout_ms", self.connect_wait_timeout),
            ("idle_timeout_ms", self.idle_timeout),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.max_reconnect_attempts == 0 {
            return Err(Error::Config(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Config(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay.as_millis(),
                self.max_delay.as_millis()
            )));
        }
        if self.heartbeat_interval >= self.idle_timeout {
            return Err(Error::Config(format!(
                "heartbeat_interval_ms ({}) must be shorter than idle_timeout_ms ({})",
                self.heartbeat_interval.as_millis(),
                self.idle_timeout.as_millis()
            )));
        }
        if self.connect_wait_timeout < self.connect_timeout {
            return Err(Error::Config(
                "connect_wait_timeout_ms must not be shorter than connect_timeout_ms".to_string(),
            ));
        }
        if self.max_queued_messages == Some(0) {
            return Err(Error::Config(
                "max_queued_messages must be at least 1 (omit it for unbounded)".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the realtime endpoint.
    ///
    /// An absolute `server_url` is used as-is; a relative one is joined onto
    /// `origin`. The scheme becomes `ws`/`wss`, a trailing `api_suffix` is
    /// stripped from the path, and `socket_path` is appended.
    pub fn endpoint(&self) -> Result<Url, Error> {
        let mut url = match Url::parse(&self.server_url) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let origin = self.origin.as_deref().ok_or_else(|| {
                    Error::Config(format!(
                        "server_url {:?} is relative but no origin is configured",
                        self.server_url
                    ))
                })?;
                Url::parse(origin)?.join(&self.server_url)?
            }
            Err(e) => return Err(e.into()),
        };

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(Error::Config(format!("unsupported URL scheme: {other}")));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| Error::Config(format!("cannot switch {url} to {scheme}")))?;

        let mut path = url.path().trim_end_matches('/').to_string();
        if let Some(stripped) = path.strip_suffix(self.api_suffix.trim_end_matches('/')) {
            path = stripped.to_string();
        }
        let socket_path = self.socket_path.trim_matches('/');
        if !socket_path.is_empty() {
            path.push('/');
            path.push_str(socket_path);
        }
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

/// Load and validate a config from a YAML file.
pub async fn load(path: &Path) -> Result<Config, Error> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    let config: Config = serde_yaml_ng::from_str(&content)
        .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
