//! Configuration for hubwire connections

use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which transport(s) the connection is allowed to use.
///
/// `Auto` tries all transports in the fixed fallback priority order
/// (WebSockets, Server-Sent Events, forever frame, long polling).
/// `Single` uses exactly one transport and fails the start if the server
/// does not support it. `Ordered` tries the given list in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransportPreference {
    #[default]
    Auto,
    Single(TransportKind),
    Ordered(Vec<TransportKind>),
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Base endpoint URL, e.g. "http://localhost:5000/signalr"
    pub url: String,

    /// Transport preference (single, ordered list, or auto)
    #[serde(default)]
    pub transport: TransportPreference,

    /// Additional query-string pairs appended to every request
    #[serde(default)]
    pub query: Vec<(String, String)>,

    /// Log connection lifecycle at info level instead of debug
    #[serde(default)]
    pub logging: bool,

    /// Send credentials on cross-origin requests
    #[serde(default)]
    pub with_credentials: bool,

    /// Client-side server ping cadence while connected (None disables)
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: Option<u64>,

    /// Base per-transport connect attempt timeout, extended by the
    /// server-negotiated transport connect timeout
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Delay between reconnect attempts inside the reconnect window
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Fraction of the keep-alive interval at which to warn of a slow
    /// connection
    #[serde(default = "default_keep_alive_warn_at")]
    pub keep_alive_warn_at: f64,
}

fn default_ping_interval_secs() -> Option<u64> {
    Some(300)
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    2
}

fn default_keep_alive_warn_at() -> f64 {
    2.0 / 3.0
}

impl ConnectionConfig {
    /// Create a configuration for the given endpoint URL with defaults.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: TransportPreference::Auto,
            query: Vec::new(),
            logging: false,
            with_credentials: false,
            ping_interval_secs: default_ping_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            keep_alive_warn_at: default_keep_alive_warn_at(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
