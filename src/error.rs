//! Error types for hubwire

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Incompatible protocol version: client supports {client}, server requires {server}")]
    ProtocolIncompatible { client: String, server: String },

    #[error("Transport '{transport}' is not supported by the server")]
    UnsupportedTransport { transport: &'static str },

    #[error("Transport '{transport}' failed to start: {reason}")]
    TransportStart {
        transport: &'static str,
        reason: String,
    },

    #[error("No transport could be started: {0}")]
    NoTransportAvailable(String),

    #[error("Connection start failed: {0}")]
    StartFailed(String),

    #[error("Transport '{transport}' lost the connection: {reason}")]
    TransportLost {
        transport: &'static str,
        reason: String,
    },

    #[error("No data received within the keep-alive interval of {interval:?}")]
    KeepAliveTimeout { interval: Duration },

    #[error("Reconnect window of {0:?} expired before the connection recovered")]
    ReconnectWindowExpired(Duration),

    #[error("Server returned an error for '{method}': {message}")]
    Invocation { method: String, message: String },

    #[error("Connection is not in the Connected state")]
    NotConnected,

    #[error("Connection was stopped while the operation was pending")]
    StopRequested,

    #[error("Connection was lost: {0}")]
    ConnectionLost(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
