//! Negotiation with the server
//!
//! The initial request/response exchange that establishes connection
//! identity and protocol parameters before any transport is opened. The
//! negotiated parameters are immutable for the life of the connection.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::transport::TransportKind;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Protocol version this client speaks. Negotiation hard-fails on any
/// other server version.
pub(crate) const CLIENT_PROTOCOL: &str = "1.5";

/// Raw negotiation response as the server sends it.
#[derive(Debug, Clone, Deserialize)]
pub struct NegotiateResponse {
    #[serde(rename = "ConnectionId")]
    pub connection_id: String,

    #[serde(rename = "ConnectionToken")]
    pub connection_token: String,

    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: String,

    /// Seconds the server waits before considering a silent client gone.
    /// Doubles as the base of the reconnect window.
    #[serde(rename = "DisconnectTimeout")]
    pub disconnect_timeout_secs: f64,

    /// Keep-alive interval in seconds; absent when the server has
    /// keep-alive disabled.
    #[serde(rename = "KeepAliveTimeout", default)]
    pub keep_alive_timeout_secs: Option<f64>,

    /// Extra seconds the server grants each transport connect attempt.
    #[serde(rename = "TransportConnectTimeout", default)]
    pub transport_connect_timeout_secs: f64,

    #[serde(rename = "TryWebSockets", default = "default_true")]
    pub try_websockets: bool,

    /// Explicit transport allow-list; when absent, everything except a
    /// websocket veto via `TryWebSockets` is assumed supported.
    #[serde(rename = "Transports", default)]
    pub transports: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Keep-alive parameters derived from negotiation and the configured
/// warn fraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeepAliveSettings {
    /// Full keep-alive interval. No data for this long means the
    /// connection is treated as lost.
    pub timeout: Duration,
    /// Threshold at which a slow-connection warning fires.
    pub warn_at: Duration,
}

/// Immutable protocol parameters for one negotiated connection.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub connection_id: String,
    pub connection_token: String,
    pub disconnect_timeout: Duration,
    /// Maximum duration of automatic recovery before a lost connection
    /// is declared terminally disconnected.
    pub reconnect_window: Duration,
    pub keep_alive: Option<KeepAliveSettings>,
    pub transport_connect_timeout: Duration,
    pub try_websockets: bool,
    pub server_transports: Option<Vec<String>>,
}

impl Negotiated {
    /// Validate a raw response and derive the connection parameters.
    pub fn from_response(
        response: NegotiateResponse,
        keep_alive_warn_at: f64,
    ) -> Result<Self, ClientError> {
        if response.protocol_version != CLIENT_PROTOCOL {
            return Err(ClientError::ProtocolIncompatible {
                client: CLIENT_PROTOCOL.to_string(),
                server: response.protocol_version,
            });
        }

        let keep_alive = response.keep_alive_timeout_secs.map(|secs| {
            let timeout = Duration::from_secs_f64(secs);
            KeepAliveSettings {
                timeout,
                warn_at: timeout.mul_f64(keep_alive_warn_at),
            }
        });

        let disconnect_timeout = Duration::from_secs_f64(response.disconnect_timeout_secs);
        // The window for automatic recovery spans the disconnect timeout
        // plus however long it can take to notice the loss.
        let reconnect_window =
            disconnect_timeout + keep_alive.map(|k| k.timeout).unwrap_or(Duration::ZERO);

        Ok(Negotiated {
            connection_id: response.connection_id,
            connection_token: response.connection_token,
            disconnect_timeout,
            reconnect_window,
            keep_alive,
            transport_connect_timeout: Duration::from_secs_f64(
                response.transport_connect_timeout_secs.max(0.0),
            ),
            try_websockets: response.try_websockets,
            server_transports: response.transports,
        })
    }

    /// Whether the server supports the given transport.
    pub fn supports(&self, kind: TransportKind) -> bool {
        match &self.server_transports {
            Some(list) => list.iter().any(|name| name == kind.name()),
            None => kind != TransportKind::WebSockets || self.try_websockets,
        }
    }
}

/// Perform the negotiate round trip.
pub async fn negotiate(
    http: &reqwest::Client,
    config: &ConnectionConfig,
    connection_data: Option<&str>,
) -> Result<Negotiated, ClientError> {
    let base = config.url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{}/negotiate", base))
        .map_err(|e| ClientError::InvalidUrl(format!("{}/negotiate: {}", base, e)))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("clientProtocol", CLIENT_PROTOCOL);
        if let Some(data) = connection_data {
            pairs.append_pair("connectionData", data);
        }
        for (key, value) in &config.query {
            pairs.append_pair(key, value);
        }
    }

    debug!(url = %url, "negotiating");

    let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| ClientError::Negotiation(format!("request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(ClientError::Negotiation(format!(
            "server returned {} from {}",
            response.status(),
            url
        )));
    }

    let raw: NegotiateResponse = response
        .json()
        .await
        .map_err(|e| ClientError::Negotiation(format!("malformed response: {}", e)))?;

    let negotiated = Negotiated::from_response(raw, config.keep_alive_warn_at)?;
    debug!(
        connection_id = %negotiated.connection_id,
        reconnect_window = ?negotiated.reconnect_window,
        keep_alive = ?negotiated.keep_alive,
        "negotiation complete"
    );
    Ok(negotiated)
}
