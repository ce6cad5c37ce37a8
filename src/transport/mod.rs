//! Transport capability contract and the four concrete transports
//!
//! The connection core drives every transport through the [`Transport`]
//! trait and never depends on a concrete variant. A transport moves raw
//! payloads between client and server; framing is transport-owned. Inbound
//! payloads and transport-initiated loss flow back to the core through a
//! [`TransportSignal`] channel, in delivery order.

pub mod forever_frame;
pub(crate) mod http;
pub mod long_polling;
pub mod server_sent_events;
pub mod websocket;

pub use forever_frame::ForeverFrameTransport;
pub use long_polling::LongPollingTransport;
pub use server_sent_events::ServerSentEventsTransport;
pub use websocket::WebSocketTransport;

use crate::error::ClientError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The four wire transports, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
    ForeverFrame,
    LongPolling,
}

impl TransportKind {
    /// Fallback priority order used when no single transport is requested.
    pub const FALLBACK_ORDER: [TransportKind; 4] = [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::ForeverFrame,
        TransportKind::LongPolling,
    ];

    /// Wire name of the transport, as used in query strings and
    /// negotiation responses.
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::WebSockets => "webSockets",
            TransportKind::ServerSentEvents => "serverSentEvents",
            TransportKind::ForeverFrame => "foreverFrame",
            TransportKind::LongPolling => "longPolling",
        }
    }

    pub fn from_name(name: &str) -> Option<TransportKind> {
        Self::FALLBACK_ORDER
            .into_iter()
            .find(|kind| kind.name() == name)
    }
}

/// A signal from the bound transport back to the connection core.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    /// An inbound payload, in delivery order.
    Data(String),
    /// The transport detected that connectivity is gone.
    Lost {
        transport: TransportKind,
        reason: String,
    },
}

pub type SignalSender = mpsc::UnboundedSender<TransportSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<TransportSignal>;

/// Everything a transport needs to reach the server for one connection.
#[derive(Debug, Clone)]
pub struct TransportContext {
    /// Base endpoint URL
    pub url: String,
    /// Token assigned by server negotiation
    pub connection_token: String,
    /// Aggregate hub registration payload, if any
    pub connection_data: Option<String>,
    /// Caller-supplied query-string additions
    pub query: Vec<(String, String)>,
    /// Keep a cookie jar on the HTTP clients the transports build
    pub with_credentials: bool,
}

/// The capability contract every concrete transport satisfies.
///
/// `start` resolves exactly once per attempt: `Ok` is the success signal,
/// `Err` the failure signal. After a successful start the transport owns
/// the `SignalSender` it was given and reports inbound data and
/// mid-session loss through it.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Whether the keep-alive heuristic applies. When false the core
    /// skips slow/timeout detection and relies solely on
    /// [`TransportSignal::Lost`].
    fn supports_keep_alive(&self) -> bool;

    /// Open the transport. Inbound payloads flow through `signals` once
    /// this returns `Ok`.
    async fn start(
        &mut self,
        ctx: &TransportContext,
        signals: SignalSender,
    ) -> Result<(), ClientError>;

    /// Send a payload over the open transport.
    async fn send(&mut self, data: &str) -> Result<(), ClientError>;

    /// Best-effort re-establishment after mid-session loss. `Ok` means
    /// the transport is carrying data again.
    async fn reconnect(&mut self, ctx: &TransportContext) -> Result<(), ClientError>;

    /// Graceful local teardown.
    async fn stop(&mut self);

    /// Teardown, optionally notifying the server through the abort
    /// endpoint.
    async fn abort(&mut self, ctx: &TransportContext, notify_server: bool);
}

/// Builds transports by kind. The connection core depends on this seam
/// rather than on concrete transports, which also makes the core testable
/// with in-memory transports.
pub trait TransportFactory: Send + Sync {
    fn build(&self, kind: TransportKind) -> Box<dyn Transport>;
}

/// Builds the four real transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, kind: TransportKind) -> Box<dyn Transport> {
        match kind {
            TransportKind::WebSockets => Box::new(WebSocketTransport::new()),
            TransportKind::ServerSentEvents => Box::new(ServerSentEventsTransport::new()),
            TransportKind::ForeverFrame => Box::new(ForeverFrameTransport::new()),
            TransportKind::LongPolling => Box::new(LongPollingTransport::new()),
        }
    }
}
