//! Server-sent events transport.
//!
//! Downstream is a long-lived streaming GET parsed as an SSE event
//! stream; upstream goes through the HTTP send endpoint.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::transport::http::{endpoint_url, notify_abort, post_send, LineBuffer};
use crate::transport::{SignalSender, Transport, TransportContext, TransportKind, TransportSignal};

pub struct ServerSentEventsTransport {
    http: reqwest::Client,
    reader: Option<JoinHandle<()>>,
    signals: Option<SignalSender>,
    /// Context of the open stream, kept for sends through the HTTP
    /// send endpoint.
    ctx: Option<TransportContext>,
}

impl ServerSentEventsTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            reader: None,
            signals: None,
            ctx: None,
        }
    }

    async fn open(&mut self, ctx: &TransportContext, action: &str) -> Result<(), ClientError> {
        self.http = super::http::client(ctx.with_credentials);
        self.ctx = Some(ctx.clone());
        let url = endpoint_url(ctx, action, Some(TransportKind::ServerSentEvents))?;
        debug!(url = %url, "opening event stream");

        let response = self
            .http
            .get(url.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let signals = self
            .signals
            .clone()
            .ok_or(ClientError::NotConnected)?;
        self.shutdown_reader();
        self.reader = Some(spawn_reader(response, signals));
        Ok(())
    }

    fn shutdown_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Default for ServerSentEventsTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reader(response: reqwest::Response, signals: SignalSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut buffer = LineBuffer::new();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    for line in buffer.split(&chunk) {
                        let Some(payload) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let payload = payload.trim_start();
                        // The server opens each stream with a handshake
                        // marker that carries no payload.
                        if payload == "initialized" || payload.is_empty() {
                            trace!("event stream initialized");
                            continue;
                        }
                        if signals
                            .send(TransportSignal::Data(payload.to_string()))
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Some(Err(error)) => {
                    let _ = signals.send(TransportSignal::Lost {
                        transport: TransportKind::ServerSentEvents,
                        reason: error.to_string(),
                    });
                    return;
                }
                None => {
                    let _ = signals.send(TransportSignal::Lost {
                        transport: TransportKind::ServerSentEvents,
                        reason: "event stream ended".to_string(),
                    });
                    return;
                }
            }
        }
    })
}

#[async_trait]
impl Transport for ServerSentEventsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerSentEvents
    }

    fn supports_keep_alive(&self) -> bool {
        true
    }

    async fn start(
        &mut self,
        ctx: &TransportContext,
        signals: SignalSender,
    ) -> Result<(), ClientError> {
        self.signals = Some(signals);
        self.open(ctx, "connect").await.map_err(|e| {
            ClientError::TransportStart {
                transport: TransportKind::ServerSentEvents.name(),
                reason: e.to_string(),
            }
        })
    }

    async fn send(&mut self, data: &str) -> Result<(), ClientError> {
        let ctx = self.ctx.as_ref().ok_or(ClientError::NotConnected)?;
        post_send(&self.http, ctx, TransportKind::ServerSentEvents, data).await
    }

    async fn reconnect(&mut self, ctx: &TransportContext) -> Result<(), ClientError> {
        self.open(ctx, "reconnect").await
    }

    async fn stop(&mut self) {
        self.shutdown_reader();
        self.signals = None;
        self.ctx = None;
    }

    async fn abort(&mut self, ctx: &TransportContext, notify_server: bool) {
        if notify_server {
            notify_abort(&self.http, ctx, TransportKind::ServerSentEvents).await;
        }
        self.stop().await;
    }
}
