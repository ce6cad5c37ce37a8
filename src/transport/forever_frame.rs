//! Forever-frame transport.
//!
//! The browser original streamed script blocks into a hidden iframe;
//! here the downstream is a chunked streaming GET with one payload per
//! non-empty line. Upstream goes through the HTTP send endpoint, like
//! server-sent events.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::transport::http::{endpoint_url, notify_abort, post_send, LineBuffer};
use crate::transport::{SignalSender, Transport, TransportContext, TransportKind, TransportSignal};

pub struct ForeverFrameTransport {
    http: reqwest::Client,
    reader: Option<JoinHandle<()>>,
    signals: Option<SignalSender>,
    ctx: Option<TransportContext>,
}

impl ForeverFrameTransport {
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
        let url = endpoint_url(ctx, action, Some(TransportKind::ForeverFrame))?;
        debug!(url = %url, "opening frame stream");

        let response = self.http.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let signals = self.signals.clone().ok_or(ClientError::NotConnected)?;
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

impl Default for ForeverFrameTransport {
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
                        let payload = line.trim();
                        if payload.is_empty() {
                            continue;
                        }
                        trace!(bytes = payload.len(), "frame payload received");
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
                        transport: TransportKind::ForeverFrame,
                        reason: error.to_string(),
                    });
                    return;
                }
                None => {
                    let _ = signals.send(TransportSignal::Lost {
                        transport: TransportKind::ForeverFrame,
                        reason: "frame stream ended".to_string(),
                    });
                    return;
                }
            }
        }
    })
}

#[async_trait]
impl Transport for ForeverFrameTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ForeverFrame
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
                transport: TransportKind::ForeverFrame.name(),
                reason: e.to_string(),
            }
        })
    }

    async fn send(&mut self, data: &str) -> Result<(), ClientError> {
        let ctx = self.ctx.as_ref().ok_or(ClientError::NotConnected)?;
        post_send(&self.http, ctx, TransportKind::ForeverFrame, data).await
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
            notify_abort(&self.http, ctx, TransportKind::ForeverFrame).await;
        }
        self.stop().await;
    }
}
