//! Long-polling transport.
//!
//! Downstream is a poll loop: each GET parks on the server until data
//! arrives or the poll times out empty, then immediately re-issues.
//! Upstream goes through the HTTP send endpoint. The server cannot
//! push keep-alive markers between polls, so keep-alive monitoring is
//! disabled for this transport.

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::transport::http::{endpoint_url, notify_abort, post_send};
use crate::transport::{SignalSender, Transport, TransportContext, TransportKind, TransportSignal};

pub struct LongPollingTransport {
    http: reqwest::Client,
    poller: Option<JoinHandle<()>>,
    signals: Option<SignalSender>,
    ctx: Option<TransportContext>,
}

impl LongPollingTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            poller: None,
            signals: None,
            ctx: None,
        }
    }

    /// Issue the initial request against `action`, then hand the loop
    /// over to a background poller.
    async fn open(&mut self, ctx: &TransportContext, action: &str) -> Result<(), ClientError> {
        self.http = super::http::client(ctx.with_credentials);
        self.ctx = Some(ctx.clone());
        let url = endpoint_url(ctx, action, Some(TransportKind::LongPolling))?;
        debug!(url = %url, "opening poll loop");

        let response = self.http.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let signals = self.signals.clone().ok_or(ClientError::NotConnected)?;
        let body = response.text().await?;
        forward_poll_body(&signals, &body);

        self.shutdown_poller();
        self.poller = Some(spawn_poller(self.http.clone(), ctx.clone(), signals));
        Ok(())
    }

    fn shutdown_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl Default for LongPollingTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn forward_poll_body(signals: &SignalSender, body: &str) {
    let payload = body.trim();
    if payload.is_empty() {
        trace!("empty poll response");
        return;
    }
    let _ = signals.send(TransportSignal::Data(payload.to_string()));
}

fn spawn_poller(
    http: reqwest::Client,
    ctx: TransportContext,
    signals: SignalSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let url = match endpoint_url(&ctx, "poll", Some(TransportKind::LongPolling)) {
            Ok(url) => url,
            Err(error) => {
                let _ = signals.send(TransportSignal::Lost {
                    transport: TransportKind::LongPolling,
                    reason: error.to_string(),
                });
                return;
            }
        };
        loop {
            match http.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.text().await {
                        Ok(body) => forward_poll_body(&signals, &body),
                        Err(error) => {
                            let _ = signals.send(TransportSignal::Lost {
                                transport: TransportKind::LongPolling,
                                reason: error.to_string(),
                            });
                            return;
                        }
                    }
                }
                Ok(response) => {
                    let _ = signals.send(TransportSignal::Lost {
                        transport: TransportKind::LongPolling,
                        reason: format!("poll returned status {}", response.status()),
                    });
                    return;
                }
                Err(error) => {
                    let _ = signals.send(TransportSignal::Lost {
                        transport: TransportKind::LongPolling,
                        reason: error.to_string(),
                    });
                    return;
                }
            }
        }
    })
}

#[async_trait]
impl Transport for LongPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
    }

    fn supports_keep_alive(&self) -> bool {
        false
    }

    async fn start(
        &mut self,
        ctx: &TransportContext,
        signals: SignalSender,
    ) -> Result<(), ClientError> {
        self.signals = Some(signals);
        self.open(ctx, "connect").await.map_err(|e| {
            ClientError::TransportStart {
                transport: TransportKind::LongPolling.name(),
                reason: e.to_string(),
            }
        })
    }

    async fn send(&mut self, data: &str) -> Result<(), ClientError> {
        let ctx = self.ctx.as_ref().ok_or(ClientError::NotConnected)?;
        post_send(&self.http, ctx, TransportKind::LongPolling, data).await
    }

    async fn reconnect(&mut self, ctx: &TransportContext) -> Result<(), ClientError> {
        self.open(ctx, "reconnect").await
    }

    async fn stop(&mut self) {
        self.shutdown_poller();
        self.signals = None;
        self.ctx = None;
    }

    async fn abort(&mut self, ctx: &TransportContext, notify_server: bool) {
        if notify_server {
            notify_abort(&self.http, ctx, TransportKind::LongPolling).await;
        }
        self.stop().await;
    }
}
