//! WebSocket transport.
//!
//! Opens a single full-duplex socket against the connect endpoint;
//! reconnect replaces it with one opened against the reconnect
//! endpoint. Frames are passed through verbatim, reassembly of the
//! payload is the hub layer's concern.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::transport::http::{endpoint_url, notify_abort, to_ws_scheme};
use crate::transport::{SignalSender, Transport, TransportContext, TransportKind, TransportSignal};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct WebSocketTransport {
    http: reqwest::Client,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
    signals: Option<SignalSender>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            sink: None,
            reader: None,
            signals: None,
        }
    }

    async fn open(&mut self, ctx: &TransportContext, action: &str) -> Result<(), ClientError> {
        self.http = super::http::client(ctx.with_credentials);
        let mut url = endpoint_url(ctx, action, Some(TransportKind::WebSockets))?;
        to_ws_scheme(&mut url)?;
        debug!(url = %url, "opening websocket");

        let (stream, _response) = connect_async(url.as_str()).await?;
        let (sink, source) = stream.split();

        self.shutdown_reader();
        self.sink = Some(sink);
        if let Some(signals) = self.signals.clone() {
            self.reader = Some(spawn_reader(source, signals));
        }
        Ok(())
    }

    fn shutdown_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reader(mut source: WsSource, signals: SignalSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!(bytes = text.len(), "websocket frame received");
                    if signals.send(TransportSignal::Data(text)).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    match String::from_utf8(bytes) {
                        Ok(text) => {
                            if signals.send(TransportSignal::Data(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!("dropping non-UTF-8 binary frame"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "server closed the socket".to_string());
                    let _ = signals.send(TransportSignal::Lost {
                        transport: TransportKind::WebSockets,
                        reason,
                    });
                    return;
                }
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(error)) => {
                    let _ = signals.send(TransportSignal::Lost {
                        transport: TransportKind::WebSockets,
                        reason: error.to_string(),
                    });
                    return;
                }
                None => {
                    let _ = signals.send(TransportSignal::Lost {
                        transport: TransportKind::WebSockets,
                        reason: "socket stream ended".to_string(),
                    });
                    return;
                }
            }
        }
    })
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSockets
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
                transport: TransportKind::WebSockets.name(),
                reason: e.to_string(),
            }
        })
    }

    async fn send(&mut self, data: &str) -> Result<(), ClientError> {
        let sink = self.sink.as_mut().ok_or(ClientError::NotConnected)?;
        sink.send(Message::Text(data.to_string())).await?;
        Ok(())
    }

    async fn reconnect(&mut self, ctx: &TransportContext) -> Result<(), ClientError> {
        self.open(ctx, "reconnect").await
    }

    async fn stop(&mut self) {
        self.shutdown_reader();
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        self.signals = None;
    }

    async fn abort(&mut self, ctx: &TransportContext, notify_server: bool) {
        if notify_server {
            notify_abort(&self.http, ctx, TransportKind::WebSockets).await;
        }
        self.stop().await;
    }
}
