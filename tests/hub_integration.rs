//! Integration tests for the hub RPC layer
//!
//! These tests drive a full hub connection against an in-memory
//! transport and a minimal negotiate server, without a real SignalR
//! endpoint.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hubwire::{
    ClientError, Connection, ConnectionConfig, ConnectionState, HubConnection, Transport,
    TransportContext, TransportFactory, TransportKind, TransportSignal,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;

type SignalSender = UnboundedSender<TransportSignal>;

/// Observation point shared between the test body and the transports
/// the factory hands out.
#[derive(Default)]
struct WireState {
    sent: Mutex<Vec<String>>,
    signals: Mutex<Option<SignalSender>>,
}

impl WireState {
    fn signals(&self) -> SignalSender {
        self.signals
            .lock()
            .unwrap()
            .clone()
            .expect("transport not started")
    }

    /// Invocation envelopes sent so far, parsed.
    fn sent_invocations(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    /// Push a raw payload down to the client as received data.
    fn deliver(&self, payload: Value) {
        self.signals()
            .send(TransportSignal::Data(payload.to_string()))
            .unwrap();
    }
}

struct InMemoryTransport {
    kind: TransportKind,
    state: Arc<WireState>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_keep_alive(&self) -> bool {
        true
    }

    async fn start(
        &mut self,
        _ctx: &TransportContext,
        signals: SignalSender,
    ) -> Result<(), ClientError> {
        *self.state.signals.lock().unwrap() = Some(signals);
        Ok(())
    }

    async fn send(&mut self, data: &str) -> Result<(), ClientError> {
        self.state.sent.lock().unwrap().push(data.to_string());
        Ok(())
    }

    async fn reconnect(&mut self, _ctx: &TransportContext) -> Result<(), ClientError> {
        Ok(())
    }

    async fn stop(&mut self) {}

    async fn abort(&mut self, _ctx: &TransportContext, _notify_server: bool) {}
}

struct InMemoryFactory {
    state: Arc<WireState>,
}

impl TransportFactory for InMemoryFactory {
    fn build(&self, kind: TransportKind) -> Box<dyn Transport> {
        Box::new(InMemoryTransport {
            kind,
            state: Arc::clone(&self.state),
        })
    }
}

const NEGOTIATE_BODY: &str = r#"{
    "ConnectionId": "it-conn",
    "ConnectionToken": "it-token",
    "ProtocolVersion": "1.5",
    "DisconnectTimeout": 30.0,
    "KeepAliveTimeout": 20.0,
    "TryWebSockets": true
}"#;

/// Minimal HTTP server answering every request with the negotiate
/// body, recording request lines for inspection.
async fn spawn_negotiate_server() -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]);
                if let Some(line) = head.lines().next() {
                    seen.lock().unwrap().push(line.to_string());
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    NEGOTIATE_BODY.len(),
                    NEGOTIATE_BODY
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{}/signalr", addr), requests)
}

async fn started_hub() -> (HubConnection, Arc<WireState>, Arc<Mutex<Vec<String>>>) {
    let (url, requests) = spawn_negotiate_server().await;
    let state = Arc::new(WireState::default());
    let mut config = ConnectionConfig::new(url);
    config.ping_interval_secs = None;
    let connection = Connection::with_factory(
        config,
        Box::new(InMemoryFactory {
            state: Arc::clone(&state),
        }),
    );
    let hub = HubConnection::with_connection(connection);
    (hub, state, requests)
}

/// Invocations settle by correlation id, not arrival order.
#[tokio::test]
async fn test_out_of_order_results_settle_by_correlation_id() {
    let (hub, wire, _requests) = started_hub().await;
    let users = hub.create_proxy("userHub");
    users.on("noop", |_| {});
    hub.start().await.unwrap();

    let first = {
        let users = Arc::clone(&users);
        tokio::spawn(async move { users.invoke("getUser", vec![json!(42)]).await })
    };
    let second = {
        let users = Arc::clone(&users);
        tokio::spawn(async move { users.invoke("getOrders", vec![json!(42)]).await })
    };
    let third = {
        let users = Arc::clone(&users);
        tokio::spawn(async move { users.invoke("ping", vec![]).await })
    };

    // Wait until all three envelopes went out.
    let mut invocations = wire.sent_invocations();
    while invocations.len() < 3 {
        tokio::task::yield_now().await;
        invocations = wire.sent_invocations();
    }
    let id_of = |method: &str| -> String {
        invocations
            .iter()
            .find(|envelope| envelope["M"] == method)
            .map(|envelope| envelope["I"].as_str().unwrap().to_string())
            .unwrap()
    };

    // Respond in reverse order of sending.
    wire.deliver(json!({"I": id_of("ping"), "R": "pong"}));
    wire.deliver(json!({"I": id_of("getOrders"), "R": [1, 2, 3]}));
    wire.deliver(json!({"I": id_of("getUser"), "R": {"name": "ada"}}));

    assert_eq!(
        first.await.unwrap().unwrap(),
        Some(json!({"name": "ada"}))
    );
    assert_eq!(second.await.unwrap().unwrap(), Some(json!([1, 2, 3])));
    assert_eq!(third.await.unwrap().unwrap(), Some(json!("pong")));
}

/// Server events dispatch to the right hub and every callback fires in
/// registration order.
#[tokio::test]
async fn test_events_dispatch_per_hub() {
    let (hub, wire, _requests) = started_hub().await;
    let chat = hub.create_proxy("chatHub");
    let presence = hub.create_proxy("presenceHub");
    let log = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&log);
    chat.on("newMessage", move |args| {
        sink.lock().unwrap().push(format!("chat:{}", args[0]));
    });
    let sink = Arc::clone(&log);
    presence.on("userJoined", move |args| {
        sink.lock().unwrap().push(format!("presence:{}", args[0]));
    });
    hub.start().await.unwrap();

    wire.deliver(json!({"H": "chatHub", "M": "newMessage", "A": ["hi"]}));
    wire.deliver(json!({"H": "presenceHub", "M": "userJoined", "A": ["ada"]}));
    wire.deliver(json!({"H": "chatHub", "M": "newMessage", "A": ["again"]}));
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![r#"chat:"hi""#, r#"presence:"ada""#, r#"chat:"again""#]
    );
}

/// Stopping the connection fails outstanding invocations exactly once.
#[tokio::test]
async fn test_stop_fails_pending_invocations() {
    let (hub, wire, _requests) = started_hub().await;
    let proxy = hub.create_proxy("chatHub");
    proxy.on("noop", |_| {});
    hub.start().await.unwrap();

    let pending = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.invoke("slowCall", vec![]).await })
    };
    while wire.sent_invocations().is_empty() {
        tokio::task::yield_now().await;
    }

    hub.stop(false).await;
    let error = pending.await.unwrap().unwrap_err();
    assert!(matches!(error, ClientError::StopRequested));
    assert_eq!(hub.connection().state(), ConnectionState::Disconnected);

    // Invoking after stop fails fast.
    let error = proxy.invoke("late", vec![]).await.unwrap_err();
    assert!(matches!(error, ClientError::NotConnected));
}

/// Hubs with subscriptions are registered with the server during
/// negotiation via the connectionData parameter.
#[tokio::test]
async fn test_negotiate_carries_hub_registrations() {
    let (hub, _wire, requests) = started_hub().await;
    let chat = hub.create_proxy("chatHub");
    chat.on("newMessage", |_| {});
    hub.create_proxy("silentHub"); // no subscriptions, not registered
    hub.start().await.unwrap();

    let negotiate_line = {
        let requests = requests.lock().unwrap();
        requests
            .iter()
            .find(|line| line.contains("/negotiate"))
            .cloned()
            .unwrap()
    };
    assert!(
        negotiate_line.contains("connectionData"),
        "negotiate line: {negotiate_line}"
    );
    assert!(
        negotiate_line.contains("chatHub"),
        "negotiate line: {negotiate_line}"
    );
    assert!(
        !negotiate_line.contains("silentHub"),
        "negotiate line: {negotiate_line}"
    );
}

/// Round-tripped per-hub state: proxy state goes out with invocations
/// and server deltas fold back in.
#[tokio::test]
async fn test_state_round_trip() {
    let (hub, wire, _requests) = started_hub().await;
    let proxy = hub.create_proxy("chatHub");
    proxy.on("noop", |_| {});
    proxy.set_state("room", json!("lobby"));
    hub.start().await.unwrap();

    let call = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.invoke("join", vec![json!("general")]).await })
    };
    let mut invocations = wire.sent_invocations();
    while invocations.is_empty() {
        tokio::task::yield_now().await;
        invocations = wire.sent_invocations();
    }
    assert_eq!(invocations[0]["S"]["room"], json!("lobby"));

    let id = invocations[0]["I"].as_str().unwrap();
    wire.deliver(json!({"I": id, "R": null, "S": {"room": "general"}}));
    call.await.unwrap().unwrap();
    assert_eq!(proxy.state()["room"], json!("general"));
}

/// Raw non-hub payloads still reach the connection-level received hook.
#[tokio::test]
async fn test_raw_received_hook_sees_every_payload() {
    let (hub, wire, _requests) = started_hub().await;
    hub.create_proxy("chatHub").on("noop", |_| {});
    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    hub.connection().events().on_received(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    hub.start().await.unwrap();

    wire.deliver(json!({"C": "d-1", "M": []}));
    wire.deliver(json!({"H": "chatHub", "M": "noop", "A": []}));
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(count.load(Ordering::SeqCst), 2);
}
