//! Connection core
//!
//! Owns connection identity, state, transport selection and fallback,
//! keep-alive monitoring, and reconnect orchestration.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Connection                        │
//! │  - start(): negotiate, try transports in order        │
//! │  - send(): write through the bound transport          │
//! │  - stop(): teardown from any state                    │
//! └──────────────────────────────────────────────────────┘
//!                │                         ▲
//!                ▼                         │ TransportSignal
//! ┌──────────────────────┐      ┌─────────────────────────┐
//! │   bound Transport     │ ───► │  signal pump (task)      │
//! └──────────────────────┘      └─────────────────────────┘
//!        keep-alive monitor, ping loop, reconnect loop
//!        (tasks, tagged with the generation they serve)
//! ```
//!
//! Every spawned task carries the generation counter value it was armed
//! for; a bumped generation makes stale tasks exit without touching the
//! connection, so a timer firing after a later transition is ignored.
//! All state transitions happen under one lock and are therefore
//! strictly sequential.

pub mod events;
pub mod negotiate;
pub mod state;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, TransportPreference};
use crate::error::ClientError;
use crate::transport::{
    DefaultTransportFactory, SignalReceiver, Transport, TransportContext, TransportFactory,
    TransportKind, TransportSignal,
};

use self::events::{lock, EventRegistry};
use self::negotiate::{negotiate, KeepAliveSettings, Negotiated};
use self::state::{ConnectionState, StateChange};

struct Inner {
    state: ConnectionState,
    negotiated: Option<Negotiated>,
    /// The bound transport. Exclusively owned; only the core calls into it.
    transport: Option<Box<dyn Transport>>,
    /// Bumped whenever the transport binding changes or the connection
    /// is torn down; stale tasks compare against it and exit.
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
    start_in_flight: bool,
}

struct Shared {
    config: ConnectionConfig,
    http: reqwest::Client,
    factory: Box<dyn TransportFactory>,
    events: EventRegistry,
    /// Mirror of `Inner::state` readable without taking the async lock.
    state_cell: AtomicU8,
    inner: tokio::sync::Mutex<Inner>,
    /// Bumped when an in-flight start resolves; concurrent `start`
    /// callers wait on it and report the shared outcome.
    start_done: tokio::sync::watch::Sender<u64>,
    last_received: StdMutex<Instant>,
    /// Deadline of the open reconnect window, when one is running.
    /// Received data pushes it out.
    reconnect_deadline: StdMutex<Option<Instant>>,
    /// Latch so one warn-threshold crossing fires one slow notification.
    /// Re-armed by the next received data.
    slow_warned: AtomicBool,
    last_error: StdMutex<Option<String>>,
    connection_id: StdMutex<Option<String>>,
    connection_data: StdMutex<Option<String>>,
}

/// A logical bidirectional channel to a server, backed by whichever
/// transport won negotiation. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection using the real transports.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_factory(config, Box::new(DefaultTransportFactory))
    }

    /// Create a connection with a custom transport factory.
    pub fn with_factory(config: ConnectionConfig, factory: Box<dyn TransportFactory>) -> Self {
        let http = crate::transport::http::client(config.with_credentials);
        Self {
            shared: Arc::new(Shared {
                config,
                http,
                factory,
                events: EventRegistry::new(),
                state_cell: AtomicU8::new(ConnectionState::Disconnected as u8),
                start_done: tokio::sync::watch::channel(0).0,
                inner: tokio::sync::Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    negotiated: None,
                    transport: None,
                    generation: 0,
                    tasks: Vec::new(),
                    start_in_flight: false,
                }),
                last_received: StdMutex::new(Instant::now()),
                reconnect_deadline: StdMutex::new(None),
                slow_warned: AtomicBool::new(false),
                last_error: StdMutex::new(None),
                connection_id: StdMutex::new(None),
                connection_data: StdMutex::new(None),
            }),
        }
    }

    /// Lifecycle hook registry for this connection.
    pub fn events(&self) -> &EventRegistry {
        &self.shared.events
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state_cell.load(Ordering::SeqCst))
    }

    /// Server-assigned connection id, available while a negotiated
    /// connection exists.
    pub fn connection_id(&self) -> Option<String> {
        lock(&self.shared.connection_id).clone()
    }

    /// Description of the most recent connection-level error.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Aggregate hub registration payload sent with negotiate/connect
    /// requests. Set by the hub layer before `start`.
    pub(crate) fn set_connection_data(&self, data: String) {
        *lock(&self.shared.connection_data) = Some(data);
    }

    /// Start the connection: negotiate, then try transports in priority
    /// order until one succeeds.
    ///
    /// Idempotent: calling while Connecting, Connected, or Reconnecting
    /// short-circuits without a second negotiation or transport, and a
    /// call racing an in-flight start waits for that start and reports
    /// its outcome. Failures are not retried automatically.
    pub async fn start(&self) -> Result<(), ClientError> {
        // Subscribed before the lock so a start resolving between the
        // check and the wait is still observed.
        let mut start_done = self.shared.start_done.subscribe();
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.start_in_flight {
                drop(inner);
                let _ = start_done.changed().await;
                return match self.state() {
                    ConnectionState::Disconnected => Err(ClientError::StartFailed(
                        self.last_error()
                            .unwrap_or_else(|| "start did not complete".to_string()),
                    )),
                    _ => Ok(()),
                };
            }
            if inner.state != ConnectionState::Disconnected {
                debug!(state = %inner.state, "start short-circuited; connection already live");
                return Ok(());
            }
            inner.start_in_flight = true;
        }

        let result = self.shared.run_start().await;

        {
            let mut inner = self.shared.inner.lock().await;
            inner.start_in_flight = false;
            // A failed start never leaves the connection in Connecting.
            if result.is_err() && inner.state != ConnectionState::Disconnected {
                self.shared
                    .transition_locked(&mut inner, ConnectionState::Disconnected);
            }
        }

        if let Err(ref error) = result {
            self.shared.record_error(error);
            self.shared.events.fire_error(error);
        }
        self.shared.start_done.send_modify(|round| *round += 1);
        result
    }

    /// Send a payload over the bound transport. Fails with
    /// [`ClientError::NotConnected`] in any state other than Connected.
    pub async fn send(&self, data: &str) -> Result<(), ClientError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let transport = inner.transport.as_mut().ok_or(ClientError::NotConnected)?;
        transport.send(data).await
    }

    /// Stop the connection from any state. Cancels every outstanding
    /// timer and task, tears the transport down (optionally notifying
    /// the server), and lands in Disconnected.
    pub async fn stop(&self, notify_server: bool) {
        let torn_down = {
            let mut inner = self.shared.inner.lock().await;
            inner.generation += 1;
            for task in inner.tasks.drain(..) {
                task.abort();
            }
            let transport = inner.transport.take();
            let ctx = inner
                .negotiated
                .as_ref()
                .map(|negotiated| self.shared.transport_context(negotiated));
            inner.negotiated = None;
            *lock(&self.shared.reconnect_deadline) = None;
            if inner.state != ConnectionState::Disconnected
                && self
                    .shared
                    .transition_locked(&mut inner, ConnectionState::Disconnected)
            {
                self.shared.events.fire_disconnected();
            }
            transport.map(|transport| (transport, ctx))
        };

        if let Some((mut transport, ctx)) = torn_down {
            match ctx {
                Some(ctx) => transport.abort(&ctx, notify_server).await,
                None => transport.stop().await,
            }
        }
        *lock(&self.shared.connection_id) = None;
        self.shared.log("connection stopped");
    }
}

impl Shared {
    fn log(&self, message: &str) {
        if self.config.logging {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }

    fn record_error(&self, error: &ClientError) {
        *lock(&self.last_error) = Some(error.to_string());
    }

    fn transport_context(&self, negotiated: &Negotiated) -> TransportContext {
        TransportContext {
            url: self.config.url.clone(),
            connection_token: negotiated.connection_token.clone(),
            connection_data: lock(&self.connection_data).clone(),
            query: self.config.query.clone(),
            with_credentials: self.config.with_credentials,
        }
    }

    /// Perform one state transition, firing state-changed in order.
    /// Must be called with the inner lock held so transitions stay
    /// strictly sequential.
    fn transition_locked(&self, inner: &mut Inner, to: ConnectionState) -> bool {
        let old = inner.state;
        if !old.can_transition(to) {
            debug!(from = %old, to = %to, "ignoring illegal state transition");
            return false;
        }
        inner.state = to;
        self.state_cell.store(to as u8, Ordering::SeqCst);
        self.log(&format!("state changed: {} -> {}", old, to));
        self.events.fire_state_changed(&StateChange { old, new: to });
        true
    }

    async fn run_start(self: &Arc<Self>) -> Result<(), ClientError> {
        self.events.fire_starting();
        {
            let mut inner = self.inner.lock().await;
            if !self.transition_locked(&mut inner, ConnectionState::Connecting) {
                return Err(ClientError::StopRequested);
            }
        }
        *lock(&self.last_error) = None;

        let connection_data = lock(&self.connection_data).clone();
        let negotiated = negotiate(&self.http, &self.config, connection_data.as_deref()).await?;
        let candidates = resolve_candidates(&self.config.transport, &negotiated)?;
        let ctx = self.transport_context(&negotiated);
        let connect_timeout = self.config.connect_timeout() + negotiated.transport_connect_timeout;

        let mut failures: Vec<String> = Vec::new();
        for kind in candidates {
            self.log(&format!("trying transport '{}'", kind.name()));
            let mut transport = self.factory.build(kind);
            let (signal_tx, signal_rx) = tokio::sync::mpsc::unbounded_channel();

            match timeout(connect_timeout, transport.start(&ctx, signal_tx)).await {
                Ok(Ok(())) => {
                    let mut inner = self.inner.lock().await;
                    if !self.transition_locked(&mut inner, ConnectionState::Connected) {
                        // Stopped while this transport was connecting.
                        drop(inner);
                        transport.stop().await;
                        return Err(ClientError::StopRequested);
                    }
                    inner.generation += 1;
                    let generation = inner.generation;
                    let keep_alive = if transport.supports_keep_alive() {
                        negotiated.keep_alive
                    } else {
                        None
                    };
                    *lock(&self.connection_id) = Some(negotiated.connection_id.clone());
                    *lock(&self.last_received) = Instant::now();
                    self.slow_warned.store(false, Ordering::SeqCst);
                    inner.negotiated = Some(negotiated);
                    inner.transport = Some(transport);

                    let pump = spawn_pump(Arc::clone(self), signal_rx, generation);
                    inner.tasks.push(pump);
                    if let Some(settings) = keep_alive {
                        inner
                            .tasks
                            .push(spawn_keep_alive(Arc::clone(self), settings, generation));
                    }
                    if let Some(interval) = self.config.ping_interval() {
                        inner
                            .tasks
                            .push(spawn_ping(Arc::clone(self), interval, generation));
                    }
                    self.events.fire_connected();
                    self.log(&format!("connected using '{}'", kind.name()));
                    return Ok(());
                }
                Ok(Err(error)) => {
                    warn!(transport = kind.name(), error = %error, "transport failed to start");
                    transport.abort(&ctx, false).await;
                    failures.push(format!("{}: {}", kind.name(), error));
                }
                Err(_) => {
                    warn!(
                        transport = kind.name(),
                        timeout = ?connect_timeout,
                        "transport start timed out"
                    );
                    transport.abort(&ctx, false).await;
                    failures.push(format!(
                        "{}: connect attempt timed out after {:?}",
                        kind.name(),
                        connect_timeout
                    ));
                }
            }
        }
        Err(ClientError::NoTransportAvailable(failures.join("; ")))
    }

    /// Move a Connected connection into Reconnecting and open the
    /// reconnect window. Ignored for stale generations or when the
    /// connection already left Connected.
    async fn begin_reconnect(self: &Arc<Self>, generation: u64, cause: ClientError) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != ConnectionState::Connected {
            return;
        }
        self.record_error(&cause);
        self.events.fire_error(&cause);
        if !self.transition_locked(&mut inner, ConnectionState::Reconnecting) {
            return;
        }
        let window = inner
            .negotiated
            .as_ref()
            .map(|negotiated| negotiated.reconnect_window)
            .unwrap_or(Duration::ZERO);
        *lock(&self.reconnect_deadline) = Some(Instant::now() + window);
        self.events.fire_reconnecting();
        self.log("connection lost; reconnecting");
        let task = spawn_reconnect(Arc::clone(self), generation, window);
        // Tasks from earlier recovery episodes have exited by now.
        inner.tasks.retain(|task| !task.is_finished());
        inner.tasks.push(task);
    }

    /// Terminal disconnect driven by the core itself (reconnect window
    /// expiry, unrecoverable loss).
    async fn force_disconnect(self: &Arc<Self>, generation: u64, cause: ClientError) {
        let transport = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.generation += 1;
            self.record_error(&cause);
            self.events.fire_error(&cause);
            let transport = inner.transport.take();
            if self.transition_locked(&mut inner, ConnectionState::Disconnected) {
                *lock(&self.reconnect_deadline) = None;
                self.events.fire_disconnected();
            }
            transport
        };
        self.log("connection terminally disconnected");
        if let Some(mut transport) = transport {
            transport.stop().await;
        }
    }
}

fn resolve_candidates(
    preference: &TransportPreference,
    negotiated: &Negotiated,
) -> Result<Vec<TransportKind>, ClientError> {
    match preference {
        TransportPreference::Single(kind) => {
            if negotiated.supports(*kind) {
                Ok(vec![*kind])
            } else {
                Err(ClientError::UnsupportedTransport {
                    transport: kind.name(),
                })
            }
        }
        TransportPreference::Ordered(kinds) => {
            let candidates: Vec<TransportKind> = kinds
                .iter()
                .copied()
                .filter(|kind| negotiated.supports(*kind))
                .collect();
            if candidates.is_empty() {
                Err(ClientError::NoTransportAvailable(
                    "the server supports none of the requested transports".to_string(),
                ))
            } else {
                Ok(candidates)
            }
        }
        TransportPreference::Auto => {
            let candidates: Vec<TransportKind> = TransportKind::FALLBACK_ORDER
                .into_iter()
                .filter(|kind| negotiated.supports(*kind))
                .collect();
            if candidates.is_empty() {
                Err(ClientError::NoTransportAvailable(
                    "the server supports no transport".to_string(),
                ))
            } else {
                Ok(candidates)
            }
        }
    }
}

/// Drains the transport signal channel: inbound data in delivery order,
/// plus transport-initiated loss.
fn spawn_pump(shared: Arc<Shared>, mut signals: SignalReceiver, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            match signal {
                TransportSignal::Data(payload) => {
                    let window = {
                        let inner = shared.inner.lock().await;
                        if inner.generation != generation {
                            return;
                        }
                        inner
                            .negotiated
                            .as_ref()
                            .map(|negotiated| negotiated.reconnect_window)
                            .unwrap_or(Duration::ZERO)
                    };
                    *lock(&shared.last_received) = Instant::now();
                    shared.slow_warned.store(false, Ordering::SeqCst);
                    {
                        // Data during a reconnect window pushes the
                        // deadline out.
                        let mut deadline = lock(&shared.reconnect_deadline);
                        if deadline.is_some() {
                            *deadline = Some(Instant::now() + window);
                        }
                    }
                    shared.events.fire_received(&payload);
                }
                TransportSignal::Lost { transport, reason } => {
                    shared
                        .begin_reconnect(
                            generation,
                            ClientError::TransportLost {
                                transport: transport.name(),
                                reason,
                            },
                        )
                        .await;
                }
            }
        }
    })
}

/// Slow-connection and keep-alive timeout detection. Only armed for
/// transports that support keep-alive. One monitor lives for the whole
/// transport generation, pausing while recovery runs.
fn spawn_keep_alive(
    shared: Arc<Shared>,
    settings: KeepAliveSettings,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let state = {
                let inner = shared.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                inner.state
            };
            match state {
                ConnectionState::Connected => {}
                ConnectionState::Reconnecting => {
                    // Recovery in progress; timing restarts from the
                    // first data after reconnection.
                    tokio::time::sleep(settings.warn_at).await;
                    continue;
                }
                _ => return,
            }
            let last = *lock(&shared.last_received);
            let now = Instant::now();
            if now >= last + settings.timeout {
                shared
                    .begin_reconnect(
                        generation,
                        ClientError::KeepAliveTimeout {
                            interval: settings.timeout,
                        },
                    )
                    .await;
                continue;
            }
            if now >= last + settings.warn_at && !shared.slow_warned.swap(true, Ordering::SeqCst) {
                shared.log("connection slow; no data within the warn threshold");
                shared.events.fire_connection_slow();
            }
            let next = if now < last + settings.warn_at {
                last + settings.warn_at
            } else {
                last + settings.timeout
            };
            tokio::time::sleep_until(next).await;
        }
    })
}

/// Client-side server ping while connected.
fn spawn_ping(shared: Arc<Shared>, interval: Duration, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            let ctx = {
                let inner = shared.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                if inner.state != ConnectionState::Connected {
                    continue;
                }
                match inner.negotiated.as_ref() {
                    Some(negotiated) => shared.transport_context(negotiated),
                    None => return,
                }
            };
            let url = match crate::transport::http::endpoint_url(&ctx, "ping", None) {
                Ok(url) => url,
                Err(error) => {
                    warn!(error = %error, "could not build ping URL");
                    return;
                }
            };
            match shared.http.get(url).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(status = %response.status(), "server ping returned an error status");
                }
                Err(error) => warn!(error = %error, "server ping failed"),
            }
        }
    })
}

/// Drives transport reconnect attempts inside the reconnect window.
fn spawn_reconnect(shared: Arc<Shared>, generation: u64, window: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let delay = shared.config.reconnect_delay();
        let attempt_timeout = shared.config.connect_timeout();
        loop {
            let deadline = match *lock(&shared.reconnect_deadline) {
                Some(deadline) => deadline,
                None => return,
            };
            if Instant::now() >= deadline {
                shared
                    .force_disconnect(generation, ClientError::ReconnectWindowExpired(window))
                    .await;
                return;
            }

            // Check the transport out of the connection for the attempt.
            // The inner lock is never held across the reconnect await,
            // so stop() stays responsive and the window deadline keeps
            // getting checked even when an attempt hangs.
            let (mut transport, ctx) = {
                let mut inner = shared.inner.lock().await;
                if inner.generation != generation || inner.state != ConnectionState::Reconnecting {
                    return;
                }
                let ctx = match inner.negotiated.as_ref() {
                    Some(negotiated) => shared.transport_context(negotiated),
                    None => return,
                };
                match inner.transport.take() {
                    Some(transport) => (transport, ctx),
                    None => return,
                }
            };

            let attempt = timeout(attempt_timeout, transport.reconnect(&ctx)).await;

            let recovered = {
                let mut inner = shared.inner.lock().await;
                if inner.generation != generation {
                    // Torn down while the attempt ran; the transport no
                    // longer has an owner.
                    drop(inner);
                    transport.stop().await;
                    return;
                }
                inner.transport = Some(transport);
                if inner.state != ConnectionState::Reconnecting {
                    return;
                }
                match attempt {
                    Ok(Ok(())) => {
                        if !shared.transition_locked(&mut inner, ConnectionState::Connected) {
                            return;
                        }
                        *lock(&shared.last_received) = Instant::now();
                        shared.slow_warned.store(false, Ordering::SeqCst);
                        *lock(&shared.reconnect_deadline) = None;
                        *lock(&shared.last_error) = None;
                        shared.events.fire_reconnected();
                        true
                    }
                    Ok(Err(ref error)) => {
                        debug!(error = %error, "reconnect attempt failed");
                        false
                    }
                    Err(_) => {
                        debug!(timeout = ?attempt_timeout, "reconnect attempt timed out");
                        false
                    }
                }
            };

            if recovered {
                shared.log("reconnected");
                return;
            }
            if matches!(attempt, Ok(Err(_))) {
                tokio::time::sleep(delay).await;
            }
        }
    })
}
