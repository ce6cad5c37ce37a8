//! Hub RPC layer
//!
//! Sits on top of [`crate::connection::Connection`] and adds typed
//! method invocation with correlated results, server-to-client event
//! dispatch, and per-hub round-tripped state. One hub connection
//! multiplexes any number of named hubs over a single wire connection.

pub mod protocol;
pub mod proxy;

pub use proxy::{HubProxy, SubscriptionHandle};

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::connection::events::lock;
use crate::connection::Connection;
use crate::error::ClientError;

use self::protocol::{parse_inbound, HubResult, InboundMessage, ServerInvocation};

/// An invocation awaiting its correlated server result.
pub(crate) struct PendingInvocation {
    pub(crate) hub: String,
    pub(crate) method: String,
    pub(crate) tx: oneshot::Sender<Result<Option<Value>, ClientError>>,
}

pub(crate) struct HubInner {
    pub(crate) connection: Connection,
    /// Invocations keyed by their wire id. Settled exactly once: by the
    /// correlated result, or by connection teardown.
    pub(crate) pending: StdMutex<HashMap<String, PendingInvocation>>,
    pub(crate) next_invocation_id: AtomicU64,
    /// Proxies keyed by lowercased hub name; one proxy per name.
    proxies: StdMutex<HashMap<String, Arc<HubProxy>>>,
}

impl HubInner {
    fn proxy(&self, hub: &str) -> Option<Arc<HubProxy>> {
        lock(&self.proxies).get(&hub.to_lowercase()).cloned()
    }

    /// Route one raw inbound payload to its consumer.
    fn route(&self, raw: &str) {
        match parse_inbound(raw) {
            Ok(InboundMessage::Result(result)) => self.settle(result),
            Ok(InboundMessage::ServerCall(call)) => self.dispatch(call),
            Ok(InboundMessage::Other(value)) => {
                trace!(payload = %value, "ignoring non-hub payload");
            }
            Err(error) => {
                debug!(error = %error, "dropping unparseable hub payload");
            }
        }
    }

    /// Settle the pending invocation the result correlates to.
    fn settle(&self, result: HubResult) {
        let Some(pending) = lock(&self.pending).remove(&result.id) else {
            debug!(id = %result.id, "result does not match a pending invocation");
            return;
        };
        if let Some(delta) = &result.state {
            if let Some(proxy) = self.proxy(&pending.hub) {
                proxy.merge_state(delta);
            }
        }
        let outcome = match result.error {
            Some(message) => Err(ClientError::Invocation {
                method: pending.method.clone(),
                message,
            }),
            None => Ok(result.result),
        };
        // The caller may have given up on the invocation already.
        let _ = pending.tx.send(outcome);
    }

    fn dispatch(&self, call: ServerInvocation) {
        match self.proxy(&call.hub) {
            Some(proxy) => proxy.dispatch(&call),
            None => {
                debug!(hub = %call.hub, method = %call.method, "event for an unregistered hub");
            }
        }
    }

    /// Fail every pending invocation after the connection is gone.
    /// Each invocation settles exactly once.
    fn fail_all_pending(&self) {
        let drained: Vec<PendingInvocation> = {
            let mut pending = lock(&self.pending);
            pending.drain().map(|(_, invocation)| invocation).collect()
        };
        if drained.is_empty() {
            return;
        }
        let cause = self.connection.last_error();
        warn!(
            count = drained.len(),
            "failing pending invocations after disconnect"
        );
        for invocation in drained {
            let error = match &cause {
                Some(reason) => ClientError::ConnectionLost(reason.clone()),
                None => ClientError::StopRequested,
            };
            let _ = invocation.tx.send(Err(error));
        }
    }
}

/// A connection speaking the hub protocol.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<HubInner>,
}

impl HubConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connection(Connection::new(config))
    }

    /// Layer the hub protocol over an existing connection.
    pub fn with_connection(connection: Connection) -> Self {
        let inner = Arc::new(HubInner {
            connection,
            pending: StdMutex::new(HashMap::new()),
            next_invocation_id: AtomicU64::new(1),
            proxies: StdMutex::new(HashMap::new()),
        });

        // The hooks hold weak references; the registry living inside
        // the connection must not keep the hub layer alive.
        let router: Weak<HubInner> = Arc::downgrade(&inner);
        inner.connection.events().on_received(move |data| {
            if let Some(inner) = router.upgrade() {
                inner.route(data);
            }
        });
        let terminator: Weak<HubInner> = Arc::downgrade(&inner);
        inner.connection.events().on_disconnected(move || {
            if let Some(inner) = terminator.upgrade() {
                inner.fail_all_pending();
            }
        });

        Self { inner }
    }

    /// Get (or create) the proxy for a named hub. Proxies created
    /// before `start` and carrying subscriptions are registered with
    /// the server during negotiation.
    pub fn create_proxy(&self, name: &str) -> Arc<HubProxy> {
        let key = name.to_lowercase();
        lock(&self.inner.proxies)
            .entry(key)
            .or_insert_with(|| {
                Arc::new(HubProxy::new(
                    name.to_string(),
                    Arc::downgrade(&self.inner),
                ))
            })
            .clone()
    }

    /// Start the underlying connection, registering every hub that has
    /// at least one event subscription.
    pub async fn start(&self) -> Result<(), ClientError> {
        let registrations: Vec<Value> = {
            let proxies = lock(&self.inner.proxies);
            proxies
                .values()
                .filter(|proxy| proxy.has_subscriptions())
                .map(|proxy| json!({"Name": proxy.name()}))
                .collect()
        };
        if !registrations.is_empty() {
            let data = serde_json::to_string(&registrations)?;
            self.inner.connection.set_connection_data(data);
        }
        self.inner.connection.start().await
    }

    /// Stop the underlying connection. Pending invocations fail with
    /// [`ClientError::StopRequested`].
    pub async fn stop(&self, notify_server: bool) {
        self.inner.connection.stop(notify_server).await;
    }

    /// The underlying connection, for state, lifecycle hooks, and
    /// raw sends.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }
}
