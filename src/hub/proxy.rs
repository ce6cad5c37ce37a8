//! Per-hub proxy: event subscriptions, round-tripped state, and
//! server method invocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, Weak};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::connection::events::lock;
use crate::connection::state::ConnectionState;
use crate::error::ClientError;
use crate::hub::protocol::{HubInvocation, ServerInvocation};
use crate::hub::{HubInner, PendingInvocation};

type EventCallback = std::sync::Arc<dyn Fn(&[Value]) + Send + Sync>;

struct Subscription {
    id: u64,
    callback: EventCallback,
}

/// Handle returned by [`HubProxy::on`], used to remove that exact
/// subscription later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    event: String,
    id: u64,
}

/// Client-side face of one named server hub.
///
/// Obtained from [`crate::hub::HubConnection::create_proxy`]; all
/// proxies for one name are the same underlying proxy.
pub struct HubProxy {
    name: String,
    inner: Weak<HubInner>,
    /// Per-hub state bag, round-tripped with every invocation.
    state: StdMutex<HashMap<String, Value>>,
    subscriptions: StdMutex<HashMap<String, Vec<Subscription>>>,
    next_subscription_id: AtomicU64,
}

impl HubProxy {
    pub(crate) fn new(name: String, inner: Weak<HubInner>) -> Self {
        Self {
            name,
            inner,
            state: StdMutex::new(HashMap::new()),
            subscriptions: StdMutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Hub name as registered with the server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe a callback to a server event. Event names are matched
    /// case-insensitively; multiple callbacks per event fire in
    /// registration order.
    pub fn on<F>(&self, event: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let key = event.to_lowercase();
        lock(&self.subscriptions)
            .entry(key.clone())
            .or_default()
            .push(Subscription {
                id,
                callback: std::sync::Arc::new(callback),
            });
        SubscriptionHandle { event: key, id }
    }

    /// Remove one subscription. Unknown handles are ignored.
    pub fn off(&self, handle: &SubscriptionHandle) {
        let mut subscriptions = lock(&self.subscriptions);
        if let Some(list) = subscriptions.get_mut(&handle.event) {
            list.retain(|subscription| subscription.id != handle.id);
            if list.is_empty() {
                subscriptions.remove(&handle.event);
            }
        }
    }

    /// Remove every subscription for an event.
    pub fn off_all(&self, event: &str) {
        lock(&self.subscriptions).remove(&event.to_lowercase());
    }

    /// Whether any event subscription exists. Hubs without
    /// subscriptions are left out of the registration payload.
    pub fn has_subscriptions(&self) -> bool {
        !lock(&self.subscriptions).is_empty()
    }

    /// Snapshot of the per-hub state bag.
    pub fn state(&self) -> HashMap<String, Value> {
        lock(&self.state).clone()
    }

    /// Set one state entry, round-tripped with subsequent invocations.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        lock(&self.state).insert(key.into(), value);
    }

    /// Invoke a method on the server hub and await its result.
    ///
    /// Resolves with the server's return value once the correlated
    /// result arrives; server-reported errors surface as
    /// [`ClientError::Invocation`]. Fails fast with
    /// [`ClientError::NotConnected`] unless the connection is Connected.
    pub async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, ClientError> {
        let inner = self.inner.upgrade().ok_or(ClientError::StopRequested)?;
        if inner.connection.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let id = inner.next_invocation_id.fetch_add(1, Ordering::SeqCst);
        let state = {
            let state = lock(&self.state);
            if state.is_empty() {
                None
            } else {
                Some(state.clone())
            }
        };
        let invocation = HubInvocation {
            hub: self.name.clone(),
            method: method.to_string(),
            args,
            id: id.to_string(),
            state,
        };
        let payload = serde_json::to_string(&invocation)?;

        let (tx, rx) = oneshot::channel();
        lock(&inner.pending).insert(
            id.to_string(),
            PendingInvocation {
                hub: self.name.clone(),
                method: method.to_string(),
                tx,
            },
        );
        trace!(hub = %self.name, method, id, "invoking hub method");

        if let Err(error) = inner.connection.send(&payload).await {
            lock(&inner.pending).remove(&id.to_string());
            return Err(error);
        }

        // The sender is dropped without a value only when the pending
        // table is torn down, which already settles every entry; a bare
        // drop therefore means local shutdown.
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::StopRequested),
        }
    }

    /// Fold a server-sent state delta into the state bag.
    pub(crate) fn merge_state(&self, delta: &HashMap<String, Value>) {
        let mut state = lock(&self.state);
        for (key, value) in delta {
            state.insert(key.clone(), value.clone());
        }
    }

    /// Deliver a server event to every matching subscription, in
    /// registration order.
    pub(crate) fn dispatch(&self, call: &ServerInvocation) {
        if let Some(delta) = &call.state {
            self.merge_state(delta);
        }
        // Snapshot the callbacks so a handler can subscribe or
        // unsubscribe without deadlocking on the table.
        let callbacks: Vec<EventCallback> = lock(&self.subscriptions)
            .get(&call.method.to_lowercase())
            .map(|list| list.iter().map(|s| s.callback.clone()).collect())
            .unwrap_or_default();
        if callbacks.is_empty() {
            debug!(hub = %self.name, method = %call.method, "event has no subscribers");
            return;
        }
        for callback in callbacks {
            callback(&call.args);
        }
    }
}
