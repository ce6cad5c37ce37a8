//! Lifecycle notification registry
//!
//! Every connection instance owns its own registry; there are no ambient
//! or process-global events. Each hook keeps an ordered list of
//! subscriber callbacks, fired synchronously in registration order.

use crate::connection::state::StateChange;
use crate::error::ClientError;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering from poisoning. The guarded structures
/// stay consistent because every mutation is a single push/drain.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CallbackList<T: ?Sized> {
    callbacks: Mutex<Vec<Box<dyn Fn(&T) + Send + Sync>>>,
}

impl<T: ?Sized> CallbackList<T> {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn add<F: Fn(&T) + Send + Sync + 'static>(&self, callback: F) {
        lock(&self.callbacks).push(Box::new(callback));
    }

    fn fire(&self, argument: &T) {
        let callbacks = lock(&self.callbacks);
        for callback in callbacks.iter() {
            callback(argument);
        }
    }
}

/// Per-connection lifecycle hooks.
pub struct EventRegistry {
    starting: CallbackList<()>,
    connected: CallbackList<()>,
    received: CallbackList<str>,
    state_changed: CallbackList<StateChange>,
    connection_slow: CallbackList<()>,
    reconnecting: CallbackList<()>,
    reconnected: CallbackList<()>,
    disconnected: CallbackList<()>,
    error: CallbackList<ClientError>,
}

impl EventRegistry {
    pub(crate) fn new() -> Self {
        Self {
            starting: CallbackList::new(),
            connected: CallbackList::new(),
            received: CallbackList::new(),
            state_changed: CallbackList::new(),
            connection_slow: CallbackList::new(),
            reconnected: CallbackList::new(),
            reconnecting: CallbackList::new(),
            disconnected: CallbackList::new(),
            error: CallbackList::new(),
        }
    }

    pub fn on_starting<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.starting.add(move |()| callback());
    }

    pub fn on_connected<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.connected.add(move |()| callback());
    }

    pub fn on_received<F: Fn(&str) + Send + Sync + 'static>(&self, callback: F) {
        self.received.add(callback);
    }

    pub fn on_state_changed<F: Fn(StateChange) + Send + Sync + 'static>(&self, callback: F) {
        self.state_changed.add(move |change| callback(*change));
    }

    pub fn on_connection_slow<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.connection_slow.add(move |()| callback());
    }

    pub fn on_reconnecting<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.reconnecting.add(move |()| callback());
    }

    pub fn on_reconnected<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.reconnected.add(move |()| callback());
    }

    pub fn on_disconnected<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.disconnected.add(move |()| callback());
    }

    pub fn on_error<F: Fn(&ClientError) + Send + Sync + 'static>(&self, callback: F) {
        self.error.add(callback);
    }

    pub(crate) fn fire_starting(&self) {
        self.starting.fire(&());
    }

    pub(crate) fn fire_connected(&self) {
        self.connected.fire(&());
    }

    pub(crate) fn fire_received(&self, data: &str) {
        self.received.fire(data);
    }

    pub(crate) fn fire_state_changed(&self, change: &StateChange) {
        self.state_changed.fire(change);
    }

    pub(crate) fn fire_connection_slow(&self) {
        self.connection_slow.fire(&());
    }

    pub(crate) fn fire_reconnecting(&self) {
        self.reconnecting.fire(&());
    }

    pub(crate) fn fire_reconnected(&self) {
        self.reconnected.fire(&());
    }

    pub(crate) fn fire_disconnected(&self) {
        self.disconnected.fire(&());
    }

    pub(crate) fn fire_error(&self, error: &ClientError) {
        self.error.fire(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let registry = EventRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        registry.on_connected(move || lock(&o).push("first"));
        let o = Arc::clone(&order);
        registry.on_connected(move || lock(&o).push("second"));

        registry.fire_connected();
        assert_eq!(*lock(&order), vec!["first", "second"]);
    }

    #[test]
    fn test_received_passes_payload_to_every_subscriber() {
        let registry = EventRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            registry.on_received(move |data| {
                assert_eq!(data, "payload");
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        registry.fire_received("payload");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_state_changed_carries_old_and_new() {
        use crate::connection::state::ConnectionState;
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        registry.on_state_changed(move |change| *lock(&s) = Some(change));
        registry.fire_state_changed(&StateChange {
            old: ConnectionState::Connecting,
            new: ConnectionState::Connected,
        });
        let change = lock(&seen).unwrap();
        assert_eq!(change.old, ConnectionState::Connecting);
        assert_eq!(change.new, ConnectionState::Connected);
    }
}
