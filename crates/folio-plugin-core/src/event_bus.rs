//! Synchronous publish/subscribe between the host and its plugins.
//!
//! `emit` runs handlers inline on the caller's task, against a snapshot of the
//! subscriber list taken when `emit` was called. A handler that panics is
//! logged and skipped; the remaining handlers still run and the caller never
//! sees the panic.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, error};

/// Well-known event names emitted by the runtime.
pub mod events {
    pub const PLUGIN_REGISTERED: &str = "plugin:registered";
    pub const PLUGIN_ENABLED: &str = "plugin:enabled";
    pub const PLUGIN_DISABLED: &str = "plugin:disabled";
    pub const PLUGIN_RELOADING: &str = "plugin:reloading";
    pub const PLUGIN_RELOADED: &str = "plugin:reloaded";
    pub const PLUGIN_ERROR: &str = "plugin:error";
    pub const PLUGINS_STARTING: &str = "plugins:starting";
    pub const PLUGINS_STARTED: &str = "plugins:started";
    pub const PLUGINS_ACTIVATING: &str = "plugins:activating";
    pub const PLUGINS_ACTIVATED: &str = "plugins:activated";
    pub const SETTINGS_CHANGED: &str = "settings-changed";
    pub const SETTINGS_CLEARED: &str = "settings-cleared";
}

/// An event handler.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BusInner {
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, event: &str, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }
}

/// Shared event bus. Clones refer to the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `event`.
    ///
    /// A blank event name is ignored and yields an inert subscription.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.trim();
        if event.is_empty() {
            return Subscription::inert();
        }

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        debug!(event = %event, "Handler subscribed");
        Subscription {
            bus: Arc::downgrade(&self.inner),
            event: event.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Remove one handler. Unknown events and ids are ignored.
    pub fn off(&self, event: &str, id: SubscriptionId) {
        let event = event.trim();
        if event.is_empty() {
            return;
        }
        self.inner.remove(event, id);
    }

    /// Invoke every handler currently subscribed to `event`.
    ///
    /// Returns the number of handlers that were invoked, including ones that
    /// panicked.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        let event = event.trim();
        if event.is_empty() {
            return 0;
        }

        let snapshot: Vec<Handler> = {
            let handlers = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match handlers.get(event) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return 0,
            }
        };

        for handler in &snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                error!(
                    event = %event,
                    "Event handler panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }

        snapshot.len()
    }

    /// Number of handlers subscribed to `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.trim())
            .map_or(0, Vec::len)
    }

    /// Events with at least one subscriber, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.event_names())
            .finish()
    }
}

/// Handle returned by [`EventBus::on`].
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    bus: Weak<BusInner>,
    event: String,
    id: SubscriptionId,
    active: AtomicBool,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            bus: Weak::new(),
            event: String::new(),
            id: SubscriptionId(u64::MAX),
            active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the handler. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.event, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::Acquire))
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
