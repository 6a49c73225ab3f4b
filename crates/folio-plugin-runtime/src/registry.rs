//! Plugin registry: registered instances plus in-flight registration waits.
//!
//! A registration wait is a `watch` channel shared by every waiter for the
//! same id, paired with a timer task. Whichever comes first settles it:
//! `register()` aborts the timer and hands out the new handle, the timer
//! removes the record and reports a timeout. A wait created outside a tokio
//! runtime starts its timer when it is first polled.

use crate::plugin::{Plugin, PluginHandle};
use folio_plugin_core::{RuntimeError, RuntimeResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default time to wait for a plugin to call `register()`.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_millis(8000);

/// Result of [`PluginRegistry::register`].
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    /// First registration for this id.
    Registered(Arc<PluginHandle>),
    /// The id was already registered; the existing handle is kept.
    Duplicate(Arc<PluginHandle>),
    /// The plugin had no usable id.
    Rejected,
}

#[derive(Debug, Clone)]
enum Settled {
    Registered(Arc<PluginHandle>),
    TimedOut { timeout_ms: u64 },
}

struct PendingRegistration {
    token: u64,
    tx: watch::Sender<Option<Settled>>,
    timeout: Duration,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
    plugins: HashMap<String, Arc<PluginHandle>>,
    pending: HashMap<String, PendingRegistration>,
    next_token: u64,
}

enum Waiter {
    Ready(RuntimeResult<Arc<PluginHandle>>),
    Pending(watch::Receiver<Option<Settled>>),
}

/// Registry of plugin instances. Clones share the same registry.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl PluginRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a plugin instance. The first registration for an id wins.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> RegisterOutcome {
        let id = plugin.id().trim().to_string();
        if id.is_empty() {
            let err = RuntimeError::RegistrationRejected("plugin id is empty".to_string());
            warn!("{}", err);
            return RegisterOutcome::Rejected;
        }

        let mut state = self.lock();
        if let Some(existing) = state.plugins.get(&id) {
            info!(plugin = %id, "Plugin already registered, ignoring duplicate registration");
            return RegisterOutcome::Duplicate(Arc::clone(existing));
        }

        let handle = Arc::new(PluginHandle::new(id.clone(), plugin));
        state.plugins.insert(id.clone(), Arc::clone(&handle));

        if let Some(pending) = state.pending.remove(&id) {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            let _ = pending.tx.send(Some(Settled::Registered(Arc::clone(&handle))));
            debug!(plugin = %id, "Settled pending registration wait");
        }

        RegisterOutcome::Registered(handle)
    }

    /// Wait until `id` is registered, for at most `timeout`.
    ///
    /// The pending record is created when this is called, not when the
    /// returned future is first polled, so a registration that happens in
    /// between is not missed. Concurrent waiters for one id share a single
    /// record and therefore the first waiter's timeout. The record lives
    /// until the plugin registers, the timeout fires, or
    /// [`cancel_wait`](Self::cancel_wait) drops it; in the last case the
    /// wait ends with [`RuntimeError::RegistrationAbandoned`].
    pub fn wait_for_registration(
        &self,
        id: &str,
        timeout: Duration,
    ) -> impl Future<Output = RuntimeResult<Arc<PluginHandle>>> + Send + 'static {
        let id = id.trim().to_string();
        let waiter = self.prepare_wait(&id, timeout);
        let state = Arc::downgrade(&self.state);

        async move {
            let mut rx = match waiter {
                Waiter::Ready(result) => return result,
                Waiter::Pending(rx) => rx,
            };
            if !arm_timer(&state, &id) {
                return Err(RuntimeError::RegistrationAbandoned(id));
            }

            let settled = match rx.wait_for(Option::is_some).await {
                Ok(value) => value.clone(),
                Err(_) => None,
            };

            match settled {
                Some(Settled::Registered(handle)) => Ok(handle),
                Some(Settled::TimedOut { timeout_ms }) => {
                    Err(RuntimeError::RegistrationTimeout { id, timeout_ms })
                }
                None => Err(RuntimeError::RegistrationAbandoned(id)),
            }
        }
    }

    fn prepare_wait(&self, id: &str, timeout: Duration) -> Waiter {
        if id.is_empty() {
            return Waiter::Ready(Err(RuntimeError::RegistrationRejected(
                "cannot wait for an empty plugin id".to_string(),
            )));
        }

        let mut state = self.lock();
        if let Some(handle) = state.plugins.get(id) {
            return Waiter::Ready(Ok(Arc::clone(handle)));
        }
        if let Some(pending) = state.pending.get(id) {
            return Waiter::Pending(pending.tx.subscribe());
        }

        let token = state.next_token;
        state.next_token += 1;

        let (tx, rx) = watch::channel(None);
        let timer = tokio::runtime::Handle::try_current().ok().map(|rt| {
            rt.spawn(expire_after(
                Arc::downgrade(&self.state),
                id.to_string(),
                token,
                timeout,
            ))
        });

        debug!(plugin = %id, timeout_ms = timeout.as_millis() as u64, "Waiting for registration");
        state.pending.insert(
            id.to_string(),
            PendingRegistration {
                token,
                tx,
                timeout,
                timer,
            },
        );
        Waiter::Pending(rx)
    }

    /// Drop the pending registration wait for `id`, if any.
    ///
    /// Waiters end with [`RuntimeError::RegistrationAbandoned`]. A later
    /// `register()` for the id still succeeds.
    pub fn cancel_wait(&self, id: &str) -> bool {
        let id = id.trim();
        let Some(pending) = self.lock().pending.remove(id) else {
            return false;
        };
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        debug!(plugin = %id, "Cancelled registration wait");
        true
    }

    /// Look up a registered plugin. Blank ids are never found.
    pub fn get(&self, id: &str) -> Option<Arc<PluginHandle>> {
        let id = id.trim();
        if id.is_empty() {
            return None;
        }
        self.lock().plugins.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Remove a plugin so that it can register again.
    pub fn evict(&self, id: &str) -> Option<Arc<PluginHandle>> {
        let removed = self.lock().plugins.remove(id.trim());
        if removed.is_some() {
            debug!(plugin = %id.trim(), "Evicted plugin from registry");
        }
        removed
    }

    /// Registered ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().plugins.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.lock().plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registration waits in flight.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.list())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Start the timer of a pending wait that was created outside a tokio
/// runtime. Returns false if there is still no runtime to run it on, in
/// which case the record is dropped.
fn arm_timer(state: &Weak<Mutex<RegistryState>>, id: &str) -> bool {
    let Some(shared) = state.upgrade() else {
        return true;
    };
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(pending) = guard.pending.get_mut(id) else {
        return true;
    };
    if pending.timer.is_some() {
        return true;
    }

    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            pending.timer = Some(rt.spawn(expire_after(
                Weak::clone(state),
                id.to_string(),
                pending.token,
                pending.timeout,
            )));
            true
        }
        Err(_) => {
            warn!(plugin = %id, "No async runtime to time the registration wait");
            guard.pending.remove(id);
            false
        }
    }
}

async fn expire_after(
    state: Weak<Mutex<RegistryState>>,
    id: String,
    token: u64,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;

    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

    let is_ours = state.pending.get(&id).is_some_and(|p| p.token == token);
    if !is_ours {
        return;
    }
    if let Some(pending) = state.pending.remove(&id) {
        let timeout_ms = timeout.as_millis() as u64;
        warn!(plugin = %id, timeout_ms, "Plugin did not register in time");
        let _ = pending.tx.send(Some(Settled::TimedOut { timeout_ms }));
    }
}
