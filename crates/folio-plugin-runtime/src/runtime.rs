//! The runtime facade.
//!
//! A [`PluginRuntime`] is a cheap handle around shared state; clones drive the
//! same runtime. Enable/disable live in `lifecycle` and hot reload in
//! [`crate::reload`], both as further `impl PluginRuntime` blocks.

use crate::config::{EnabledConfig, RuntimeConfig, StartConfig};
use crate::host::{HostContext, HostExtensions};
use crate::lifecycle::EnabledSet;
use crate::loader::{Loader, NoopLoader};
use crate::plugin::{Plugin, PluginHandle};
use crate::registry::{PluginRegistry, RegisterOutcome, DEFAULT_REGISTRATION_TIMEOUT};
use folio_plugin_core::{
    events, get_dependencies, get_dependents, load_order, EventBus, Manifest,
    MemorySettingsBackend, RuntimeResult, SettingsBackend, SettingsStore, Subscription,
    SubscriptionId,
};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared by every clone of a [`PluginRuntime`].
pub(crate) struct RuntimeInner {
    pub(crate) events: EventBus,
    pub(crate) settings: SettingsStore,
    pub(crate) registry: PluginRegistry,
    pub(crate) extensions: HostExtensions,
    pub(crate) loader: Arc<dyn Loader>,
    pub(crate) manifest: RwLock<Option<Arc<Manifest>>>,
    /// `None` until a start (or an enable) first computes it.
    pub(crate) enabled: RwLock<Option<EnabledSet>>,
    /// Ids a load pass or reload currently owns, with the number of owners.
    /// Their registration does not trigger a separate init.
    pub(crate) loading: Mutex<HashMap<String, usize>>,
    pub(crate) started: AtomicBool,
    pub(crate) dev_mode: AtomicBool,
    pub(crate) registration_timeout_ms: AtomicU64,
    /// Number of completed or in-flight starts. Held for a whole `start`.
    pub(crate) start_gate: tokio::sync::Mutex<u64>,
}

/// Builder for [`PluginRuntime`].
#[derive(Default)]
pub struct PluginRuntimeBuilder {
    loader: Option<Arc<dyn Loader>>,
    settings_backend: Option<Arc<dyn SettingsBackend>>,
    config: RuntimeConfig,
}

impl PluginRuntimeBuilder {
    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn settings_backend(mut self, backend: Arc<dyn SettingsBackend>) -> Self {
        self.settings_backend = Some(backend);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> PluginRuntime {
        let events = EventBus::new();
        let backend = self
            .settings_backend
            .unwrap_or_else(|| Arc::new(MemorySettingsBackend::new()));
        let settings = SettingsStore::new(backend, events.clone(), self.config.settings_debounce());

        let timeout_ms = match self.config.runtime.registration_timeout_ms {
            0 => DEFAULT_REGISTRATION_TIMEOUT.as_millis() as u64,
            ms => ms,
        };

        PluginRuntime {
            inner: Arc::new(RuntimeInner {
                events,
                settings,
                registry: PluginRegistry::new(),
                extensions: HostExtensions::new(),
                loader: self.loader.unwrap_or_else(|| Arc::new(NoopLoader)),
                manifest: RwLock::new(None),
                enabled: RwLock::new(None),
                loading: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                dev_mode: AtomicBool::new(self.config.runtime.dev_mode),
                registration_timeout_ms: AtomicU64::new(timeout_ms),
                start_gate: tokio::sync::Mutex::new(0),
            }),
        }
    }
}

/// Host-embeddable plugin runtime.
#[derive(Clone)]
pub struct PluginRuntime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Default for PluginRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRuntime {
    /// A runtime with no loader and in-memory settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> PluginRuntimeBuilder {
        PluginRuntimeBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    /// Register a plugin instance.
    ///
    /// Returns false when the plugin was rejected or its id is already taken.
    /// After `start`, a newly registered enabled plugin is initialized in the
    /// background.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> bool {
        let handle = match self.inner.registry.register(plugin) {
            RegisterOutcome::Registered(handle) => handle,
            RegisterOutcome::Duplicate(_) | RegisterOutcome::Rejected => return false,
        };

        info!(plugin = %handle.id(), "Registered plugin");
        self.inner
            .events
            .emit(events::PLUGIN_REGISTERED, &json!({ "id": handle.id() }));

        if self.is_started() && !self.is_loading(handle.id()) {
            self.spawn_init(handle);
        }
        true
    }

    fn spawn_init(&self, handle: Arc<PluginHandle>) {
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let runtime = self.clone();
                rt.spawn(async move {
                    runtime.init_plugin_if_enabled(handle).await;
                });
            }
            Err(_) => {
                warn!(plugin = %handle.id(), "No async runtime available, plugin will init on next start");
            }
        }
    }

    /// Start or re-activate the runtime.
    ///
    /// Overlapping calls run one after another in call order. The first call
    /// emits `plugins:starting`/`plugins:started`, later ones
    /// `plugins:activating`/`plugins:activated`, with a full load pass in
    /// between.
    pub async fn start(&self, config: StartConfig) {
        let mut starts = self.inner.start_gate.lock().await;
        let first = *starts == 0;
        *starts += 1;

        if let Some(dev_mode) = config.dev_mode {
            self.set_dev_mode(dev_mode);
        }
        if let Some(ms) = config.registration_timeout_ms.filter(|ms| *ms > 0) {
            self.inner
                .registration_timeout_ms
                .store(ms, Ordering::Release);
        }

        self.inner.settings.load().await;

        let manifest_supplied = config.manifest.is_some();
        match config.manifest {
            Some(manifest) => self.apply_manifest(manifest),
            None if self.read_manifest().is_none() => self.apply_manifest(Manifest::default()),
            None => {}
        }
        self.compute_enabled(config.enabled, manifest_supplied);

        let (before, after) = if first {
            (events::PLUGINS_STARTING, events::PLUGINS_STARTED)
        } else {
            (events::PLUGINS_ACTIVATING, events::PLUGINS_ACTIVATED)
        };

        self.inner.started.store(true, Ordering::Release);
        info!(enabled = ?self.get_enabled(), "{}", before);
        self.inner
            .events
            .emit(before, &json!({ "enabled": self.get_enabled() }));

        self.run_load_pass(None).await;

        info!(plugins = ?self.list_plugins(), "{}", after);
        self.inner.events.emit(
            after,
            &json!({ "enabled": self.get_enabled(), "plugins": self.list_plugins() }),
        );
    }

    fn compute_enabled(&self, explicit: Option<EnabledConfig>, manifest_supplied: bool) {
        let manifest = self.manifest();
        let mut enabled = self
            .inner
            .enabled
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let next = match explicit {
            Some(EnabledConfig::List(ids)) => EnabledSet::from_ids(ids),
            Some(EnabledConfig::Map(toggles)) => {
                let mut set = enabled
                    .clone()
                    .unwrap_or_else(|| EnabledSet::from_ids(manifest.default_enabled()));
                for (id, toggle) in toggles {
                    if toggle.enabled {
                        set.insert(&id);
                    } else {
                        set.remove(&id);
                    }
                }
                set
            }
            None if manifest_supplied || enabled.is_none() => {
                EnabledSet::from_ids(manifest.default_enabled())
            }
            None => return,
        };

        debug!(enabled = ?next.ids(), "Computed enabled set");
        *enabled = Some(next);
    }

    /// Replace the manifest.
    pub fn apply_manifest(&self, manifest: Manifest) {
        debug!(plugins = manifest.len(), "Applying manifest");
        *self
            .inner
            .manifest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(manifest));
    }

    fn read_manifest(&self) -> Option<Arc<Manifest>> {
        self.inner
            .manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The applied manifest, or an empty one if none has been applied.
    pub fn get_manifest(&self) -> Arc<Manifest> {
        self.read_manifest().unwrap_or_default()
    }

    pub(crate) fn manifest(&self) -> Arc<Manifest> {
        self.get_manifest()
    }

    /// Enabled ids in the order they were enabled.
    pub fn get_enabled(&self) -> Vec<String> {
        self.inner
            .enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(EnabledSet::ids)
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.inner
            .enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|set| set.contains(id.trim()))
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_loading(&self, id: &str) -> bool {
        self.inner
            .loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Make a capability available to every plugin's [`HostContext`].
    pub fn extend_host<T: Any + Send + Sync>(&self, capability: T) {
        self.inner.extensions.insert(capability);
    }

    pub(crate) fn host_context(&self, plugin_id: &str) -> HostContext {
        HostContext::new(
            plugin_id.to_string(),
            self.inner.events.clone(),
            self.inner.settings.clone(),
            self.inner.extensions.clone(),
        )
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.on(event, handler)
    }

    pub fn off(&self, event: &str, id: SubscriptionId) {
        self.inner.events.off(event, id)
    }

    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        self.inner.events.emit(event, payload)
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn get_settings(&self, id: &str) -> Option<Value> {
        self.inner.settings.get_settings(id)
    }

    pub fn set_settings(&self, id: &str, settings: Value) -> bool {
        self.inner.settings.set_settings(id, settings)
    }

    pub fn update_settings(&self, id: &str, patch: Map<String, Value>) -> bool {
        self.inner.settings.update_settings(id, patch)
    }

    pub fn clear_settings(&self, id: &str) -> bool {
        self.inner.settings.clear_settings(id)
    }

    /// Transitive dependencies of `id` under the current manifest.
    pub fn get_dependencies(&self, id: &str) -> Vec<String> {
        get_dependencies(&self.manifest(), id)
    }

    /// Direct dependents of `id` under the current manifest.
    pub fn get_dependents(&self, id: &str) -> Vec<String> {
        get_dependents(&self.manifest(), id)
    }

    pub fn set_dev_mode(&self, enabled: bool) {
        let previous = self.inner.dev_mode.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(dev_mode = enabled, "Dev mode changed");
        }
    }

    pub fn is_dev_mode(&self) -> bool {
        self.inner.dev_mode.load(Ordering::Acquire)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.registration_timeout_ms.load(Ordering::Acquire))
    }

    /// Wait for `id` to register, by default for the runtime's registration
    /// timeout.
    pub fn wait_for_registration(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = RuntimeResult<Arc<PluginHandle>>> + Send + 'static {
        let timeout = timeout.unwrap_or_else(|| self.registration_timeout());
        self.inner.registry.wait_for_registration(id, timeout)
    }

    pub fn get_plugin(&self, id: &str) -> Option<Arc<PluginHandle>> {
        self.inner.registry.get(id)
    }

    /// Registered ids, sorted.
    pub fn list_plugins(&self) -> Vec<String> {
        self.inner.registry.list()
    }

    /// Destroy initialized plugins, dependents before their dependencies, and
    /// write out pending settings.
    ///
    /// The manifest, enabled set and registry are kept, so a later `start`
    /// re-activates the same plugins.
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        let _starts = self.inner.start_gate.lock().await;
        self.inner.started.store(false, Ordering::Release);

        let mut order = load_order(&self.manifest(), &self.list_plugins());
        order.reverse();
        for id in order {
            match self.inner.registry.get(&id) {
                Some(handle) if handle.is_inited() => self.destroy_contained(&handle).await,
                _ => {}
            }
        }

        info!("Plugin runtime shut down");
        self.inner.settings.flush().await
    }
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("started", &self.is_started())
            .field("dev_mode", &self.is_dev_mode())
            .field("enabled", &self.get_enabled())
            .field("registry", &self.inner.registry)
            .finish()
    }
}
