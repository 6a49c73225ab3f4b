//! The context handed to a plugin's `init`.
//!
//! A [`HostContext`] exposes the event bus, the plugin's own settings and
//! logging, plus any capabilities the host registered through
//! [`PluginRuntime::extend_host`](crate::PluginRuntime::extend_host).

use folio_plugin_core::{EventBus, SettingsStore, Subscription, SubscriptionId};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Log level for plugin logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Capabilities registered by the host, keyed by type.
///
/// Clones share the same map, so a capability added after a context was
/// created is still visible through it.
#[derive(Clone, Default)]
pub struct HostExtensions {
    entries: Arc<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl HostExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .cloned()?;
        entry.downcast::<T>().ok()
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HostExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostExtensions")
            .field("len", &self.len())
            .finish()
    }
}

/// What a plugin sees of the host.
#[derive(Clone)]
pub struct HostContext {
    plugin_id: String,
    events: EventBus,
    settings: SettingsStore,
    extensions: HostExtensions,
}

impl HostContext {
    pub(crate) fn new(
        plugin_id: String,
        events: EventBus,
        settings: SettingsStore,
        extensions: HostExtensions,
    ) -> Self {
        Self {
            plugin_id,
            events,
            settings,
            extensions,
        }
    }

    /// Id of the plugin this context belongs to.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.events.on(event, handler)
    }

    pub fn off(&self, event: &str, id: SubscriptionId) {
        self.events.off(event, id)
    }

    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        self.events.emit(event, payload)
    }

    /// This plugin's settings.
    pub fn get_settings(&self) -> Option<Value> {
        self.settings.get_settings(&self.plugin_id)
    }

    pub fn get_settings_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.settings.get_settings_as(&self.plugin_id)
    }

    pub fn set_settings(&self, settings: Value) -> bool {
        self.settings.set_settings(&self.plugin_id, settings)
    }

    pub fn update_settings(&self, patch: Map<String, Value>) -> bool {
        self.settings.update_settings(&self.plugin_id, patch)
    }

    /// Log a message attributed to this plugin.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(plugin = %self.plugin_id, "{}", message),
            LogLevel::Debug => tracing::debug!(plugin = %self.plugin_id, "{}", message),
            LogLevel::Info => tracing::info!(plugin = %self.plugin_id, "{}", message),
            LogLevel::Warn => tracing::warn!(plugin = %self.plugin_id, "{}", message),
            LogLevel::Error => tracing::error!(plugin = %self.plugin_id, "{}", message),
        }
    }

    /// A capability registered by the host.
    pub fn capability<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions.get::<T>()
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("plugin_id", &self.plugin_id)
            .field("extensions", &self.extensions)
            .finish()
    }
}
