//! The loader capability: makes a plugin's code available so it can register.
//!
//! The runtime only knows entries as opaque locators. A loader turns a locator
//! into a running plugin by calling [`Registrar::register`]; the runtime then
//! picks the registration up through its registration wait.

use crate::plugin::Plugin;
use crate::runtime::{PluginRuntime, RuntimeInner};
use async_trait::async_trait;
use folio_plugin_core::{RuntimeError, RuntimeResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, warn};

/// Options for a single load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Bypass any "already loaded" marker and load fresh code.
    pub force_reload: bool,
}

/// Handle through which loaded code registers its plugin.
#[derive(Clone)]
pub struct Registrar {
    runtime: Weak<RuntimeInner>,
}

impl Registrar {
    pub(crate) fn new(runtime: Weak<RuntimeInner>) -> Self {
        Self { runtime }
    }

    /// Register a plugin with the runtime that issued this registrar.
    ///
    /// Returns false if the registration was ignored or the runtime is gone.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> bool {
        match self.runtime.upgrade() {
            Some(inner) => PluginRuntime::from_inner(inner).register(plugin),
            None => {
                warn!(plugin = %plugin.id(), "Runtime dropped before plugin could register");
                false
            }
        }
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("alive", &(self.runtime.strong_count() > 0))
            .finish()
    }
}

/// One load request.
#[derive(Debug)]
pub struct LoadRequest<'a> {
    pub entry: &'a str,
    pub options: LoadOptions,
    pub registrar: Registrar,
}

/// Makes plugin code executable.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Load the code behind `request.entry`. Success means the code ran; the
    /// plugin may register during or after this call.
    async fn load(&self, request: LoadRequest<'_>) -> RuntimeResult<()>;

    /// Forget that `entry` was loaded so the next load runs fresh code.
    fn evict(&self, entry: &str) {
        let _ = entry;
    }
}

/// Loader for hosts that only register plugins directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLoader;

#[async_trait]
impl Loader for NoopLoader {
    async fn load(&self, request: LoadRequest<'_>) -> RuntimeResult<()> {
        Err(RuntimeError::LoadFailed {
            entry: request.entry.to_string(),
            message: "no loader configured".to_string(),
        })
    }
}

/// Builds a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Loader for plugins compiled into the host, keyed by entry locator.
///
/// A non-forced load of an entry that is already loaded does nothing; a
/// forced load calls the factory again and registers the new instance.
#[derive(Default)]
pub struct StaticLoader {
    factories: RwLock<HashMap<String, PluginFactory>>,
    loaded: Mutex<HashSet<String>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`StaticLoader::add`].
    pub fn with_plugin<F>(self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.add(entry, factory);
        self
    }

    /// Make `entry` loadable, replacing any previous factory.
    pub fn add<F>(&self, entry: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        let entry = entry.into().trim().to_string();
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry, Arc::new(factory));
    }

    pub fn is_loaded(&self, entry: &str) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(entry.trim())
    }

    /// Entries with a factory, sorted.
    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        entries.sort();
        entries
    }
}

impl std::fmt::Debug for StaticLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticLoader")
            .field("entries", &self.entries())
            .finish()
    }
}

#[async_trait]
impl Loader for StaticLoader {
    async fn load(&self, request: LoadRequest<'_>) -> RuntimeResult<()> {
        let entry = request.entry.trim();

        if !request.options.force_reload && self.is_loaded(entry) {
            debug!(entry = %entry, "Entry already loaded");
            return Ok(());
        }

        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry)
            .cloned()
            .ok_or_else(|| RuntimeError::LoadFailed {
                entry: entry.to_string(),
                message: "no plugin is bundled under this entry".to_string(),
            })?;

        let plugin = factory();
        debug!(entry = %entry, plugin = %plugin.id(), "Loaded bundled plugin");
        request.registrar.register(plugin);

        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.to_string());
        Ok(())
    }

    fn evict(&self, entry: &str) {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entry.trim());
    }
}
