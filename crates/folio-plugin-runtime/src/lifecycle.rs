//! Enabling, disabling and initializing plugins.
//!
//! Plugin hooks run in their own spawned task so that both `Err` returns and
//! panics come back as a value. A failed hook is logged and announced on
//! `plugin:error`; it never reaches the caller of `start`, `enable_plugin` or
//! `disable_plugin`, and never stops sibling plugins from initializing.

use crate::loader::{LoadOptions, LoadRequest, Registrar};
use crate::plugin::PluginHandle;
use crate::runtime::{PluginRuntime, RuntimeInner};
use folio_plugin_core::event_bus::panic_message;
use folio_plugin_core::{
    events, load_order, LifecyclePhase, Manifest, RuntimeError, RuntimeResult,
};
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use tracing::{debug, info, warn};

/// Insertion-ordered set of enabled plugin ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct EnabledSet {
    ids: Vec<String>,
}

impl EnabledSet {
    pub(crate) fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for id in ids {
            set.insert(id.as_ref());
        }
        set
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    /// Returns false for blank or already present ids.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() || self.contains(id) {
            return false;
        }
        self.ids.push(id.to_string());
        true
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let before = self.ids.len();
        self.ids.retain(|i| i != id.trim());
        self.ids.len() != before
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.ids.clone()
    }
}

/// Marks an id as owned by a load pass or reload for as long as it is alive.
///
/// Guards nest: the id stays marked until every guard for it is dropped.
pub(crate) struct LoadingGuard<'a> {
    inner: &'a RuntimeInner,
    id: String,
}

impl<'a> LoadingGuard<'a> {
    fn new(inner: &'a RuntimeInner, id: &str) -> Self {
        *inner
            .loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_insert(0) += 1;
        Self {
            inner,
            id: id.to_string(),
        }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut loading = self
            .inner
            .loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(owners) = loading.get_mut(&self.id) {
            *owners -= 1;
            if *owners == 0 {
                loading.remove(&self.id);
            }
        }
    }
}

/// Run a plugin hook to completion in its own task.
async fn run_contained<F>(hook: F) -> Result<(), String>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match tokio::spawn(hook).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{:#}", err)),
        Err(join_err) if join_err.is_panic() => {
            let panic = join_err.into_panic();
            Err(format!("panicked: {}", panic_message(&*panic)))
        }
        Err(join_err) => Err(join_err.to_string()),
    }
}

impl PluginRuntime {
    /// Initialize a registered plugin if it is enabled and not yet inited.
    ///
    /// The inited flag is set before `init` runs and stays set if `init`
    /// fails. Returns true when `init` ran and succeeded.
    pub(crate) async fn init_plugin_if_enabled(&self, handle: Arc<PluginHandle>) -> bool {
        let id = handle.id().to_string();
        if id.is_empty() || !self.is_enabled(&id) {
            return false;
        }
        if !handle.mark_inited() {
            debug!(plugin = %id, "Plugin already initialized");
            return false;
        }

        let ctx = self.host_context(&id);
        let plugin = Arc::clone(handle.plugin());
        match run_contained(async move { plugin.init(ctx).await }).await {
            Ok(()) => {
                info!(plugin = %id, "Initialized plugin");
                true
            }
            Err(message) => {
                self.report_failure(&id, LifecyclePhase::Init, message);
                false
            }
        }
    }

    /// Clear the inited flag and run `destroy`, containing any failure.
    pub(crate) async fn destroy_contained(&self, handle: &PluginHandle) {
        if !handle.reset_inited() {
            debug!(plugin = %handle.id(), "Destroying plugin that was never initialized");
        }

        let plugin = Arc::clone(handle.plugin());
        match run_contained(async move { plugin.destroy().await }).await {
            Ok(()) => debug!(plugin = %handle.id(), "Destroyed plugin"),
            Err(message) => self.report_failure(handle.id(), LifecyclePhase::Destroy, message),
        }
    }

    fn report_failure(&self, id: &str, phase: LifecyclePhase, message: String) {
        let payload = json!({ "id": id, "phase": phase.as_str(), "error": &message });
        let err = RuntimeError::Lifecycle {
            id: id.to_string(),
            phase,
            message,
        };
        warn!(plugin = %id, phase = %phase, "{}", err);
        self.inner.events.emit(events::PLUGIN_ERROR, &payload);
    }

    /// Add every missing dependency of `id` to the enabled set, dependencies
    /// first. Returns the ids that were added.
    pub(crate) fn ensure_dependencies_enabled(&self, id: &str) -> Vec<String> {
        let dependencies = self.get_dependencies(id);
        if dependencies.is_empty() {
            return Vec::new();
        }

        let mut enabled = self
            .inner
            .enabled
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let set = enabled.get_or_insert_with(Default::default);

        let mut added = Vec::new();
        for dependency in dependencies {
            if set.insert(&dependency) {
                info!(plugin = %id, dependency = %dependency, "Auto-enabled dependency");
                added.push(dependency);
            }
        }
        added
    }

    /// Enable a plugin and, transitively, its dependencies.
    ///
    /// Returns false only for a blank id. Once the runtime has started, the
    /// newly enabled plugins are loaded and initialized before this returns
    /// and `plugin:enabled` is emitted.
    pub async fn enable_plugin(&self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() {
            return false;
        }
        if self.is_enabled(id) {
            debug!(plugin = %id, "Plugin already enabled");
            return true;
        }

        let dependencies = self.ensure_dependencies_enabled(id);
        self.inner
            .enabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Default::default)
            .insert(id);
        info!(plugin = %id, "Enabled plugin");

        if self.is_started() {
            self.run_load_pass(Some(&[id.to_string()])).await;
            self.inner.events.emit(
                events::PLUGIN_ENABLED,
                &json!({ "id": id, "dependencies": dependencies }),
            );
        }
        true
    }

    /// Disable a plugin.
    ///
    /// Refused (false, nothing changes) while any enabled plugin depends on
    /// it. Otherwise the plugin is removed from the enabled set, `destroy`
    /// runs on the registered instance (inited or not), and `plugin:disabled`
    /// is emitted.
    pub async fn disable_plugin(&self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() {
            return false;
        }

        let blocked_by = {
            let mut enabled = self
                .inner
                .enabled
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match enabled.as_mut() {
                Some(set) if set.contains(id) => {
                    let dependents: Vec<String> = self
                        .get_dependents(id)
                        .into_iter()
                        .filter(|dependent| set.contains(dependent))
                        .collect();
                    if dependents.is_empty() {
                        set.remove(id);
                    }
                    dependents
                }
                _ => {
                    debug!(plugin = %id, "Plugin already disabled");
                    return true;
                }
            }
        };

        if !blocked_by.is_empty() {
            let err = RuntimeError::DependentBlock {
                id: id.to_string(),
                dependents: blocked_by,
            };
            warn!(plugin = %id, "Refusing to disable: {}", err);
            return false;
        }

        info!(plugin = %id, "Disabled plugin");
        if let Some(handle) = self.inner.registry.get(id) {
            self.destroy_contained(&handle).await;
        }
        self.inner
            .events
            .emit(events::PLUGIN_DISABLED, &json!({ "id": id }));
        true
    }

    /// Load and initialize `roots` (every enabled id when `None`) together
    /// with their dependencies, dependencies first.
    ///
    /// Failures to load one plugin are logged and the pass moves on.
    pub(crate) async fn run_load_pass(&self, roots: Option<&[String]>) {
        let roots = match roots {
            Some(roots) => roots.to_vec(),
            None => self.get_enabled(),
        };
        for root in &roots {
            self.ensure_dependencies_enabled(root);
        }

        let manifest = self.manifest();
        let order = load_order(&manifest, &roots);
        debug!(order = ?order, "Running load pass");

        // Every id in the pass is claimed up front so that a plugin which
        // registers early cannot init ahead of its dependencies. Each claim is
        // released once the pass has handled that id.
        let claims: Vec<LoadingGuard<'_>> = order.iter().map(|id| self.mark_loading(id)).collect();
        for (id, claim) in order.into_iter().zip(claims) {
            if self.is_enabled(&id) {
                self.activate(&id, &manifest).await;
            }
            drop(claim);
        }
    }

    /// Keep registrations of `id` from triggering their own init until the
    /// returned guard is dropped.
    pub(crate) fn mark_loading(&self, id: &str) -> LoadingGuard<'_> {
        LoadingGuard::new(&self.inner, id)
    }

    async fn activate(&self, id: &str, manifest: &Manifest) {
        let handle = match self.inner.registry.get(id) {
            Some(handle) => handle,
            None => match self.load_from_manifest(id, manifest, LoadOptions::default()).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(plugin = %id, "Skipping plugin: {}", err);
                    return;
                }
            },
        };

        self.init_plugin_if_enabled(handle).await;
    }

    pub(crate) async fn load_from_manifest(
        &self,
        id: &str,
        manifest: &Manifest,
        options: LoadOptions,
    ) -> RuntimeResult<Arc<PluginHandle>> {
        let descriptor = manifest
            .get(id)
            .ok_or_else(|| RuntimeError::UnknownPlugin(id.to_string()))?;
        if !descriptor.has_entry() {
            return Err(RuntimeError::MissingEntry(id.to_string()));
        }
        self.load_and_await(id, descriptor.entry.trim(), options)
            .await
    }

    /// Invoke the loader for `entry` and wait for `id` to register, whichever
    /// settles first.
    pub(crate) async fn load_and_await(
        &self,
        id: &str,
        entry: &str,
        options: LoadOptions,
    ) -> RuntimeResult<Arc<PluginHandle>> {
        let wait = self
            .inner
            .registry
            .wait_for_registration(id, self.registration_timeout());
        tokio::pin!(wait);

        let request = LoadRequest {
            entry,
            options,
            registrar: Registrar::new(Arc::downgrade(&self.inner)),
        };
        debug!(plugin = %id, entry = %entry, force_reload = options.force_reload, "Loading plugin");

        tokio::select! {
            biased;
            registered = &mut wait => registered,
            loaded = self.inner.loader.load(request) => match loaded {
                Ok(()) => wait.await,
                Err(err) => {
                    self.inner.registry.cancel_wait(id);
                    Err(err)
                }
            },
        }
    }
}
