//! The contract plugin code implements, and the runtime's handle around it.

use crate::host::HostContext;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A feature module registered with the runtime.
///
/// Only `id` is required. `init` and `destroy` default to no-ops, so a plugin
/// that does not override them simply has nothing to run at those points.
/// Errors (and panics) from either hook are contained by the runtime.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Unique identifier; surrounding whitespace is ignored.
    fn id(&self) -> &str;

    /// Called once the plugin is registered, enabled and the runtime has
    /// started.
    async fn init(&self, ctx: HostContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called when the plugin is disabled or about to be hot reloaded.
    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type InitHook = Arc<dyn Fn(HostContext) -> HookFuture + Send + Sync>;
type DestroyHook = Arc<dyn Fn() -> HookFuture + Send + Sync>;

/// A plugin assembled from closures.
///
/// ```no_run
/// use folio_plugin_runtime::FnPlugin;
///
/// let plugin = FnPlugin::new("word-count").on_init(|ctx| async move {
///     ctx.emit("word-count:ready", &serde_json::json!({}));
///     Ok(())
/// });
/// ```
#[derive(Clone)]
pub struct FnPlugin {
    id: String,
    init: Option<InitHook>,
    destroy: Option<DestroyHook>,
}

impl FnPlugin {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            init: None,
            destroy: None,
        }
    }

    pub fn on_init<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HostContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn on_destroy<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.destroy = Some(Arc::new(move || Box::pin(hook())));
        self
    }
}

impl std::fmt::Debug for FnPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnPlugin")
            .field("id", &self.id)
            .field("has_init", &self.init.is_some())
            .field("has_destroy", &self.destroy.is_some())
            .finish()
    }
}

#[async_trait]
impl Plugin for FnPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    async fn init(&self, ctx: HostContext) -> anyhow::Result<()> {
        match &self.init {
            Some(hook) => hook(ctx).await,
            None => Ok(()),
        }
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        match &self.destroy {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }
}

/// A registered plugin as tracked by the registry.
pub struct PluginHandle {
    id: String,
    plugin: Arc<dyn Plugin>,
    inited: AtomicBool,
}

impl PluginHandle {
    pub(crate) fn new(id: String, plugin: Arc<dyn Plugin>) -> Self {
        Self {
            id,
            plugin,
            inited: AtomicBool::new(false),
        }
    }

    /// The trimmed id the plugin was registered under.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn is_inited(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    /// Flip the flag to inited. Returns false if it already was.
    pub(crate) fn mark_inited(&self) -> bool {
        self.inited
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the flag. Returns whether it was set.
    pub(crate) fn reset_inited(&self) -> bool {
        self.inited.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id)
            .field("inited", &self.is_inited())
            .finish()
    }
}
