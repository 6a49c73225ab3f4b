//! # folio-plugin-runtime
//!
//! Host-embeddable runtime that loads, enables and coordinates editor
//! plugins.
//!
//! The runtime owns the registry, the enabled set, the event bus and the
//! settings store, and drives every plugin through its lifecycle:
//!
//! - Plugins register through [`PluginRuntime::register`] or, when loaded
//!   through a [`Loader`], through the [`Registrar`] handed to it
//! - [`PluginRuntime::start`] loads and initializes enabled plugins in
//!   dependency order
//! - [`PluginRuntime::enable_plugin`] / [`PluginRuntime::disable_plugin`]
//!   change the enabled set incrementally
//! - In dev mode, [`PluginRuntime::reload_plugin`] hot reloads plugin code
//!
//! ## Example
//!
//! ```no_run
//! use folio_plugin_runtime::{FnPlugin, PluginRuntime, StartConfig};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let runtime = PluginRuntime::new();
//! runtime.register(Arc::new(FnPlugin::new("word-count")));
//! runtime.start(StartConfig::new().with_enabled(["word-count"])).await;
//! # }
//! ```

pub mod config;
pub mod host;
mod lifecycle;
pub mod loader;
pub mod plugin;
pub mod registry;
pub mod reload;
pub mod runtime;

pub use config::{EnabledConfig, PluginToggle, RuntimeConfig, StartConfig};
pub use host::{HostContext, HostExtensions, LogLevel};
pub use loader::{
    LoadOptions, LoadRequest, Loader, NoopLoader, PluginFactory, Registrar, StaticLoader,
};
pub use plugin::{FnPlugin, Plugin, PluginHandle};
pub use registry::{PluginRegistry, RegisterOutcome, DEFAULT_REGISTRATION_TIMEOUT};
pub use reload::{ReloadAllOutcome, ReloadOutcome};
pub use runtime::{PluginRuntime, PluginRuntimeBuilder};

pub use folio_plugin_core::{
    events, EventBus, FileSettingsBackend, LifecyclePhase, Manifest, MemorySettingsBackend,
    PluginDescriptor, RuntimeError, RuntimeResult, SettingsBackend, SettingsStore, Subscription,
    SubscriptionId,
};
