//! # folio-plugin-core
//!
//! Building blocks of the Folio plugin runtime that do not depend on plugin
//! code being loaded:
//!
//! - Plugin manifests and descriptors
//! - Dependency resolution (transitive closures, dependents, load order)
//! - A synchronous event bus
//! - A per-plugin settings store with pluggable persistence
//!
//! The runtime itself (registry, lifecycle, hot reload) lives in
//! `folio-plugin-runtime` and composes these pieces.

pub mod error;
pub mod event_bus;
pub mod manifest;
pub mod resolver;
pub mod settings;

pub use error::{LifecyclePhase, RuntimeError, RuntimeResult};
pub use event_bus::{events, EventBus, Handler, Subscription, SubscriptionId};
pub use manifest::{Manifest, PluginDescriptor};
pub use resolver::{get_dependencies, get_dependents, load_order};
pub use settings::{
    FileSettingsBackend, MemorySettingsBackend, SettingsBackend, SettingsStore, DEFAULT_DEBOUNCE,
};
