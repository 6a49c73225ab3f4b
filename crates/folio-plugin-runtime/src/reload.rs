//! Hot reload of plugin code while the editor keeps running.
//!
//! Only available in dev mode. A reload tears the current instance down,
//! makes the loader forget the entry, loads it again and waits for the fresh
//! instance to register.

use crate::loader::LoadOptions;
use crate::runtime::PluginRuntime;
use folio_plugin_core::{events, RuntimeError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Result of reloading one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReloadOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
        }
    }
}

/// Result of reloading every enabled plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadAllOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub results: BTreeMap<String, ReloadOutcome>,
}

impl PluginRuntime {
    /// Hot reload one plugin.
    ///
    /// Never fails with an error; problems are reported in the outcome. With
    /// dev mode off nothing is touched.
    pub async fn reload_plugin(&self, id: &str) -> ReloadOutcome {
        if !self.is_dev_mode() {
            let err = RuntimeError::DevModeRequired;
            warn!(plugin = %id, "Reload refused: {}", err);
            return ReloadOutcome::failed(err);
        }

        let id = id.trim();
        let manifest = self.manifest();
        let entry = match manifest.get(id) {
            None => return ReloadOutcome::failed(RuntimeError::UnknownPlugin(id.to_string())),
            Some(descriptor) if !descriptor.has_entry() => {
                return ReloadOutcome::failed(RuntimeError::MissingEntry(id.to_string()))
            }
            Some(descriptor) => descriptor.entry.trim().to_string(),
        };

        info!(plugin = %id, entry = %entry, "Reloading plugin");
        self.inner
            .events
            .emit(events::PLUGIN_RELOADING, &json!({ "id": id }));

        let _loading = self.mark_loading(id);

        if let Some(handle) = self.inner.registry.get(id) {
            self.destroy_contained(&handle).await;
        }
        self.inner.loader.evict(&entry);
        self.inner.registry.evict(id);

        let options = LoadOptions { force_reload: true };
        let handle = match self.load_and_await(id, &entry, options).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(plugin = %id, "Reload failed: {}", err);
                return ReloadOutcome::failed(err);
            }
        };

        if self.is_enabled(id) {
            self.init_plugin_if_enabled(handle).await;
        }

        info!(plugin = %id, "Reloaded plugin");
        self.inner
            .events
            .emit(events::PLUGIN_RELOADED, &json!({ "id": id }));
        ReloadOutcome::ok()
    }

    /// Hot reload every enabled plugin, one after another.
    pub async fn reload_all_plugins(&self) -> ReloadAllOutcome {
        if !self.is_dev_mode() {
            let err = RuntimeError::DevModeRequired;
            warn!("Reload refused: {}", err);
            return ReloadAllOutcome {
                success: false,
                error: Some(err.to_string()),
                results: BTreeMap::new(),
            };
        }

        let mut results = BTreeMap::new();
        for id in self.get_enabled() {
            let outcome = self.reload_plugin(&id).await;
            results.insert(id, outcome);
        }

        ReloadAllOutcome {
            success: true,
            error: None,
            results,
        }
    }
}
