//! Plugin manifest parsing.
//!
//! The manifest is the ordered list of plugins the host knows about. It can be
//! written as TOML:
//!
//! ```toml
//! [[plugins]]
//! id = "markdown"
//! entry = "builtin:markdown"
//!
//! [[plugins]]
//! id = "citations"
//! entry = "builtin:citations"
//! dependencies = ["markdown"]
//! enabled_by_default = false
//! ```
//!
//! or as JSON, either a bare array of descriptors or `{ "plugins": [...] }`.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

/// A manifest entry describing a loadable plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique identifier for the plugin.
    pub id: String,

    /// Opaque resource locator handed to the loader.
    #[serde(default)]
    pub entry: String,

    /// Whether the plugin is enabled when the host gives no explicit list.
    #[serde(default = "default_enabled", alias = "enabledByDefault")]
    pub enabled_by_default: bool,

    /// Ids this plugin needs, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Hint that the plugin may be loaded on demand.
    #[serde(default)]
    pub lazy: bool,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Plugin description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl PluginDescriptor {
    /// Create a descriptor with no dependencies, enabled by default.
    pub fn new(id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entry: entry.into(),
            enabled_by_default: true,
            dependencies: Vec::new(),
            lazy: false,
            name: None,
            version: None,
            description: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Check that the entry locator is usable.
    pub fn has_entry(&self) -> bool {
        !self.entry.trim().is_empty()
    }
}

/// Ordered collection of plugin descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    plugins: Vec<PluginDescriptor>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawManifest {
    List(Vec<PluginDescriptor>),
    Table {
        #[serde(default)]
        plugins: Vec<PluginDescriptor>,
    },
}

impl RawManifest {
    fn into_descriptors(self) -> Vec<PluginDescriptor> {
        match self {
            RawManifest::List(plugins) | RawManifest::Table { plugins } => plugins,
        }
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        RawManifest::deserialize(deserializer).map(|raw| Manifest::new(raw.into_descriptors()))
    }
}

impl Manifest {
    /// Build a manifest, normalising ids and dropping unusable entries.
    ///
    /// Ids and dependency ids are trimmed. Entries with an empty id are
    /// skipped, and the first descriptor wins when an id repeats.
    pub fn new(descriptors: Vec<PluginDescriptor>) -> Self {
        let mut seen = HashSet::new();
        let mut plugins = Vec::with_capacity(descriptors.len());

        for mut descriptor in descriptors {
            let id = descriptor.id.trim().to_string();
            if id.is_empty() {
                warn!("Skipping manifest entry with empty id");
                continue;
            }
            if !seen.insert(id.clone()) {
                warn!(plugin = %id, "Duplicate manifest entry ignored");
                continue;
            }

            descriptor.id = id;
            descriptor.dependencies = descriptor
                .dependencies
                .iter()
                .map(|dep| dep.trim())
                .filter(|dep| !dep.is_empty())
                .map(str::to_string)
                .collect();
            plugins.push(descriptor);
        }

        Self { plugins }
    }

    /// Load a manifest from a file. `.json` files are parsed as JSON, anything
    /// else as TOML.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Parse a manifest from a TOML string.
    pub fn from_toml_str(content: &str) -> RuntimeResult<Self> {
        let raw: RawManifest = toml::from_str(content)?;
        Ok(Self::new(raw.into_descriptors()))
    }

    /// Parse a manifest from a JSON string.
    pub fn from_json_str(content: &str) -> RuntimeResult<Self> {
        let raw: RawManifest = serde_json::from_str(content)
            .map_err(|e| RuntimeError::InvalidManifest(e.to_string()))?;
        Ok(Self::new(raw.into_descriptors()))
    }

    /// Look up a descriptor by id.
    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        let id = id.trim();
        self.plugins.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All ids in manifest order.
    pub fn ids(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.id.clone()).collect()
    }

    /// Ids that should be enabled when the host gives no explicit list.
    pub fn default_enabled(&self) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|p| p.enabled_by_default)
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl FromIterator<PluginDescriptor> for Manifest {
    fn from_iter<T: IntoIterator<Item = PluginDescriptor>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
