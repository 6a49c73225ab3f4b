//! Configuration file loading and management
//!
//! This module handles loading and parsing the runtime configuration from
//! `$XDG_CONFIG_HOME/folio/plugins.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.
//!
//! It also defines [`StartConfig`], the per-call input to
//! [`PluginRuntime::start`](crate::PluginRuntime::start).

use anyhow::{Context, Result};
use folio_plugin_core::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Runtime behaviour
    #[serde(default)]
    pub runtime: RuntimeSection,
    /// Settings persistence
    #[serde(default)]
    pub settings: SettingsSection,
    /// Plugin manifest location
    #[serde(default)]
    pub manifest: ManifestSection,
    /// Per-plugin enable overrides
    #[serde(default)]
    pub plugins: HashMap<String, PluginToggle>,
}

/// Runtime behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSection {
    /// Allow hot reload
    /// Default: false
    pub dev_mode: bool,
    /// How long to wait for a loaded plugin to register, in milliseconds
    /// Default: 8000
    pub registration_timeout_ms: u64,
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
}

/// Settings persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettingsSection {
    /// Path to the settings file
    /// If None, uses XDG_DATA_HOME/folio/settings.json
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Delay before a burst of settings changes is written, in milliseconds
    /// Default: 50
    pub debounce_ms: u64,
}

/// Manifest configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ManifestSection {
    /// Path to a TOML or JSON plugin manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Per-plugin enable override
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginToggle {
    /// Whether this plugin is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            dev_mode: false,
            registration_timeout_ms: 8000,
            log_level: "info".to_string(),
        }
    }
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            path: None,
            debounce_ms: 50,
        }
    }
}

impl Default for PluginToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "folio", "folio")
        .context("Failed to determine project directories")
}

impl RuntimeConfig {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RuntimeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/folio/plugins.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("plugins.toml"))
    }

    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    fn default_config_content() -> String {
        r#"# Folio Plugin Runtime Configuration
# This file configures how the editor loads and coordinates plugins.

[runtime]
# Allow hot reloading plugins without restarting the editor
# Default: false
dev_mode = false

# How long to wait for a loaded plugin to register, in milliseconds
# Default: 8000
registration_timeout_ms = 8000

# Log level: trace, debug, info, warn, error
# Default: "info"
log_level = "info"

[settings]
# Path to the plugin settings file
# If not specified, defaults to $XDG_DATA_HOME/folio/settings.json
# path = "/path/to/settings.json"

# Delay before a burst of settings changes is written, in milliseconds
# Default: 50
debounce_ms = 50

[manifest]
# Path to the plugin manifest (TOML or JSON)
# path = "/path/to/plugins.json"

# Per-plugin overrides of the manifest's enabled_by_default flag.
# Dependencies of an enabled plugin are enabled automatically.

# Example: turn off the presenter plugin
# [plugins.presenter]
# enabled = false
"#
        .to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.runtime.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.runtime.log_level,
                valid_log_levels.join(", ")
            );
        }

        if self.runtime.registration_timeout_ms == 0 {
            anyhow::bail!("runtime.registration_timeout_ms must be greater than 0");
        }

        for plugin_id in self.plugins.keys() {
            if plugin_id.trim().is_empty() {
                anyhow::bail!("Plugin overrides must have a non-empty id");
            }
        }

        Ok(())
    }

    /// Get the settings file path
    ///
    /// Returns the configured path or the default XDG data directory path
    pub fn settings_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.settings.path {
            return Ok(path.clone());
        }

        Ok(project_dirs()?.data_dir().join("settings.json"))
    }

    /// Load the configured manifest, if any.
    pub fn load_manifest(&self) -> Result<Option<Manifest>> {
        let Some(ref path) = self.manifest.path else {
            return Ok(None);
        };
        let manifest = Manifest::from_file(path)
            .with_context(|| format!("Failed to load manifest: {}", path.display()))?;
        Ok(Some(manifest))
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime.registration_timeout_ms)
    }

    pub fn settings_debounce(&self) -> Duration {
        Duration::from_millis(self.settings.debounce_ms)
    }

    /// A [`StartConfig`] carrying this file's plugin overrides.
    pub fn start_config(&self) -> StartConfig {
        let enabled = if self.plugins.is_empty() {
            None
        } else {
            Some(EnabledConfig::Map(
                self.plugins
                    .iter()
                    .map(|(id, toggle)| (id.trim().to_string(), *toggle))
                    .collect(),
            ))
        };

        StartConfig {
            manifest: None,
            enabled,
            dev_mode: Some(self.runtime.dev_mode),
            registration_timeout_ms: Some(self.runtime.registration_timeout_ms),
        }
    }
}

/// Explicit enabled-set configuration: either the complete list of ids, or
/// per-id overrides applied on top of the current set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnabledConfig {
    List(Vec<String>),
    Map(BTreeMap<String, PluginToggle>),
}

/// Input to [`PluginRuntime::start`](crate::PluginRuntime::start).
///
/// Every field is optional; an empty config re-activates the runtime with
/// whatever manifest and enabled set it already has.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StartConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<EnabledConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_timeout_ms: Option<u64>,
}

impl StartConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Replace the enabled set with exactly these ids.
    pub fn with_enabled<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled = Some(EnabledConfig::List(ids.into_iter().map(Into::into).collect()));
        self
    }

    /// Add a per-id override. Switches a list config to overrides.
    pub fn with_toggle(mut self, id: impl Into<String>, enabled: bool) -> Self {
        let mut toggles = match self.enabled.take() {
            Some(EnabledConfig::Map(toggles)) => toggles,
            _ => BTreeMap::new(),
        };
        toggles.insert(id.into(), PluginToggle { enabled });
        self.enabled = Some(EnabledConfig::Map(toggles));
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = Some(dev_mode);
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}
