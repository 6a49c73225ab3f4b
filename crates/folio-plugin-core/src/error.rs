//! Error types for the plugin runtime.

use thiserror::Error;

/// Errors that can occur while loading and coordinating plugins.
///
/// Most of these never escape a public runtime operation: they are logged at
/// the call site and surfaced as a boolean or a structured outcome instead.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A plugin tried to register without a usable id.
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    /// No `register()` call arrived within the wait window.
    #[error("Timed out after {timeout_ms}ms waiting for plugin '{id}' to register")]
    RegistrationTimeout { id: String, timeout_ms: u64 },

    /// The pending registration went away without being settled.
    #[error("Registration wait abandoned for plugin '{0}'")]
    RegistrationAbandoned(String),

    /// A plugin's `init` or `destroy` failed.
    #[error("Plugin '{id}' failed during {phase}: {message}")]
    Lifecycle {
        id: String,
        phase: LifecyclePhase,
        message: String,
    },

    /// A dependency edge closes a cycle and was dropped.
    #[error("Dependency cycle detected: {} -> {id}", path.join(" -> "))]
    DependencyCycle { id: String, path: Vec<String> },

    /// Disabling was refused because enabled plugins depend on this one.
    #[error("Plugin '{id}' is required by: {}", dependents.join(", "))]
    DependentBlock { id: String, dependents: Vec<String> },

    /// Hot reload was requested while dev mode is off.
    #[error("dev mode is disabled")]
    DevModeRequired,

    /// No manifest entry exists for the id.
    #[error("Plugin not found: {0}")]
    UnknownPlugin(String),

    /// The manifest entry has no entry locator.
    #[error("Plugin '{0}' has no entry")]
    MissingEntry(String),

    /// The loader could not make the entry executable.
    #[error("Failed to load '{entry}': {message}")]
    LoadFailed { entry: String, message: String },

    /// Failed to parse or validate a manifest.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Invalid runtime configuration.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The settings backend failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// The plugin hook a lifecycle failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Init,
    Destroy,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Init => "init",
            LifecyclePhase::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
