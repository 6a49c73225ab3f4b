//! Per-plugin settings with durable persistence.
//!
//! Settings are kept in memory as a map from plugin id to an arbitrary JSON
//! value and persisted as one serialized JSON object through a
//! [`SettingsBackend`]. Writes are debounced: a burst of mutations results in
//! a single write once the debounce window has passed.

use crate::error::{RuntimeError, RuntimeResult};
use crate::event_bus::{events, EventBus};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Default debounce window for persisting settings.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Storage for the serialized settings blob.
#[async_trait]
pub trait SettingsBackend: Send + Sync {
    /// Read the stored blob, `None` if nothing has been stored yet.
    async fn read(&self) -> RuntimeResult<Option<String>>;

    /// Replace the stored blob.
    async fn write(&self, blob: &str) -> RuntimeResult<()>;
}

/// In-process backend, mostly useful for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemorySettingsBackend {
    blob: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemorySettingsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing blob.
    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
            writes: AtomicUsize::new(0),
        }
    }

    /// The last blob written.
    pub fn blob(&self) -> Option<String> {
        self.blob
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of writes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SettingsBackend for MemorySettingsBackend {
    async fn read(&self) -> RuntimeResult<Option<String>> {
        Ok(self.blob())
    }

    async fn write(&self, blob: &str) -> RuntimeResult<()> {
        *self.blob.lock().unwrap_or_else(PoisonError::into_inner) = Some(blob.to_string());
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Backend storing the blob in a single JSON file.
#[derive(Debug, Clone)]
pub struct FileSettingsBackend {
    path: PathBuf,
}

impl FileSettingsBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsBackend for FileSettingsBackend {
    async fn read(&self) -> RuntimeResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, blob: &str) -> RuntimeResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write beside the target and rename so readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

struct StoreInner {
    entries: RwLock<BTreeMap<String, Value>>,
    backend: Arc<dyn SettingsBackend>,
    events: EventBus,
    debounce: Duration,
    loaded: OnceCell<()>,
    flush_scheduled: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
}

/// Settings for every plugin, keyed by plugin id.
///
/// Clones share the same store.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<StoreInner>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn SettingsBackend>, events: EventBus, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: RwLock::new(BTreeMap::new()),
                backend,
                events,
                debounce,
                loaded: OnceCell::new(),
                flush_scheduled: AtomicBool::new(false),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// In-memory store with default debounce.
    pub fn in_memory(events: EventBus) -> Self {
        Self::new(Arc::new(MemorySettingsBackend::new()), events, DEFAULT_DEBOUNCE)
    }

    /// Read persisted settings. Only the first call touches the backend.
    ///
    /// Read or parse failures are logged and leave the store empty. Entries
    /// written before the load finished take precedence over persisted ones.
    pub async fn load(&self) {
        self.inner
            .loaded
            .get_or_init(|| async {
                match self.read_persisted().await {
                    Ok(persisted) => {
                        let count = persisted.len();
                        let mut entries = self.write_entries();
                        for (id, value) in persisted {
                            entries.entry(id).or_insert(value);
                        }
                        info!("Loaded settings for {} plugin(s)", count);
                    }
                    Err(e) => {
                        warn!("Failed to load plugin settings, starting empty: {}", e);
                    }
                }
            })
            .await;
    }

    async fn read_persisted(&self) -> RuntimeResult<BTreeMap<String, Value>> {
        let Some(blob) = self.inner.backend.read().await? else {
            return Ok(BTreeMap::new());
        };
        if blob.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        match serde_json::from_str::<Value>(&blob)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(RuntimeError::Persistence(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.initialized()
    }

    /// Settings stored for `id`, or `None` for unknown or blank ids.
    pub fn get_settings(&self, id: &str) -> Option<Value> {
        let id = id.trim();
        if id.is_empty() {
            return None;
        }
        self.read_entries().get(id).cloned()
    }

    /// Settings for `id` deserialized into `T`.
    pub fn get_settings_as<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        let value = self.get_settings(id)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(plugin = %id.trim(), "Stored settings do not match the requested shape: {}", e);
                None
            }
        }
    }

    /// Replace the settings for `id`. Returns false for a blank id.
    pub fn set_settings(&self, id: &str, settings: Value) -> bool {
        let id = id.trim();
        if id.is_empty() {
            warn!("Refusing to store settings for a blank plugin id");
            return false;
        }

        let old = self
            .write_entries()
            .insert(id.to_string(), settings.clone());

        debug!(plugin = %id, "Settings updated");
        self.schedule_persist();
        self.inner.events.emit(
            events::SETTINGS_CHANGED,
            &json!({
                "id": id,
                "settings": settings,
                "oldSettings": old.unwrap_or(Value::Null),
            }),
        );
        true
    }

    /// Shallow-merge `patch` over the current settings for `id`.
    pub fn update_settings(&self, id: &str, patch: Map<String, Value>) -> bool {
        let id = id.trim();
        if id.is_empty() {
            warn!("Refusing to update settings for a blank plugin id");
            return false;
        }

        let mut merged = match self.get_settings(id) {
            Some(Value::Object(map)) => map,
            Some(other) => {
                warn!(plugin = %id, "Replacing non-object settings ({}) during update", json_kind(&other));
                Map::new()
            }
            None => Map::new(),
        };
        merged.extend(patch);
        self.set_settings(id, Value::Object(merged))
    }

    /// Remove the settings for `id`. Returns false for a blank id.
    pub fn clear_settings(&self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() {
            warn!("Refusing to clear settings for a blank plugin id");
            return false;
        }

        let old = self.write_entries().remove(id);

        debug!(plugin = %id, "Settings cleared");
        self.schedule_persist();
        self.inner.events.emit(
            events::SETTINGS_CLEARED,
            &json!({
                "id": id,
                "oldSettings": old.unwrap_or(Value::Null),
            }),
        );
        true
    }

    /// Ids that currently have settings, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.read_entries().keys().cloned().collect()
    }

    /// Serialize the whole store as it would be persisted.
    pub fn to_blob(&self) -> RuntimeResult<String> {
        Ok(serde_json::to_string(&*self.read_entries())?)
    }

    /// Write the current state to the backend now.
    pub async fn flush(&self) -> RuntimeResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        let blob = self.to_blob()?;
        self.inner.backend.write(&blob).await?;
        debug!("Persisted plugin settings ({} bytes)", blob.len());
        Ok(())
    }

    fn schedule_persist(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.flush_scheduled.store(false, Ordering::Release);
            debug!("No async runtime available, settings will persist on next flush");
            return;
        };

        let store = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(store.inner.debounce).await;
            store.inner.flush_scheduled.store(false, Ordering::Release);
            if let Err(e) = store.flush().await {
                warn!("Failed to persist plugin settings: {}", e);
            }
        });
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("ids", &self.ids())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
