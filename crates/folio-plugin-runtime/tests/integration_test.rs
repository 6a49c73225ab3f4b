//! Integration tests for folio-plugin-runtime.
//!
//! These tests cover:
//! - Registration and registration waits
//! - Start, load passes and dependency-ordered initialization
//! - Enabling and disabling with dependency checks
//! - Failure containment for plugin hooks and loaders
//! - Hot reload
//! - Settings persistence across runtimes

use async_trait::async_trait;
use folio_plugin_runtime::{
    events, FileSettingsBackend, FnPlugin, HostContext, LoadRequest, Loader, Manifest,
    MemorySettingsBackend, Plugin, PluginDescriptor, PluginRuntime, RuntimeError, RuntimeResult,
    StartConfig, StaticLoader,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn count(log: &Log, entry: &str) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == entry).count()
}

/// A plugin that records `init:<id>` and `destroy:<id>` into `log`.
fn tracked(id: &str, log: &Log) -> Arc<dyn Plugin> {
    let init_log = Arc::clone(log);
    let destroy_log = Arc::clone(log);
    let init_id = id.to_string();
    let destroy_id = id.to_string();

    Arc::new(
        FnPlugin::new(id)
            .on_init(move |_ctx| {
                let log = Arc::clone(&init_log);
                let id = init_id.clone();
                async move {
                    log.lock().unwrap().push(format!("init:{}", id));
                    Ok(())
                }
            })
            .on_destroy(move || {
                let log = Arc::clone(&destroy_log);
                let id = destroy_id.clone();
                async move {
                    log.lock().unwrap().push(format!("destroy:{}", id));
                    Ok(())
                }
            }),
    )
}

/// Record every payload emitted for `event`.
fn capture(runtime: &PluginRuntime, event: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = runtime.on(event, move |payload| {
        sink.lock().unwrap().push(payload.clone());
    });
    seen
}

/// Record event names, in order, for several events.
fn capture_names(runtime: &PluginRuntime, names: &[&'static str]) -> Log {
    let log = new_log();
    for name in names {
        let sink = Arc::clone(&log);
        let event = *name;
        runtime.on(event, move |_| sink.lock().unwrap().push(event.to_string()));
    }
    log
}

/// Descriptor without an entry, for plugins the test registers directly.
fn direct(id: &str, dependencies: &[&str]) -> PluginDescriptor {
    PluginDescriptor::new(id, "").with_dependencies(dependencies.iter().copied())
}

/// Plugin whose `init` panics.
struct Explosive;

#[async_trait]
impl Plugin for Explosive {
    fn id(&self) -> &str {
        "explosive"
    }

    async fn init(&self, _ctx: HostContext) -> anyhow::Result<()> {
        panic!("init blew up")
    }
}

/// Loader whose plugins register from a background task after a delay.
struct DelayedLoader {
    delay: Duration,
    log: Log,
}

#[async_trait]
impl Loader for DelayedLoader {
    async fn load(&self, request: LoadRequest<'_>) -> RuntimeResult<()> {
        let plugin = tracked(request.entry, &self.log);
        let registrar = request.registrar.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registrar.register(plugin);
        });
        Ok(())
    }
}

/// Loader that succeeds without the plugin ever registering.
struct SilentLoader;

#[async_trait]
impl Loader for SilentLoader {
    async fn load(&self, _request: LoadRequest<'_>) -> RuntimeResult<()> {
        Ok(())
    }
}

// ==============================================================================
// Registration Tests
// ==============================================================================

#[tokio::test]
async fn test_duplicate_registration_keeps_first_instance() {
    let runtime = PluginRuntime::new();
    let first_log = new_log();
    let second_log = new_log();

    assert!(runtime.register(tracked("outline", &first_log)));
    assert!(!runtime.register(tracked("outline", &second_log)));

    runtime.start(StartConfig::new().with_enabled(["outline"])).await;

    assert_eq!(entries(&first_log), vec!["init:outline"]);
    assert!(entries(&second_log).is_empty());
    assert_eq!(runtime.list_plugins(), vec!["outline"]);
}

#[tokio::test]
async fn test_wait_for_unregistered_plugin_times_out() {
    let runtime = PluginRuntime::new();
    let started = Instant::now();

    let result = runtime
        .wait_for_registration("ghost", Some(Duration::from_millis(50)))
        .await;

    let elapsed = started.elapsed();
    assert!(matches!(
        result,
        Err(RuntimeError::RegistrationTimeout { ref id, timeout_ms: 50 }) if id == "ghost"
    ));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(1000));
}

#[tokio::test]
async fn test_wait_resolves_when_plugin_registers() {
    let runtime = PluginRuntime::new();
    let wait = runtime.wait_for_registration("late", Some(Duration::from_secs(5)));

    let registering = runtime.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        registering.register(Arc::new(FnPlugin::new("late")));
    });

    let handle = wait.await.unwrap();
    assert_eq!(handle.id(), "late");
}

#[tokio::test]
async fn test_register_after_start_initializes_enabled_plugin() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.start(StartConfig::new().with_enabled(["late"])).await;
    assert!(runtime.get_plugin("late").is_none());

    assert!(runtime.register(tracked("late", &log)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(entries(&log), vec!["init:late"]);
    assert!(runtime.get_plugin("late").unwrap().is_inited());
}

#[tokio::test]
async fn test_register_after_start_skips_disabled_plugin() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.start(StartConfig::new().with_enabled(["other"])).await;

    runtime.register(tracked("dormant", &log));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(entries(&log).is_empty());
}

#[test]
fn test_wait_built_outside_async_runtime() {
    let runtime = PluginRuntime::new();
    let ghost = runtime.wait_for_registration("ghost", Some(Duration::from_millis(50)));
    let early = runtime.wait_for_registration("early", None);
    runtime.register(Arc::new(FnPlugin::new("early")));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    assert!(matches!(
        rt.block_on(ghost),
        Err(RuntimeError::RegistrationTimeout { timeout_ms: 50, .. })
    ));
    assert_eq!(rt.block_on(early).unwrap().id(), "early");
}

// ==============================================================================
// Start & Dependency Order Tests
// ==============================================================================

#[tokio::test]
async fn test_start_with_enabled_dependent_enables_dependency() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("dep", &log));
    runtime.register(tracked("base", &log));

    let manifest = Manifest::new(vec![direct("base", &[]), direct("dep", &["base"])]);
    runtime
        .start(StartConfig::new().with_manifest(manifest).with_enabled(["dep"]))
        .await;

    let enabled = runtime.get_enabled();
    assert!(enabled.contains(&"base".to_string()));
    assert!(enabled.contains(&"dep".to_string()));
    assert_eq!(entries(&log), vec!["init:base", "init:dep"]);
}

#[tokio::test]
async fn test_chain_initializes_base_first() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    for id in ["top", "mid", "base"] {
        runtime.register(tracked(id, &log));
    }

    let manifest = Manifest::new(vec![
        direct("top", &["mid"]),
        direct("mid", &["base"]),
        direct("base", &[]),
    ]);
    runtime
        .start(StartConfig::new().with_manifest(manifest).with_enabled(["top"]))
        .await;

    let dependencies = runtime.get_dependencies("top");
    assert!(dependencies.contains(&"mid".to_string()));
    assert!(dependencies.contains(&"base".to_string()));
    assert_eq!(entries(&log), vec!["init:base", "init:mid", "init:top"]);
}

#[tokio::test]
async fn test_cyclic_manifest_still_starts() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("a", &log));
    runtime.register(tracked("b", &log));

    let manifest = Manifest::new(vec![direct("a", &["b"]), direct("b", &["a"])]);
    runtime.start(StartConfig::new().with_manifest(manifest)).await;

    assert_eq!(runtime.get_dependencies("a"), vec!["b"]);
    assert_eq!(runtime.get_dependencies("b"), vec!["a"]);
    assert_eq!(count(&log, "init:a"), 1);
    assert_eq!(count(&log, "init:b"), 1);
}

#[tokio::test]
async fn test_loader_with_delayed_registration() {
    let log = new_log();
    let runtime = PluginRuntime::builder()
        .loader(Arc::new(DelayedLoader {
            delay: Duration::from_millis(20),
            log: Arc::clone(&log),
        }))
        .build();

    let manifest = Manifest::new(vec![
        PluginDescriptor::new("base", "base"),
        PluginDescriptor::new("dep", "dep").with_dependencies(["base"]),
    ]);
    runtime.start(StartConfig::new().with_manifest(manifest)).await;

    assert_eq!(runtime.list_plugins(), vec!["base", "dep"]);
    assert_eq!(entries(&log), vec!["init:base", "init:dep"]);
}

#[tokio::test]
async fn test_early_dependent_registration_waits_for_dependency() {
    let log = new_log();
    let runtime = PluginRuntime::builder()
        .loader(Arc::new(DelayedLoader {
            delay: Duration::from_millis(100),
            log: Arc::clone(&log),
        }))
        .build();

    let manifest = Manifest::new(vec![
        PluginDescriptor::new("base", "base"),
        direct("dep", &["base"]),
    ]);

    let registering = runtime.clone();
    let dep = tracked("dep", &log);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        registering.register(dep);
    });

    runtime
        .start(StartConfig::new().with_manifest(manifest).with_enabled(["dep"]))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(entries(&log), vec!["init:base", "init:dep"]);
}

#[tokio::test]
async fn test_static_loader_loads_bundled_plugins() {
    let log = new_log();
    let loader = StaticLoader::new();
    for id in ["markdown", "citations"] {
        let log = Arc::clone(&log);
        loader.add(format!("bundled/{}", id), move || tracked(id, &log));
    }
    let loader = Arc::new(loader);
    let runtime = PluginRuntime::builder().loader(loader.clone()).build();

    let manifest = Manifest::new(vec![
        PluginDescriptor::new("markdown", "bundled/markdown"),
        PluginDescriptor::new("citations", "bundled/citations").with_dependencies(["markdown"]),
    ]);
    runtime.start(StartConfig::new().with_manifest(manifest)).await;

    assert!(loader.is_loaded("bundled/markdown"));
    assert!(loader.is_loaded("bundled/citations"));
    assert_eq!(entries(&log), vec!["init:markdown", "init:citations"]);
}

#[tokio::test]
async fn test_registration_timeout_skips_only_that_plugin() {
    let runtime = PluginRuntime::builder()
        .loader(Arc::new(SilentLoader))
        .build();
    let log = new_log();
    runtime.register(tracked("present", &log));

    let manifest = Manifest::new(vec![
        PluginDescriptor::new("ghost", "ghost.js"),
        PluginDescriptor::new("present", "present.js"),
    ]);
    let started = Instant::now();
    runtime
        .start(
            StartConfig::new()
                .with_manifest(manifest)
                .with_registration_timeout(Duration::from_millis(50)),
        )
        .await;

    assert!(started.elapsed() < Duration::from_millis(1000));
    assert!(runtime.get_plugin("ghost").is_none());
    assert_eq!(entries(&log), vec!["init:present"]);
    assert!(runtime.is_enabled("ghost"));
}

#[tokio::test]
async fn test_loader_failure_is_not_fatal() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("present", &log));

    let manifest = Manifest::new(vec![
        PluginDescriptor::new("missing", "nowhere.js"),
        PluginDescriptor::new("present", ""),
    ]);
    runtime.start(StartConfig::new().with_manifest(manifest)).await;

    assert!(runtime.get_plugin("missing").is_none());
    assert_eq!(entries(&log), vec!["init:present"]);
}

#[tokio::test]
async fn test_loader_failure_drops_pending_wait() {
    let runtime = PluginRuntime::new();
    let manifest = Manifest::new(vec![PluginDescriptor::new("missing", "nowhere.js")]);
    runtime.start(StartConfig::new().with_manifest(manifest)).await;

    let started = Instant::now();
    let result = runtime
        .wait_for_registration("missing", Some(Duration::from_millis(50)))
        .await;

    assert!(matches!(
        result,
        Err(RuntimeError::RegistrationTimeout { timeout_ms: 50, .. })
    ));
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn test_overlapping_starts_run_in_order() {
    let runtime = PluginRuntime::new();
    let names = capture_names(
        &runtime,
        &[
            events::PLUGINS_STARTING,
            events::PLUGINS_STARTED,
            events::PLUGINS_ACTIVATING,
            events::PLUGINS_ACTIVATED,
        ],
    );

    tokio::join!(
        runtime.start(StartConfig::new()),
        runtime.start(StartConfig::new())
    );

    assert_eq!(
        entries(&names),
        vec![
            events::PLUGINS_STARTING,
            events::PLUGINS_STARTED,
            events::PLUGINS_ACTIVATING,
            events::PLUGINS_ACTIVATED,
        ]
    );
}

#[tokio::test]
async fn test_restart_does_not_reinit() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("once", &log));

    runtime.start(StartConfig::new().with_enabled(["once"])).await;
    runtime.start(StartConfig::new()).await;

    assert_eq!(entries(&log), vec!["init:once"]);
}

// ==============================================================================
// Enable / Disable Tests
// ==============================================================================

#[tokio::test]
async fn test_enable_plugin_enables_dependency_first() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("base", &log));
    runtime.register(tracked("dep", &log));

    let manifest = Manifest::new(vec![direct("base", &[]), direct("dep", &["base"])]);
    runtime
        .start(StartConfig::new().with_manifest(manifest).with_enabled(Vec::<String>::new()))
        .await;
    let enabled_events = capture(&runtime, events::PLUGIN_ENABLED);

    assert!(runtime.enable_plugin("dep").await);

    assert_eq!(runtime.get_enabled(), vec!["base", "dep"]);
    assert_eq!(entries(&log), vec!["init:base", "init:dep"]);
    assert_eq!(
        *enabled_events.lock().unwrap(),
        vec![json!({"id": "dep", "dependencies": ["base"]})]
    );
}

#[tokio::test]
async fn test_disable_blocked_by_enabled_dependent() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("base", &log));
    runtime.register(tracked("dep", &log));

    let manifest = Manifest::new(vec![direct("base", &[]), direct("dep", &["base"])]);
    runtime
        .start(StartConfig::new().with_manifest(manifest).with_enabled(["dep"]))
        .await;
    let disabled_events = capture(&runtime, events::PLUGIN_DISABLED);
    let before = runtime.get_enabled();

    assert!(!runtime.disable_plugin("base").await);
    assert_eq!(runtime.get_enabled(), before);
    assert_eq!(count(&log, "destroy:base"), 0);

    assert!(runtime.disable_plugin("dep").await);
    assert!(runtime.disable_plugin("base").await);
    assert!(runtime.disable_plugin("base").await);

    assert!(runtime.get_enabled().is_empty());
    assert_eq!(count(&log, "destroy:base"), 1);
    assert_eq!(count(&log, "destroy:dep"), 1);
    assert_eq!(
        *disabled_events.lock().unwrap(),
        vec![json!({"id": "dep"}), json!({"id": "base"})]
    );
}

#[tokio::test]
async fn test_reenable_runs_init_again() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("toggle", &log));
    runtime.start(StartConfig::new().with_enabled(["toggle"])).await;

    assert!(runtime.disable_plugin("toggle").await);
    assert!(runtime.enable_plugin("toggle").await);

    assert_eq!(
        entries(&log),
        vec!["init:toggle", "destroy:toggle", "init:toggle"]
    );
}

#[tokio::test]
async fn test_disable_destroys_plugin_that_never_initialized() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("idle", &log));

    assert!(runtime.enable_plugin("idle").await);
    assert!(!runtime.get_plugin("idle").unwrap().is_inited());
    assert!(runtime.disable_plugin("idle").await);

    assert_eq!(entries(&log), vec!["destroy:idle"]);
    assert!(!runtime.is_enabled("idle"));
}

// ==============================================================================
// Failure Containment Tests
// ==============================================================================

#[tokio::test]
async fn test_panicking_init_does_not_block_siblings() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    let errors = capture(&runtime, events::PLUGIN_ERROR);

    runtime.register(Arc::new(Explosive));
    runtime.register(tracked("sibling", &log));

    runtime
        .start(StartConfig::new().with_enabled(["explosive", "sibling"]))
        .await;

    assert_eq!(entries(&log), vec!["init:sibling"]);
    assert!(runtime.get_plugin("explosive").unwrap().is_inited());

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["id"], "explosive");
    assert_eq!(errors[0]["phase"], "init");
    assert!(errors[0]["error"].as_str().unwrap().contains("init blew up"));
}

#[tokio::test]
async fn test_failing_destroy_still_disables() {
    let runtime = PluginRuntime::new();
    runtime.register(Arc::new(
        FnPlugin::new("stubborn").on_destroy(|| async { anyhow::bail!("cannot let go") }),
    ));
    runtime.start(StartConfig::new().with_enabled(["stubborn"])).await;

    assert!(runtime.disable_plugin("stubborn").await);
    assert!(!runtime.is_enabled("stubborn"));
    assert!(!runtime.get_plugin("stubborn").unwrap().is_inited());
}

#[tokio::test]
async fn test_emit_survives_panicking_subscriber() {
    let runtime = PluginRuntime::new();
    let seen = new_log();

    runtime.on("document:opened", |_| panic!("bad subscriber"));
    let sink = Arc::clone(&seen);
    let kept = runtime.on("document:opened", move |payload| {
        sink.lock().unwrap().push(payload["path"].as_str().unwrap().to_string());
    });
    let sink = Arc::clone(&seen);
    let removed = runtime.on("document:opened", move |_| {
        sink.lock().unwrap().push("removed".to_string());
    });

    runtime.off("document:opened", removed.id());
    runtime.emit("document:opened", &json!({"path": "draft.md"}));

    assert_eq!(entries(&seen), vec!["draft.md"]);
    kept.unsubscribe();
    assert_eq!(runtime.events().handler_count("document:opened"), 1);
}

// ==============================================================================
// Hot Reload Tests
// ==============================================================================

fn reloadable_runtime(log: &Log, builds: &Arc<AtomicUsize>) -> PluginRuntime {
    let factory_log = Arc::clone(log);
    let factory_builds = Arc::clone(builds);
    let loader = StaticLoader::new().with_plugin("bundled/outline", move || {
        factory_builds.fetch_add(1, Ordering::SeqCst);
        tracked("outline", &factory_log)
    });
    PluginRuntime::builder().loader(Arc::new(loader)).build()
}

fn outline_manifest() -> Manifest {
    Manifest::new(vec![PluginDescriptor::new("outline", "bundled/outline")])
}

#[tokio::test]
async fn test_reload_refused_without_dev_mode() {
    let log = new_log();
    let builds = Arc::new(AtomicUsize::new(0));
    let runtime = reloadable_runtime(&log, &builds);
    runtime
        .start(StartConfig::new().with_manifest(outline_manifest()))
        .await;

    let outcome = runtime.reload_plugin("outline").await;

    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("dev mode is disabled"));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(entries(&log), vec!["init:outline"]);
    assert_eq!(runtime.get_enabled(), vec!["outline"]);
    assert!(runtime.get_plugin("outline").unwrap().is_inited());
}

#[tokio::test]
async fn test_reload_replaces_instance() {
    let log = new_log();
    let builds = Arc::new(AtomicUsize::new(0));
    let runtime = reloadable_runtime(&log, &builds);
    let names = capture_names(&runtime, &[events::PLUGIN_RELOADING, events::PLUGIN_RELOADED]);

    runtime
        .start(
            StartConfig::new()
                .with_manifest(outline_manifest())
                .with_dev_mode(true),
        )
        .await;
    let before = runtime.get_plugin("outline").unwrap();

    let outcome = runtime.reload_plugin("outline").await;

    assert!(outcome.success, "reload failed: {:?}", outcome.error);
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(
        entries(&log),
        vec!["init:outline", "destroy:outline", "init:outline"]
    );
    let after = runtime.get_plugin("outline").unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(after.is_inited());
    assert_eq!(
        entries(&names),
        vec![events::PLUGIN_RELOADING, events::PLUGIN_RELOADED]
    );
}

#[tokio::test]
async fn test_reload_all_collects_results() {
    let runtime = PluginRuntime::builder()
        .loader(Arc::new(SilentLoader))
        .build();
    runtime.register(Arc::new(FnPlugin::new("direct")));

    let manifest = Manifest::new(vec![
        PluginDescriptor::new("direct", ""),
        PluginDescriptor::new("silent", "silent.js"),
    ]);
    runtime
        .start(
            StartConfig::new()
                .with_manifest(manifest)
                .with_dev_mode(true)
                .with_registration_timeout(Duration::from_millis(30)),
        )
        .await;

    let outcome = runtime.reload_all_plugins().await;

    assert!(outcome.success);
    assert_eq!(outcome.results.len(), 2);
    assert!(!outcome.results["direct"].success);
    assert!(!outcome.results["silent"].success);
    assert!(outcome.results["silent"]
        .error
        .as_deref()
        .unwrap()
        .contains("Timed out"));
}

// ==============================================================================
// Settings & Host Context Tests
// ==============================================================================

#[tokio::test]
async fn test_settings_set_update_clear() {
    let runtime = PluginRuntime::new();
    runtime.start(StartConfig::new()).await;

    assert!(runtime.set_settings("theme", json!({"a": 1})));
    assert_eq!(runtime.get_settings("theme"), Some(json!({"a": 1})));

    let mut patch = Map::new();
    patch.insert("b".to_string(), json!(2));
    assert!(runtime.update_settings("theme", patch));
    assert_eq!(runtime.get_settings("theme"), Some(json!({"a": 1, "b": 2})));

    assert!(runtime.clear_settings("theme"));
    assert_eq!(runtime.get_settings("theme"), None);
    assert!(!runtime.set_settings("  ", json!({})));
}

#[tokio::test]
async fn test_settings_survive_a_fresh_runtime() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("settings.json");

    let first = PluginRuntime::builder()
        .settings_backend(Arc::new(FileSettingsBackend::new(&path)))
        .build();
    first.start(StartConfig::new()).await;
    first.set_settings("speech", json!({"rate": 1.25}));
    first.shutdown().await.unwrap();

    let second = PluginRuntime::builder()
        .settings_backend(Arc::new(FileSettingsBackend::new(&path)))
        .build();
    second.start(StartConfig::new()).await;

    assert_eq!(second.get_settings("speech"), Some(json!({"rate": 1.25})));
}

#[tokio::test]
async fn test_corrupt_settings_do_not_block_start() {
    let runtime = PluginRuntime::builder()
        .settings_backend(Arc::new(MemorySettingsBackend::with_blob("{ definitely not json")))
        .build();
    let log = new_log();
    runtime.register(tracked("theme", &log));

    runtime.start(StartConfig::new().with_enabled(["theme"])).await;

    assert!(runtime.is_started());
    assert_eq!(runtime.get_settings("theme"), None);
    assert_eq!(entries(&log), vec!["init:theme"]);
}

#[derive(Debug)]
struct Clipboard {
    text: String,
}

#[tokio::test]
async fn test_host_context_exposes_settings_and_capabilities() {
    let runtime = PluginRuntime::new();
    runtime.extend_host(Clipboard {
        text: "copied".to_string(),
    });

    runtime.register(Arc::new(FnPlugin::new("paste").on_init(|ctx| async move {
        let clipboard = ctx
            .capability::<Clipboard>()
            .ok_or_else(|| anyhow::anyhow!("clipboard missing"))?;
        ctx.set_settings(json!({ "last": clipboard.text }));
        ctx.emit("paste:ready", &json!({ "id": ctx.plugin_id() }));
        Ok(())
    })));
    let ready = capture(&runtime, "paste:ready");

    runtime.start(StartConfig::new().with_enabled(["paste"])).await;

    assert_eq!(runtime.get_settings("paste"), Some(json!({"last": "copied"})));
    assert_eq!(*ready.lock().unwrap(), vec![json!({"id": "paste"})]);
}

#[tokio::test]
async fn test_shutdown_destroys_dependents_first() {
    let runtime = PluginRuntime::new();
    let log = new_log();
    runtime.register(tracked("a", &log));
    runtime.register(tracked("b", &log));

    let manifest = Manifest::new(vec![direct("a", &[]), direct("b", &["a"])]);
    runtime
        .start(StartConfig::new().with_manifest(manifest).with_enabled(["b"]))
        .await;
    runtime.shutdown().await.unwrap();

    assert_eq!(
        entries(&log),
        vec!["init:a", "init:b", "destroy:b", "destroy:a"]
    );
    assert!(!runtime.is_started());
}
