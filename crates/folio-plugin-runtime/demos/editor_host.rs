//! A minimal editor host embedding the plugin runtime.
//!
//! Run with `cargo run -p folio-plugin-runtime --example editor_host`.

use anyhow::Result;
use folio_plugin_runtime::{
    events, FileSettingsBackend, FnPlugin, HostContext, LogLevel, Manifest, Plugin,
    PluginDescriptor, PluginRuntime, RuntimeConfig, StaticLoader, Subscription,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Host capability handed to plugins through `extend_host`.
#[derive(Debug)]
struct StatusBar {
    prefix: String,
}

impl StatusBar {
    fn show(&self, message: &str) {
        println!("[{}] {}", self.prefix, message);
    }
}

/// Event subscriptions a plugin holds while it is initialized.
///
/// Subscriptions outlive their handle, so a plugin releases them in `destroy`
/// or a hot reload would leave the old handlers attached.
#[derive(Clone, Default)]
struct Subscriptions(Arc<Mutex<Vec<Subscription>>>);

impl Subscriptions {
    fn keep(&self, subscription: Subscription) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
    }

    fn release(&self) {
        let held = std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner));
        for subscription in held {
            subscription.unsubscribe();
        }
    }
}

/// A plugin that subscribes in `init` through `setup` and unsubscribes
/// everything in `destroy`.
fn subscribing_plugin<F>(id: &str, setup: F) -> Arc<dyn Plugin>
where
    F: Fn(&HostContext, &Subscriptions) + Send + Sync + 'static,
{
    let subscriptions = Subscriptions::default();
    let held = subscriptions.clone();
    let plugin_id = id.to_string();
    Arc::new(
        FnPlugin::new(id)
            .on_init(move |ctx| {
                setup(&ctx, &subscriptions);
                async { Ok(()) }
            })
            .on_destroy(move || {
                held.release();
                let plugin_id = plugin_id.clone();
                async move {
                    info!(plugin = %plugin_id, "Released event handlers");
                    Ok(())
                }
            }),
    )
}

fn markdown() -> Arc<dyn Plugin> {
    subscribing_plugin("markdown", |ctx, subscriptions| {
        let renderer = ctx.clone();
        subscriptions.keep(ctx.on("document:changed", move |payload| {
            let text = payload["text"].as_str().unwrap_or_default();
            let headings = text.lines().filter(|l| l.starts_with('#')).count();
            renderer.emit("markdown:rendered", &json!({ "headings": headings }));
        }));
    })
}

fn word_count() -> Arc<dyn Plugin> {
    subscribing_plugin("word-count", |ctx, subscriptions| {
        let status = ctx.capability::<StatusBar>();
        let counter = ctx.clone();
        subscriptions.keep(ctx.on("document:changed", move |payload| {
            let words = payload["text"]
                .as_str()
                .map(|t| t.split_whitespace().count())
                .unwrap_or_default();
            counter.set_settings(json!({ "lastCount": words }));
            if let Some(status) = &status {
                status.show(&format!("{} words", words));
            }
        }));
    })
}

fn outline() -> Arc<dyn Plugin> {
    subscribing_plugin("outline", |ctx, subscriptions| {
        let outline = ctx.clone();
        subscriptions.keep(ctx.on("markdown:rendered", move |payload| {
            outline.log(
                LogLevel::Info,
                &format!("outline has {} heading(s)", payload["headings"]),
            );
        }));
    })
}

fn bundled_manifest() -> Manifest {
    Manifest::new(vec![
        PluginDescriptor::new("markdown", "bundled/markdown"),
        PluginDescriptor::new("word-count", "bundled/word-count"),
        PluginDescriptor::new("outline", "bundled/outline")
            .with_dependencies(["markdown"])
            .disabled_by_default(),
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match RuntimeConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config, using defaults: {:#}", e);
            RuntimeConfig::default()
        }
    };

    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_new(&config.runtime.log_level)?)
        .with_target(true)
        .init();

    info!("Starting editor host v{}", env!("CARGO_PKG_VERSION"));

    let loader = StaticLoader::new()
        .with_plugin("bundled/markdown", markdown)
        .with_plugin("bundled/word-count", word_count)
        .with_plugin("bundled/outline", outline);

    let settings_path = config.settings_path()?;
    info!("Plugin settings at: {}", settings_path.display());

    let runtime = PluginRuntime::builder()
        .loader(Arc::new(loader))
        .settings_backend(Arc::new(FileSettingsBackend::new(settings_path)))
        .config(config.clone())
        .build();
    runtime.extend_host(StatusBar {
        prefix: "folio".to_string(),
    });

    runtime.on(events::PLUGIN_ERROR, |payload: &Value| {
        eprintln!("plugin failed: {}", payload);
    });

    let manifest = config.load_manifest()?.unwrap_or_else(bundled_manifest);
    runtime
        .start(config.start_config().with_manifest(manifest))
        .await;
    info!("Enabled plugins: {:?}", runtime.get_enabled());

    runtime.emit(
        "document:changed",
        &json!({ "text": "# Notes\n\nplugins all the way down" }),
    );

    runtime.enable_plugin("outline").await;
    runtime.emit(
        "document:changed",
        &json!({ "text": "# Notes\n## Runtime\n## Loader" }),
    );

    if runtime.is_dev_mode() {
        let outcome = runtime.reload_all_plugins().await;
        info!("Reloaded plugins: {}", serde_json::to_string(&outcome)?);
        info!(
            "document:changed handlers after reload: {}",
            runtime.events().handler_count("document:changed")
        );
    }

    if !runtime.disable_plugin("markdown").await {
        info!("markdown is still needed by: {:?}", runtime.get_dependents("markdown"));
    }
    runtime.disable_plugin("outline").await;

    info!("word-count settings: {:?}", runtime.get_settings("word-count"));
    runtime.shutdown().await?;
    info!("Editor host stopped");
    Ok(())
}
