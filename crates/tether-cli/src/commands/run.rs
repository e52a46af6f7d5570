//! `tether run`: host the plugin directory until interrupted.

use std::path::Path;

use tether_config::Config;
use tether_plugins::{PluginRuntime, RuntimeEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use super::plugins::{print_stats, report_outcomes};
use crate::config_bridge::{build_backends, to_runtime_config};
use crate::theme::{Theme, print_banner};

fn describe(event: &RuntimeEvent) -> String {
    match event {
        RuntimeEvent::PluginLoaded { name } => Theme::success(&format!("loaded {name}")),
        RuntimeEvent::PluginReloaded { name } => Theme::success(&format!("reloaded {name}")),
        RuntimeEvent::PluginUnloaded { name } => Theme::info(&format!("unloaded {name}")),
        RuntimeEvent::Error {
            plugin: Some(plugin),
            message,
        } => Theme::error(&format!("{plugin}: {message}")),
        RuntimeEvent::Error {
            plugin: None,
            message,
        } => Theme::error(message),
    }
}

/// Load every plugin, watch for changes, and print lifecycle events until
/// Ctrl-C.
pub(crate) async fn run_host(
    cfg: &Config,
    workspace_root: Option<&Path>,
    watch: bool,
) -> anyhow::Result<()> {
    print_banner();

    let mut runtime_config = to_runtime_config(cfg, workspace_root);
    runtime_config.hot_reload = runtime_config.hot_reload && watch;
    println!(
        "{}",
        Theme::kv(
            "Plugin directory",
            &runtime_config.plugin_dir.display().to_string()
        )
    );
    let runtime = PluginRuntime::new(runtime_config, build_backends(cfg)?);

    let outcomes = runtime.load_all()?;
    report_outcomes(&outcomes);
    let loaded = runtime.list_plugins();
    info!(plugins = loaded.len(), "Runtime ready");

    let mut events = runtime.subscribe();
    if runtime.start_hot_reload() {
        println!("{}", Theme::info("Watching for plugin changes"));
    } else {
        println!("{}", Theme::dimmed("Hot reload is off"));
    }
    println!("{}", Theme::dimmed("Press Ctrl-C to stop"));
    println!("{}", Theme::separator());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            },
            event = events.recv() => match event {
                Ok(event) => println!(
                    "{} {}",
                    Theme::timestamp(&chrono::Utc::now()),
                    describe(&event)
                ),
                Err(RecvError::Lagged(missed)) => {
                    println!("{}", Theme::warning(&format!("missed {missed} event(s)")));
                },
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!();
    print_stats(&runtime.get_all_stats());
    runtime.shutdown();
    println!("{}", Theme::success("Stopped"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_mentions_plugin() {
        let text = describe(&RuntimeEvent::PluginReloaded {
            name: "alpha".into(),
        });
        assert!(text.contains("reloaded alpha"));

        let text = describe(&RuntimeEvent::Error {
            plugin: Some("beta".into()),
            message: "bad manifest".into(),
        });
        assert!(text.contains("beta: bad manifest"));
    }
}
