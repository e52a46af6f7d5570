//! Static plugin inspection: `tether list` and `tether check`.

use std::path::Path;

use serde_json::{Value, json};
use tether_plugins::discovery::resolve_manifest_path;
use tether_plugins::{
    HandlerDecl, HandlerKind, LoadOutcome, LoadedPlugin, PluginStats, discover_manifests,
    load_manifest,
};

use crate::theme::Theme;

fn names(decls: &[HandlerDecl]) -> Vec<&str> {
    decls.iter().map(|d| d.name.as_str()).collect()
}

fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// List every plugin manifest under the plugin directory without loading it.
pub(crate) fn list_plugins(plugin_dir: &Path, as_json: bool) -> anyhow::Result<()> {
    let discovered = discover_manifests(plugin_dir)?;

    if as_json {
        let rows: Vec<Value> = discovered
            .iter()
            .map(|p| match &p.manifest {
                Ok(m) => json!({
                    "dir": p.dir,
                    "name": m.name,
                    "version": m.version,
                    "permissions": m.permissions,
                    "dependencies": m.dependencies,
                    "tools": names(&m.tools),
                    "resources": names(&m.resources),
                    "prompts": names(&m.prompts),
                }),
                Err(e) => json!({ "dir": p.dir, "error": e.to_payload() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if discovered.is_empty() {
        println!(
            "{}",
            Theme::info(&format!("No plugins found in {}", plugin_dir.display()))
        );
        return Ok(());
    }

    println!(
        "{}",
        Theme::header(&format!("Plugins in {}", plugin_dir.display()))
    );
    println!(
        "  {:<24} {:<10} {:>5} {:>5} {:>7}  PERMISSIONS",
        "NAME", "VERSION", "TOOLS", "RES", "PROMPTS"
    );
    println!("{}", Theme::separator());

    let mut invalid: usize = 0;
    for plugin in &discovered {
        match &plugin.manifest {
            Ok(m) => {
                let permissions = m
                    .permissions
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "  {:<24} {:<10} {:>5} {:>5} {:>7}  {}",
                    m.name,
                    m.version,
                    m.tools.len(),
                    m.resources.len(),
                    m.prompts.len(),
                    if permissions.is_empty() {
                        Theme::dimmed("none")
                    } else {
                        permissions
                    }
                );
            },
            Err(e) => {
                invalid = invalid.saturating_add(1);
                println!(
                    "  {:<24} {}",
                    dir_label(&plugin.dir),
                    Theme::error(&e.to_string())
                );
            },
        }
    }

    println!(
        "\n{}",
        Theme::dimmed(&format!(
            "{} plugin(s), {invalid} invalid",
            discovered.len()
        ))
    );
    Ok(())
}

/// Parse one plugin and normalize every handler, reporting what would load.
pub(crate) fn check_plugin(path: &Path) -> anyhow::Result<()> {
    let (manifest_path, dir) = resolve_manifest_path(path);
    let checked =
        load_manifest(&manifest_path).and_then(|m| LoadedPlugin::from_manifest(m, &dir));

    let plugin = match checked {
        Ok(plugin) => plugin,
        Err(e) => {
            eprintln!(
                "{} {}",
                Theme::error_code(e.kind()),
                Theme::error(&e.to_string())
            );
            std::process::exit(1);
        },
    };

    let manifest = plugin.manifest();
    println!(
        "{}",
        Theme::header(&format!("{} v{}", manifest.name, manifest.version))
    );
    if let Some(description) = &manifest.description {
        println!("  {}", Theme::dimmed(description));
    }
    let permissions = manifest
        .permissions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    println!("  {}", Theme::kv("permissions", &permissions.join(", ")));
    if !manifest.dependencies.is_empty() {
        println!(
            "  {}",
            Theme::kv("dependencies", &manifest.dependencies.join(", "))
        );
    }
    println!("{}", Theme::separator());

    for kind in [HandlerKind::Tool, HandlerKind::Resource, HandlerKind::Prompt] {
        for name in plugin.handler_names(kind) {
            let Some(def) = plugin.handler(kind, &name) else {
                continue;
            };
            let uri = def.uri.as_deref().unwrap_or("");
            println!(
                "  {:<9} {:<24} {:<28} {}",
                kind.to_string(),
                name,
                def.handler.source().to_string(),
                Theme::dimmed(uri)
            );
        }
    }

    println!("\n{}", Theme::success("Manifest and handlers are valid"));
    Ok(())
}

/// Print plugins that failed to load during a directory scan.
pub(crate) fn report_outcomes(outcomes: &[LoadOutcome]) {
    for outcome in outcomes {
        let label = outcome
            .name
            .clone()
            .unwrap_or_else(|| dir_label(&outcome.dir));
        match &outcome.result {
            Ok(_) => println!("  {}", Theme::success(&format!("loaded {label}"))),
            Err(e) => eprintln!(
                "  {} {}",
                Theme::error_code(e.kind()),
                Theme::warning(&format!("{label}: {e}"))
            ),
        }
    }
}

/// Print a stats table.
pub(crate) fn print_stats(stats: &[(String, PluginStats)]) {
    if stats.is_empty() {
        return;
    }
    eprintln!("{}", Theme::header("Invocation stats"));
    eprintln!(
        "  {:<24} {:>6} {:>6} {:>10} {:>10}  LAST",
        "NAME", "CALLS", "ERRORS", "AVG", "TOTAL"
    );
    eprintln!("{}", Theme::separator());
    for (name, s) in stats {
        eprintln!(
            "  {:<24} {:>6} {:>6} {:>10} {:>10}  {}",
            name,
            s.tool_calls,
            s.error_count,
            Theme::duration(s.average_execution_time),
            Theme::duration(s.total_execution_time),
            s.last_executed
                .as_ref()
                .map_or_else(|| Theme::dimmed("never"), Theme::timestamp)
        );
    }
}
