//! CLI handlers for the `tether config` subcommand.

use std::path::Path;

use anyhow::Result;
use tether_config::{ConfigLayer, ResolvedConfig, env::env_var_fields};

use crate::theme::Theme;

/// Show the resolved configuration and where non-default values came from.
pub(crate) fn show_config(resolved: &ResolvedConfig, format: &str, section: Option<&str>) -> Result<()> {
    let json = format == "json";
    let output = resolved
        .render(json, section)
        .map_err(|e| anyhow::anyhow!("failed to format config: {e}"))?;
    println!("{output}");

    if json {
        return Ok(());
    }
    let mut overridden: Vec<_> = resolved
        .field_sources
        .iter()
        .filter(|(field, layer)| {
            **layer != ConfigLayer::Defaults
                && section.is_none_or(|s| field.starts_with(&format!("{s}.")))
        })
        .collect();
    if overridden.is_empty() {
        return Ok(());
    }
    overridden.sort_by(|a, b| a.0.cmp(b.0));
    println!("{}", Theme::header("Overrides"));
    for (field, layer) in overridden {
        println!("  {}", Theme::kv(field, &layer.to_string()));
    }
    Ok(())
}

/// Report whether the configuration loads and validates.
pub(crate) fn validate_config(resolved: Result<ResolvedConfig>) {
    match resolved {
        Ok(resolved) => {
            println!("{}", Theme::success("Configuration is valid."));
            if !resolved.loaded_files.is_empty() {
                println!("\nLoaded files:");
                for path in &resolved.loaded_files {
                    println!("  - {path}");
                }
            }
        },
        Err(e) => {
            eprintln!("{}", Theme::error(&format!("Configuration error: {e:#}")));
            std::process::exit(1);
        },
    }
}

/// Show all config file paths that are checked.
pub(crate) fn show_paths(workspace_root: Option<&Path>) {
    let home = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf());
    let paths = ResolvedConfig::config_paths(home.as_deref(), workspace_root);

    println!("Configuration files checked (lowest precedence first):\n");
    println!("  0. <embedded defaults>");
    for (i, path) in paths.iter().enumerate() {
        let status = if path.exists() {
            Theme::success("found")
        } else {
            Theme::dimmed("not found")
        };
        println!("  {}. {}  [{status}]", i.saturating_add(1), path.display());
    }

    println!("\nEnvironment variable fallbacks (apply only where no file set the field):");
    for (var, field) in env_var_fields() {
        println!("  {var:<28} -> {field}");
    }
}
