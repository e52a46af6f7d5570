//! Tether CLI - host and inspect sandboxed plugins.
//!
//! `tether run` hosts the plugin directory with hot reload, `tether invoke`
//! runs a single handler, and `tether list` / `tether check` inspect
//! manifests without executing anything.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tether_config::{Config, FieldSources, ResolvedConfig};
use tether_plugins::HandlerKind;

mod commands;
mod config_bridge;
mod theme;

use commands::{config, invoke, plugins, run};

/// Tether - Sandboxed Plugin Runtime
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load this config file instead of the layered user/workspace files
    #[arg(short, long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the plugin directory
    #[arg(long, global = true)]
    plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugins in the plugin directory without loading them
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Validate one plugin's manifest and handlers
    Check {
        /// Plugin directory or path to its plugin.toml
        path: PathBuf,
    },

    /// Load the plugin directory and run one handler
    Invoke {
        /// Plugin name
        plugin: String,
        /// Tool, resource or prompt name
        handler: String,
        /// Which handler table to look in
        #[arg(short, long, value_enum, default_value_t = KindArg::Tool)]
        kind: KindArg,
        /// Handler params as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,
        /// Print invocation stats to stderr
        #[arg(long)]
        stats: bool,
    },

    /// Host every plugin until interrupted
    Run {
        /// Disable hot reload even if the config enables it
        #[arg(long)]
        no_watch: bool,
    },

    /// View and validate configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show resolved configuration with source annotations
    Show {
        /// Output format (toml or json)
        #[arg(short, long, default_value = "toml")]
        format: String,
        /// Show only a specific section (e.g. plugins, sandbox, logging)
        #[arg(short, long)]
        section: Option<String>,
    },
    /// Validate the current configuration
    Validate,
    /// Show config file paths being checked
    Paths,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    /// `[[tools]]`
    Tool,
    /// `[[resources]]`
    Resource,
    /// `[[prompts]]`
    Prompt,
}

impl From<KindArg> for HandlerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Tool => Self::Tool,
            KindArg::Resource => Self::Resource,
            KindArg::Prompt => Self::Prompt,
        }
    }
}

/// Resolve configuration: an explicit file without layering, otherwise the
/// full defaults → user → workspace → env chain.
fn resolve_config(explicit: Option<&Path>, workspace_root: Option<&Path>) -> Result<ResolvedConfig> {
    match explicit {
        Some(path) => Ok(ResolvedConfig {
            config: Config::load_file(path)?,
            field_sources: FieldSources::new(),
            loaded_files: vec![path.display().to_string()],
        }),
        None => Ok(Config::load(workspace_root)?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace_root = std::env::current_dir().ok();

    let mut resolved = resolve_config(cli.config.as_deref(), workspace_root.as_deref());
    if let (Ok(r), Some(dir)) = (&mut resolved, &cli.plugin_dir) {
        r.config.plugins.directory.clone_from(dir);
    }

    // Set up logging from config, with --verbose override.
    let log_config = if let Ok(r) = &resolved {
        let mut lc = config_bridge::to_log_config(&r.config);
        if cli.verbose {
            "debug".clone_into(&mut lc.level);
        }
        lc
    } else {
        // Fallback if config loading fails.
        let level = if cli.verbose { "debug" } else { "warn" };
        tether_telemetry::LogConfig::new(level).with_format(tether_telemetry::LogFormat::Compact)
    };
    if let Err(e) = tether_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let ws = workspace_root.as_deref();
    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Show { format, section } => {
                config::show_config(&resolved?, &format, section.as_deref())?;
            },
            ConfigCommands::Validate => config::validate_config(resolved),
            ConfigCommands::Paths => config::show_paths(ws),
        },
        Commands::Check { path } => plugins::check_plugin(&path)?,
        Commands::List { json } => {
            let runtime_config = config_bridge::to_runtime_config(&resolved?.config, ws);
            plugins::list_plugins(&runtime_config.plugin_dir, json)?;
        },
        Commands::Invoke {
            plugin,
            handler,
            kind,
            params,
            stats,
        } => {
            let cfg = resolved?.config;
            invoke::invoke_handler(&cfg, ws, kind.into(), &plugin, &handler, &params, stats)
                .await?;
        },
        Commands::Run { no_watch } => {
            let cfg = resolved?.config;
            run::run_host(&cfg, ws, !no_watch).await?;
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_invoke() {
        let cli = Cli::try_parse_from([
            "tether",
            "invoke",
            "sheet-tools",
            "summary",
            "--kind",
            "resource",
            "--params",
            r#"{"a":1}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Invoke {
                plugin,
                handler,
                kind,
                params,
                stats,
            } => {
                assert_eq!(plugin, "sheet-tools");
                assert_eq!(handler, "summary");
                assert_eq!(HandlerKind::from(kind), HandlerKind::Resource);
                assert_eq!(params, r#"{"a":1}"#);
                assert!(!stats);
            },
            _ => panic!("expected invoke"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tether", "list", "--plugin-dir", "/tmp/p", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.plugin_dir, Some(PathBuf::from("/tmp/p")));
    }

    #[test]
    fn test_explicit_config_file_skips_layering() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[rate_limit]\nrequests_per_minute = 7\n").unwrap();

        let resolved = resolve_config(Some(&path), None).unwrap();
        assert_eq!(resolved.config.rate_limit.requests_per_minute, 7);
        assert_eq!(resolved.loaded_files, vec![path.display().to_string()]);
        assert!(resolved.field_sources.is_empty());
    }
}
