//! `tether invoke`: load the plugin directory and run one handler.

use std::path::Path;

use anyhow::Context;
use serde_json::{Value, json};
use tether_config::Config;
use tether_plugins::{HandlerKind, PluginRuntime};

use super::plugins::{print_stats, report_outcomes};
use crate::config_bridge::{build_backends, to_runtime_config};
use crate::theme::Theme;

/// Parse `--params`, which must be a JSON object.
fn parse_params(raw: &str) -> anyhow::Result<Value> {
    let params: Value = serde_json::from_str(raw).context("--params must be valid JSON")?;
    if !params.is_object() {
        anyhow::bail!("--params must be a JSON object");
    }
    Ok(params)
}

/// Run a single handler and print its JSON result to stdout.
///
/// On failure the error payload is printed instead and the process exits
/// non-zero.
pub(crate) async fn invoke_handler(
    cfg: &Config,
    workspace_root: Option<&Path>,
    kind: HandlerKind,
    plugin: &str,
    handler: &str,
    params: &str,
    show_stats: bool,
) -> anyhow::Result<()> {
    let params = parse_params(params)?;

    let mut runtime_config = to_runtime_config(cfg, workspace_root);
    runtime_config.hot_reload = false;
    let runtime = PluginRuntime::new(runtime_config, build_backends(cfg)?);

    let outcomes = runtime.load_all()?;
    let failed: Vec<_> = outcomes.into_iter().filter(|o| o.result.is_err()).collect();
    report_outcomes(&failed);

    let result = runtime.execute_handler(kind, plugin, handler, params).await;
    if show_stats {
        print_stats(&runtime.get_all_stats());
    }
    runtime.shutdown();

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        },
        Err(e) => {
            eprintln!(
                "{} {}",
                Theme::error_code(e.kind()),
                Theme::error(&e.to_string())
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "error": e.to_payload() }))?
            );
            std::process::exit(1);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("{}").unwrap(), json!({}));
        assert_eq!(parse_params(r#"{"a":1}"#).unwrap(), json!({ "a": 1 }));
        assert!(parse_params("[1]").is_err());
        assert!(parse_params("{").is_err());
    }
}
