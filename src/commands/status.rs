use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeSet;
use std::env;

use crate::commands::CommandReport;
use crate::config::IngestConfig;
use crate::ingest::converter::builtin_specs;
use crate::paths::IngestPaths;

include!(concat!(env!("OUT_DIR"), "/gnss_ingest_env_allowlist.rs"));

/// Flattens a JSON tree into `a.b.c=value` lines. Arrays are skipped.
fn flatten(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        Value::Array(_) => {}
        Value::String(s) => out.push(format!("{prefix}={s}")),
        other => out.push(format!("{prefix}={other}")),
    }
}

/// Allowlisted variables that are set in the current environment.
pub fn active_env_overrides() -> Vec<String> {
    GENERATED_GNSS_INGEST_ENV_ALLOWLIST
        .iter()
        .filter(|key| env::var_os(key).is_some())
        .map(|key| key.to_string())
        .collect()
}

pub fn run(paths: &IngestPaths, cfg: &IngestConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");

    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!(
        "config_file={} ({})",
        paths.config_file.display(),
        if paths.config_file.exists() { "present" } else { "defaults" }
    ));

    let mut lines = Vec::new();
    flatten("config", &serde_json::to_value(cfg)?, &mut lines);
    for line in lines {
        report.detail(line);
    }

    let active = active_env_overrides();
    report.detail(format!(
        "env_overrides={}",
        if active.is_empty() { "-".to_string() } else { active.join(",") }
    ));

    let user = cfg
        .converters
        .iter()
        .map(|c| c.name.as_str())
        .collect::<BTreeSet<_>>();
    for spec in &cfg.converters {
        let found = which::which(&spec.program).is_ok();
        report.detail(format!("converter.{}={} found={found}", spec.name, spec.program));
        if !found {
            report.issue(format!(
                "converter `{}`: program `{}` not found",
                spec.name, spec.program
            ));
        }
    }
    for spec in builtin_specs() {
        if user.contains(spec.name.as_str()) {
            continue;
        }
        let found = which::which(&spec.program).is_ok();
        report.detail(format!("converter.{}={} found={found}", spec.name, spec.program));
    }

    Ok(report)
}
