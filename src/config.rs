//! Optional JSON config file, validated against `config-schema.json`.
//!
//! Resolution order for every setting is CLI flag, then the command's own
//! section, then `defaults`, then the built-in fallback.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::extract::WeekStart;
use crate::pricing::PricingConfig;

static CONFIG_SCHEMA: OnceCell<JSONSchema> = OnceCell::new();
static CONFIG_SCHEMA_JSON: OnceCell<Value> = OnceCell::new();

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsConfig {
    pub json: Option<bool>,
    pub timezone: Option<String>,
    pub locale: Option<String>,
    pub sessions_dir: Option<PathBuf>,
    pub snapshot_dir: Option<PathBuf>,
    pub start_of_week: Option<WeekStart>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommandConfigs {
    pub cost: Option<DefaultsConfig>,
    pub snapshot: Option<DefaultsConfig>,
    pub estimate: Option<DefaultsConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub defaults: Option<DefaultsConfig>,
    pub commands: Option<CommandConfigs>,
    pub pricing: Option<PricingConfig>,
}

impl FileConfig {
    pub fn command(&self, name: &str) -> Option<&DefaultsConfig> {
        let commands = self.commands.as_ref()?;
        match name {
            "cost" => commands.cost.as_ref(),
            "snapshot" => commands.snapshot.as_ref(),
            "estimate" => commands.estimate.as_ref(),
            _ => None,
        }
    }
}

/// `path`, else `./agentcost.json`, else `~/.config/agentcost/config.json`.
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let candidate = match path {
        Some(p) => Some(p.to_path_buf()),
        None => {
            let cwd = PathBuf::from("agentcost.json");
            if cwd.exists() {
                Some(cwd)
            } else {
                home_dir()
                    .map(|home| home.join(".config/agentcost/config.json"))
                    .filter(|p| p.exists())
            }
        }
    };

    let Some(path) = candidate else {
        return Ok(FileConfig::default());
    };
    debug!(path = %path.display(), "loading config");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    validate_config(&value)?;
    let cfg: FileConfig = serde_json::from_value(value)
        .with_context(|| format!("Failed to deserialize config file {}", path.display()))?;
    Ok(cfg)
}

fn validate_config(value: &Value) -> Result<()> {
    let schema_value = CONFIG_SCHEMA_JSON.get_or_try_init(|| {
        let schema_str = include_str!("../config-schema.json");
        serde_json::from_str(schema_str).context("parsing config schema")
    })?;
    let schema = CONFIG_SCHEMA.get_or_try_init(|| {
        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema_value)
            .map_err(|e| anyhow::anyhow!("compiling config schema: {e}"))
    })?;

    if let Err(errors) = schema.validate(value) {
        let mut msg = String::from("Config validation failed:\n");
        for err in errors {
            msg.push_str(&format!(" - {} at {}\n", err, err.instance_path));
        }
        anyhow::bail!(msg.trim_end().to_string());
    }
    Ok(())
}

pub fn resolve_bool(
    cli: Option<bool>,
    cmd: Option<bool>,
    defaults: Option<bool>,
    fallback: bool,
) -> bool {
    cli.or(cmd).or(defaults).unwrap_or(fallback)
}

pub fn resolve_string(
    cli: Option<&String>,
    cmd: Option<&String>,
    defaults: Option<&String>,
) -> Option<String> {
    cli.cloned()
        .or_else(|| cmd.cloned())
        .or_else(|| defaults.cloned())
}

pub fn resolve_path(
    cli: Option<&PathBuf>,
    env_var: &str,
    cmd: Option<&PathBuf>,
    defaults: Option<&PathBuf>,
) -> Option<PathBuf> {
    cli.cloned()
        .or_else(|| {
            std::env::var_os(env_var)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
        .or_else(|| cmd.cloned())
        .or_else(|| defaults.cloned())
        .map(|p| expand_tilde(&p))
}

pub fn resolve_week_start(
    cli: Option<WeekStart>,
    cmd: Option<WeekStart>,
    defaults: Option<WeekStart>,
) -> WeekStart {
    cli.or(cmd).or(defaults).unwrap_or(WeekStart::Monday)
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

pub fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}
