use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::concat_script::DEFAULT_LAST_FRAME_DURATION;
use crate::encoder_args::{KeyedOverride, DEFAULT_ENCODER_BINARY};
use crate::indexer::TruncatedTailPolicy;

pub const CONFIG_ENV_VAR: &str = "SCREENTAPE_CONFIG";
pub const DEFAULT_CONFIG_FILE_NAME: &str = "screentape.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub encoder_binary: Option<String>,
    #[serde(default)]
    pub last_frame_duration: Option<f64>,
    #[serde(default)]
    pub truncated_tail: Option<TruncatedTailPolicy>,
    #[serde(default)]
    pub script_dir: Option<String>,
    #[serde(default)]
    pub args: ArgsFile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgsFile {
    #[serde(default)]
    pub set: Vec<ArgSetting>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgSetting {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Settings for turning a frame log into a video.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblerConfig {
    pub encoder_binary: String,
    pub last_frame_duration: f64,
    pub truncated_tail: TruncatedTailPolicy,
    /// Where concat scripts are written; the system temp dir when unset.
    pub script_dir: Option<PathBuf>,
    /// Applied on top of the default encoder arguments, before any
    /// per-call overrides.
    pub overrides: Vec<KeyedOverride>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            encoder_binary: DEFAULT_ENCODER_BINARY.to_owned(),
            last_frame_duration: DEFAULT_LAST_FRAME_DURATION,
            truncated_tail: TruncatedTailPolicy::default(),
            script_dir: None,
            overrides: Vec::new(),
        }
    }
}

/// `--config` wins, then `$SCREENTAPE_CONFIG`, then `./screentape.yaml` if it
/// exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(value));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE_NAME);
    local.exists().then_some(local)
}

pub fn load_config(explicit: Option<&Path>) -> Result<AssemblerConfig> {
    let Some(path) = resolve_config_path(explicit) else {
        return Ok(AssemblerConfig::default());
    };
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let base_dir = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    parse_config(&contents, &base_dir)
        .with_context(|| format!("invalid config {}", path.display()))
}

/// Parses YAML config text. Relative `script_dir` values resolve against
/// `base_dir`.
pub fn parse_config(contents: &str, base_dir: &Path) -> Result<AssemblerConfig> {
    let file: ConfigFile = serde_yaml::from_str(contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!("failed to parse yaml at {}: {}", location, error)
    })?;
    resolve_config(file, base_dir)
}

fn resolve_config(file: ConfigFile, base_dir: &Path) -> Result<AssemblerConfig> {
    let defaults = AssemblerConfig::default();

    let encoder_binary = match file.encoder_binary {
        Some(binary) if binary.trim().is_empty() => bail!("encoder_binary must not be empty"),
        Some(binary) => binary,
        None => defaults.encoder_binary,
    };

    let last_frame_duration = file
        .last_frame_duration
        .unwrap_or(defaults.last_frame_duration);
    if !last_frame_duration.is_finite() || last_frame_duration < 0.0 {
        bail!("last_frame_duration must be a finite number >= 0, got {last_frame_duration}");
    }

    let script_dir = file.script_dir.map(|dir| {
        let dir = PathBuf::from(dir);
        if dir.is_absolute() {
            dir
        } else {
            base_dir.join(dir)
        }
    });

    let mut overrides = Vec::with_capacity(file.args.set.len() + file.args.remove.len());
    for setting in &file.args.set {
        if setting.key.trim().is_empty() {
            bail!("args.set entries need a non-empty key");
        }
        overrides.push(KeyedOverride::set(setting.key.trim(), &setting.value));
    }
    overrides.extend(
        file.args
            .remove
            .iter()
            .map(|key| KeyedOverride::remove(key.trim())),
    );

    Ok(AssemblerConfig {
        encoder_binary,
        last_frame_duration,
        truncated_tail: file.truncated_tail.unwrap_or(defaults.truncated_tail),
        script_dir,
        overrides,
    })
}
