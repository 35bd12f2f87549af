//! Configuration module for converge
//!
//! Handles loading and merging configuration from multiple sources, lowest
//! precedence first:
//! - Default values
//! - System configuration (/etc/converge/config.toml)
//! - User configuration ($XDG_CONFIG_HOME/converge/config.toml)
//! - Project configuration (./converge.toml)
//! - An explicit `--config` file
//! - Environment variables
//!
//! Command-line flags are applied on top by the CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default run settings
    pub defaults: Defaults,

    /// SSH settings
    pub ssh: SshConfig,

    /// Output settings
    pub output: OutputConfig,
}

/// Default run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Default inventory path
    pub inventory: Option<PathBuf>,

    /// Maximum number of hosts converged in parallel within a play
    pub forks: usize,

    /// Per-command timeout in seconds (0 disables it)
    pub timeout: u64,

    /// Whole-run timeout in seconds; once reached no new tasks are issued
    pub run_timeout: Option<u64>,

    /// Gather facts at the start of every play unless the play says otherwise
    pub gather_facts: bool,

    /// Halt the whole run on the first unhandled host failure
    pub any_errors_fatal: bool,

    /// User to escalate to for `become`
    pub become_user: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            inventory: None,
            forks: 5,
            timeout: 300,
            run_timeout: None,
            gather_facts: true,
            any_errors_fatal: false,
            become_user: "root".to_string(),
        }
    }
}

/// SSH configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote user when the inventory does not set `ansible_user`
    pub user: Option<String>,

    /// Port when the inventory does not set `ansible_port`
    pub port: u16,

    /// Private key file
    pub private_key_file: Option<PathBuf>,

    /// Connect timeout in seconds
    pub connect_timeout: u64,

    /// Extra arguments passed to every `ssh` invocation
    pub extra_args: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            port: 22,
            private_key_file: None,
            connect_timeout: 10,
            extra_args: vec![
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                "ControlPersist=60s".to_string(),
            ],
        }
    }
}

/// Output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Colored console output
    pub color: bool,

    /// Show diffs for file changes
    pub diff: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            color: true,
            diff: false,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut merged = serde_json::to_value(Config::default())?;

        for path in Self::get_config_paths(config_path) {
            if path.exists() {
                let layer = Self::read_layer(&path)?;
                merge_values(&mut merged, layer);
            } else if Some(&path) == config_path {
                anyhow::bail!("Config file not found: {}", path.display());
            }
        }

        let mut config: Config =
            serde_json::from_value(merged).context("Invalid configuration")?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Configuration file paths, lowest precedence first
    fn get_config_paths(explicit_path: Option<&PathBuf>) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/converge/config.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("converge").join("config.toml"));
        }

        paths.push(PathBuf::from("converge.toml"));

        if let Ok(env_config) = std::env::var("CONVERGE_CONFIG") {
            paths.push(PathBuf::from(env_config));
        }

        if let Some(path) = explicit_path {
            paths.push(path.clone());
        }

        paths
    }

    /// Read one file as an untyped layer so that only keys it sets override.
    fn read_layer(path: &Path) -> Result<serde_json::Value> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let value = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            _ => {
                let table: toml::Value = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
                serde_json::to_value(table)?
            }
        };

        Ok(value)
    }

    /// Load from a specific file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut merged = serde_json::to_value(Config::default())?;
        merge_values(&mut merged, Self::read_layer(path.as_ref())?);
        Ok(serde_json::from_value(merged)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(forks) = std::env::var("CONVERGE_FORKS") {
            if let Ok(n) = forks.parse() {
                self.defaults.forks = n;
            }
        }

        if let Ok(timeout) = std::env::var("CONVERGE_TIMEOUT") {
            if let Ok(n) = timeout.parse() {
                self.defaults.timeout = n;
            }
        }

        if let Ok(path) = std::env::var("CONVERGE_INVENTORY") {
            self.defaults.inventory = Some(PathBuf::from(path));
        }

        if let Ok(user) = std::env::var("CONVERGE_REMOTE_USER") {
            self.ssh.user = Some(user);
        }

        if let Ok(flag) = std::env::var("CONVERGE_ANY_ERRORS_FATAL") {
            self.defaults.any_errors_fatal = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        if let Ok(file) = std::env::var("CONVERGE_PRIVATE_KEY_FILE") {
            self.ssh.private_key_file = Some(PathBuf::from(file));
        }

        if std::env::var("NO_COLOR").is_ok() {
            self.output.color = false;
        }
    }

    /// Get the effective inventory path
    pub fn inventory_path(&self) -> Option<&PathBuf> {
        self.defaults.inventory.as_ref()
    }

    /// Per-command timeout, `None` when disabled
    pub fn command_timeout(&self) -> Option<u64> {
        (self.defaults.timeout > 0).then_some(self.defaults.timeout)
    }
}

/// Recursively overlay `layer` onto `base`; tables merge, everything else replaces.
fn merge_values(base: &mut serde_json::Value, layer: serde_json::Value) {
    match (base, layer) {
        (serde_json::Value::Object(base), serde_json::Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
