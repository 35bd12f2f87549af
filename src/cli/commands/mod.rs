//! Subcommands module for converge CLI
//!
//! This module contains all the subcommand implementations.

pub mod check;
pub mod inventory;
pub mod run;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::path::Path;

use crate::cli::output::OutputFormatter;
use converge::config::Config;
use converge::executor::ExecutorConfig;
use converge::inventory::Inventory;

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration, with CLI overrides applied
    pub config: Config,
    /// Output formatter
    pub output: OutputFormatter,
    /// Extra variables as given on the command line
    pub extra_vars: Vec<String>,
    pub verbosity: u8,
    pub check_mode: bool,
    pub diff_mode: bool,
    pub limit: Option<String>,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &crate::cli::Cli, mut config: Config) -> Self {
        if let Some(inventory) = &cli.inventory {
            config.defaults.inventory = Some(inventory.clone());
        }
        if let Some(forks) = cli.forks {
            config.defaults.forks = forks;
        }
        if let Some(timeout) = cli.timeout {
            config.defaults.timeout = timeout;
        }
        if cli.no_color {
            config.output.color = false;
        }
        if cli.diff_mode {
            config.output.diff = true;
        }

        let output = OutputFormatter::new(config.output.color, cli.verbosity());
        Self {
            output,
            extra_vars: cli.extra_vars.clone(),
            verbosity: cli.verbosity(),
            check_mode: cli.check_mode,
            diff_mode: config.output.diff,
            limit: cli.limit.clone(),
            config,
        }
    }

    /// Load the configured inventory, or an implicit localhost
    pub fn load_inventory(&self) -> Result<Inventory> {
        match self.config.inventory_path() {
            Some(path) => Inventory::load(path)
                .map_err(converge::Error::from)
                .with_context(|| format!("Failed to load inventory: {}", path.display())),
            None => {
                self.output
                    .warning("No inventory specified, only localhost is available");
                Ok(Inventory::localhost())
            }
        }
    }

    /// Parse `-e` values: `key=value`, a JSON/YAML object, or `@file`
    pub fn parse_extra_vars(&self) -> Result<IndexMap<String, JsonValue>> {
        let mut vars = IndexMap::new();

        for var in &self.extra_vars {
            if let Some(file_path) = var.strip_prefix('@') {
                let content = std::fs::read_to_string(file_path)
                    .with_context(|| format!("Failed to read extra vars file: {}", file_path))?;
                let file_vars: IndexMap<String, JsonValue> = serde_yaml::from_str(&content)
                    .with_context(|| format!("Invalid extra vars file: {}", file_path))?;
                vars.extend(file_vars);
            } else if var.trim_start().starts_with('{') {
                let object: IndexMap<String, JsonValue> =
                    serde_json::from_str(var).with_context(|| format!("Invalid JSON: {}", var))?;
                vars.extend(object);
            } else if let Some((key, value)) = var.split_once('=') {
                let parsed: JsonValue = serde_yaml::from_str(value)
                    .unwrap_or_else(|_| JsonValue::String(value.to_string()));
                vars.insert(key.to_string(), parsed);
            } else {
                bail!("Invalid extra var '{}', expected key=value, JSON or @file", var);
            }
        }

        Ok(vars)
    }

    /// Executor settings from configuration and flags
    pub fn executor_config(&self) -> Result<ExecutorConfig> {
        let mut config = ExecutorConfig::from(&self.config);
        config.check_mode = self.check_mode;
        config.diff_mode = self.diff_mode;
        config.limit = self.limit.clone();
        config.extra_vars = self.parse_extra_vars()?;
        Ok(config)
    }
}

/// Fail early when the playbook argument does not exist
pub fn ensure_playbook(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(converge::Error::playbook_parse(path, "file not found", None).into());
    }
    Ok(())
}
