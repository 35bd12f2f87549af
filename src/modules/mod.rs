//! Action plugin system for converge
//!
//! This module provides the core trait, types and registry for action plugins.
//! A plugin converges one aspect of a target (a package, a service, a file)
//! and reports whether it had to change anything to get there.
//!
//! Every plugin is idempotent: applying it twice with the same parameters on
//! a converged host reports `changed = false` the second time. In check mode
//! plugins only query state and report the change they would make.

pub mod apt;
pub mod command;
pub mod copy;
pub mod debug;
pub mod facts;
pub mod lineinfile;
pub mod service;
pub mod shell;
pub mod ufw;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::connection::{
    CommandResult, Connection, ConnectionError, ExecuteOptions, TransferOptions,
};
use crate::template::TemplateVars;

/// Errors that can occur during module execution
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Command failed with exit code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for module operations
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Status of a module execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    /// Module executed successfully and made changes
    Changed,
    /// Module executed successfully but no changes were needed
    Ok,
    /// Module execution failed
    Failed,
    /// Module did not run (commands in check mode)
    Skipped,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Changed => write!(f, "changed"),
            ModuleStatus::Ok => write!(f, "ok"),
            ModuleStatus::Failed => write!(f, "failed"),
            ModuleStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Represents a difference between current and desired state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    /// State before the change
    pub before: String,
    /// State after the change
    pub after: String,
    /// Optional detailed diff (e.g., unified diff for files)
    pub details: Option<String>,
}

impl Diff {
    pub fn new(before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            before: before.into(),
            after: after.into(),
            details: None,
        }
    }

    /// Build a unified diff between two file contents
    pub fn unified(path: &str, before: &str, after: &str) -> Self {
        let details = similar::TextDiff::from_lines(before, after)
            .unified_diff()
            .header(&format!("{} (before)", path), &format!("{} (after)", path))
            .to_string();
        Self::new(before, after).with_details(details)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Result of a module execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOutput {
    /// Whether the module changed anything
    pub changed: bool,
    /// Human-readable message about what happened
    pub msg: String,
    /// Status of the execution
    pub status: ModuleStatus,
    /// Optional diff showing what changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Diff>,
    /// Additional data returned by the module
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub data: IndexMap<String, serde_json::Value>,
    /// Standard output (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Standard error (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Return code (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
}

impl ModuleOutput {
    fn with_status(msg: impl Into<String>, status: ModuleStatus) -> Self {
        Self {
            changed: status == ModuleStatus::Changed,
            msg: msg.into(),
            status,
            diff: None,
            data: IndexMap::new(),
            stdout: None,
            stderr: None,
            rc: None,
        }
    }

    /// Create a new successful output with no changes
    pub fn ok(msg: impl Into<String>) -> Self {
        Self::with_status(msg, ModuleStatus::Ok)
    }

    /// Create a new successful output with changes
    pub fn changed(msg: impl Into<String>) -> Self {
        Self::with_status(msg, ModuleStatus::Changed)
    }

    /// Create a failed output
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::with_status(msg, ModuleStatus::Failed)
    }

    /// Create a skipped output
    pub fn skipped(msg: impl Into<String>) -> Self {
        Self::with_status(msg, ModuleStatus::Skipped)
    }

    /// Whether the module reported failure
    pub fn is_failed(&self) -> bool {
        self.status == ModuleStatus::Failed
    }

    /// Add a diff to the output
    pub fn with_diff(mut self, diff: Diff) -> Self {
        self.diff = Some(diff);
        self
    }

    /// Add data to the output
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Add facts to merge into the host's fact set
    pub fn with_facts(self, facts: serde_json::Map<String, serde_json::Value>) -> Self {
        self.with_data("ansible_facts", serde_json::Value::Object(facts))
    }

    /// Add stdout/stderr/rc from a finished command
    pub fn with_command_result(mut self, result: &CommandResult) -> Self {
        self.stdout = Some(result.stdout.clone());
        self.stderr = Some(result.stderr.clone());
        self.rc = Some(result.exit_code);
        self
    }
}

/// Parameters passed to a module
pub type ModuleParams = HashMap<String, serde_json::Value>;

/// Context for module execution
#[derive(Debug, Clone, Default)]
pub struct ModuleContext {
    /// Inventory name of the target host
    pub host: String,
    /// Whether to run in check mode (dry run)
    pub check_mode: bool,
    /// Whether to produce diffs
    pub diff_mode: bool,
    /// Whether commands run with elevated privileges
    pub r#become: bool,
    /// User to become
    pub become_user: Option<String>,
    /// Per-command timeout in seconds
    pub timeout: Option<u64>,
    /// Variables visible to the task (read-only)
    pub vars: Arc<TemplateVars>,
}

impl ModuleContext {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = check_mode;
        self
    }

    pub fn with_diff_mode(mut self, diff_mode: bool) -> Self {
        self.diff_mode = diff_mode;
        self
    }

    pub fn with_become(mut self, r#become: bool, user: Option<String>) -> Self {
        self.r#become = r#become;
        self.become_user = user;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<u64>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_vars(mut self, vars: Arc<TemplateVars>) -> Self {
        self.vars = vars;
        self
    }

    /// Execute options carrying escalation and timeout
    pub fn exec_options(&self) -> ExecuteOptions {
        let mut options = ExecuteOptions::new();
        if self.r#become {
            options = options.with_escalation(self.become_user.clone());
        }
        options.timeout = self.timeout;
        options
    }

    /// Transfer options carrying escalation
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions::new().with_escalation(self.r#become)
    }

    /// Run a command on the target with this context's options
    pub async fn run(&self, conn: &dyn Connection, command: &str) -> ModuleResult<CommandResult> {
        debug!(host = %self.host, command = %command, "Running command");
        Ok(conn.execute(command, Some(self.exec_options())).await?)
    }

    /// Run a command that must succeed
    pub async fn run_checked(
        &self,
        conn: &dyn Connection,
        command: &str,
    ) -> ModuleResult<CommandResult> {
        let result = self.run(conn, command).await?;
        if !result.success {
            return Err(ModuleError::CommandFailed {
                code: result.exit_code,
                message: format!("'{}': {}", command, result.combined_output().trim()),
            });
        }
        Ok(result)
    }
}

/// Trait that all action plugins implement
#[async_trait]
pub trait Module: Send + Sync + fmt::Debug {
    /// Returns the name of the module
    fn name(&self) -> &'static str;

    /// Other names the module answers to
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Returns a description of what the module does
    fn description(&self) -> &'static str;

    /// Returns the list of required parameters
    fn required_params(&self) -> &'static [&'static str] {
        &[]
    }

    /// Validate the parameters before execution
    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let _ = params;
        Ok(())
    }

    /// Converge the target towards the declared parameters
    async fn apply(
        &self,
        conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput>;
}

/// Helper trait for extracting parameters
pub trait ParamExt {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>>;
    fn get_string_required(&self, key: &str) -> ModuleResult<String>;
    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>>;
    fn get_bool_or(&self, key: &str, default: bool) -> bool;
    fn get_i64(&self, key: &str) -> ModuleResult<Option<i64>>;
    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>>;
    fn get_mode(&self, key: &str) -> ModuleResult<Option<u32>>;
}

impl ParamExt for ModuleParams {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>> {
        match self.get(key) {
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(v) => Ok(Some(v.to_string().trim_matches('"').to_string())),
        }
    }

    fn get_string_required(&self, key: &str) -> ModuleResult<String> {
        self.get_string(key)?
            .ok_or_else(|| ModuleError::MissingParameter(key.to_string()))
    }

    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>> {
        match self.get(key) {
            Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
            Some(serde_json::Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" => Ok(Some(false)),
                _ => Err(ModuleError::InvalidParameter(format!(
                    "{} must be a boolean",
                    key
                ))),
            },
            Some(serde_json::Value::Number(n)) => Ok(Some(n.as_i64() != Some(0))),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a boolean",
                key
            ))),
        }
    }

    fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).ok().flatten().unwrap_or(default)
    }

    fn get_i64(&self, key: &str) -> ModuleResult<Option<i64>> {
        match self.get(key) {
            Some(serde_json::Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
                ModuleError::InvalidParameter(format!("{} must be an integer", key))
            }),
            Some(serde_json::Value::String(s)) => s
                .parse()
                .map(Some)
                .map_err(|_| ModuleError::InvalidParameter(format!("{} must be an integer", key))),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be an integer",
                key
            ))),
        }
    }

    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>> {
        match self.get(key) {
            Some(serde_json::Value::Array(arr)) => Ok(Some(
                arr.iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s.clone(),
                        v => v.to_string(),
                    })
                    .collect(),
            )),
            Some(serde_json::Value::String(s)) => Ok(Some(
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a list",
                key
            ))),
        }
    }

    /// File modes are octal: `"0644"`, `"644"` and YAML `0644` (read as 644)
    /// all mean `0o644`.
    fn get_mode(&self, key: &str) -> ModuleResult<Option<u32>> {
        let raw = match self.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::Null) | None => return Ok(None),
            Some(_) => {
                return Err(ModuleError::InvalidParameter(format!(
                    "{} must be an octal mode",
                    key
                )))
            }
        };
        u32::from_str_radix(raw.trim_start_matches("0o"), 8)
            .map(Some)
            .map_err(|_| ModuleError::InvalidParameter(format!("{} '{}' is not an octal mode", key, raw)))
    }
}

/// Registry for looking up modules by name
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with all built-in modules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(Arc::new(apt::AptModule));
        registry.register(Arc::new(service::ServiceModule));
        registry.register(Arc::new(ufw::UfwModule));

        registry.register(Arc::new(lineinfile::LineinfileModule));
        registry.register(Arc::new(copy::CopyModule));

        registry.register(Arc::new(command::CommandModule));
        registry.register(Arc::new(shell::ShellModule));

        registry.register(Arc::new(facts::SetupModule));
        registry.register(Arc::new(facts::PackageFactsModule));
        registry.register(Arc::new(facts::ServiceFactsModule));

        registry.register(Arc::new(debug::DebugModule));

        registry
    }

    /// Register a module under its name and aliases
    pub fn register(&mut self, module: Arc<dyn Module>) {
        for alias in module.aliases() {
            self.modules.insert((*alias).to_string(), Arc::clone(&module));
        }
        self.modules.insert(module.name().to_string(), module);
    }

    /// Look up a module by name or alias
    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules
            .get(name)
            .or_else(|| self.modules.get(name.trim_start_matches("ansible.builtin.")))
            .cloned()
    }

    /// Check whether a module is registered
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Validate parameters and apply a module
pub async fn execute_module(
    module: &dyn Module,
    conn: &dyn Connection,
    params: &ModuleParams,
    context: &ModuleContext,
) -> ModuleResult<ModuleOutput> {
    for required in module.required_params() {
        if !params.contains_key(*required) {
            return Err(ModuleError::MissingParameter(format!(
                "{} (module {})",
                required,
                module.name()
            )));
        }
    }
    module.validate_params(params)?;
    module.apply(conn, params, context).await
}
