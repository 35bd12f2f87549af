//! Error types for converge.
//!
//! Each layer (inventory, connection, modules, templating) has its own error
//! enum next to the code that raises it. This module aggregates them into the
//! crate-level [`Error`] used by the playbook loader and the executor.

use std::path::PathBuf;
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::inventory::InventoryError;
use crate::modules::ModuleError;
use crate::template::TemplateError;

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for converge.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Playbook Errors
    // ========================================================================
    /// Error parsing a playbook file.
    #[error("Failed to parse playbook '{path}': {message}")]
    PlaybookParse {
        /// Path to the playbook file
        path: PathBuf,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<serde_yaml::Error>,
    },

    /// Error validating playbook structure.
    #[error("Playbook validation failed: {0}")]
    PlaybookValidation(String),

    /// A task names an action that is not registered.
    #[error("Task '{task}' uses unknown action '{action}'")]
    UnknownAction {
        /// Task name
        task: String,
        /// Action name
        action: String,
    },

    /// A task notifies a handler that the play does not define.
    #[error("Task '{task}' notifies handler '{handler}' which is not defined in play '{play}'")]
    HandlerNotFound {
        /// Task name
        task: String,
        /// Handler name or listen topic
        handler: String,
        /// Play name
        play: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Task execution failed.
    #[error("Task '{task}' failed on host '{host}': {message}")]
    TaskFailed {
        /// Task name
        task: String,
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// The run finished with failed hosts.
    #[error("Playbook run failed on hosts: {}", .hosts.join(", "))]
    HostsFailed {
        /// Hosts with unrecovered failures
        hosts: Vec<String>,
    },

    /// The run finished with unreachable hosts and no task failures.
    #[error("Hosts unreachable: {}", .hosts.join(", "))]
    HostsUnreachable {
        /// Unreachable hosts
        hosts: Vec<String>,
    },

    /// The run was cancelled before all tasks were issued.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    // ========================================================================
    // Layer Errors
    // ========================================================================
    /// Inventory error.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// Connection error.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Module error.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Template error.
    #[error(transparent)]
    Template(#[from] TemplateError),

    // ========================================================================
    // Configuration and IO Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse error.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Creates a playbook parse error.
    pub fn playbook_parse(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: Option<serde_yaml::Error>,
    ) -> Self {
        Error::PlaybookParse {
            path: path.into(),
            message: message.into(),
            source,
        }
    }

    /// Creates a task failed error.
    pub fn task_failed(
        task: impl Into<String>,
        host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::TaskFailed {
            task: task.into(),
            host: host.into(),
            message: message.into(),
        }
    }

    /// Returns the process exit code for this error category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::TaskFailed { .. } | Error::HostsFailed { .. } | Error::Module(_) => 2,
            Error::HostsUnreachable { .. } | Error::Connection(_) => 3,
            Error::PlaybookParse { .. }
            | Error::PlaybookValidation(_)
            | Error::UnknownAction { .. }
            | Error::HandlerNotFound { .. }
            | Error::Template(_)
            | Error::Yaml(_) => 4,
            Error::Inventory(_) => 5,
            Error::Cancelled(_) => 130,
            _ => 1,
        }
    }
}
