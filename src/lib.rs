//! # converge - Declarative Host Convergence
//!
//! converge reads a playbook of plays, each binding a host pattern from an
//! inventory to an ordered list of tasks, and drives every targeted host to
//! the declared state. Tasks are idempotent: running the same playbook twice
//! reports no changes the second time.
//!
//! ## Core Concepts
//!
//! - **Inventory**: hosts and groups from INI, YAML or JSON, with variables
//! - **Playbook**: plays, tasks, blocks and handlers parsed from YAML
//! - **Modules**: actions such as `apt`, `service`, `ufw`, `lineinfile` and `copy`
//! - **Facts**: host information gathered by `setup`, `package_facts` and `service_facts`
//! - **Handlers**: tasks run once at the end of a play when notified by a change
//! - **Connections**: local processes or the system OpenSSH client
//!
//! ## Execution Model
//!
//! ```text
//! Playbook ── play 1 ──┬── host A: facts → tasks → handlers
//!                      ├── host B: facts → tasks → handlers   (up to `forks` at once)
//!                      └── host C: ...
//!          ── play 2 ──┬── ...                                (starts when play 1 is done)
//! ```
//!
//! A host that fails or is unreachable drops out of the remaining plays; the
//! others continue unless the play sets `any_errors_fatal`.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use converge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = ModuleRegistry::with_builtins();
//!     let playbook = Playbook::load("site.yml", &registry).await?;
//!     let inventory = Arc::new(Inventory::load("hosts.ini")?);
//!     let connections = Arc::new(DefaultConnectionFactory::new(SshConfig::default()));
//!
//!     let report = Executor::new(ExecutorConfig::default(), inventory, connections)
//!         .run(&playbook)
//!         .await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::callback::{ExecutionCallback, NoopCallback};
    pub use crate::config::{Config, SshConfig};
    pub use crate::connection::{
        CommandResult, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
        DefaultConnectionFactory, ExecuteOptions, FileStat, LocalConnection, TransferOptions,
    };
    pub use crate::error::{Error, Result};
    pub use crate::executor::{
        Executor, ExecutorConfig, HostStats, PlaybookReport, TaskResult, TaskStatus,
    };
    pub use crate::inventory::{Group, Host, Inventory};
    pub use crate::modules::{Module, ModuleContext, ModuleOutput, ModuleRegistry};
    pub use crate::playbook::{Handler, Play, Playbook, Task};
    pub use crate::template::TemplateEngine;
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result aliases.
///
/// [`Error`](error::Error) aggregates the layer errors and maps each category
/// to a process exit code.
pub mod error;

/// Configuration file loading (`converge.toml`) and defaults.
pub mod config;

/// Jinja2-compatible templating and condition evaluation via minijinja.
pub mod template;

// ============================================================================
// Playbook Components
// ============================================================================

/// Playbook parsing and validation.
///
/// Actions are resolved against the module registry and handler
/// notifications are checked at load time, so a loaded playbook can run.
pub mod playbook;

/// Inventory of hosts and groups.
pub mod inventory;

// ============================================================================
// Infrastructure
// ============================================================================

/// Transports for running commands and moving files on hosts.
pub mod connection;

/// Built-in actions.
pub mod modules;

/// Play and task execution engine.
pub mod executor;

/// Hooks for observing a run as it progresses.
pub mod callback;

pub use error::{Error, Result};

/// Version of the converge library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
