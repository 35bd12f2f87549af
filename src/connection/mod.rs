//! Connection layer for target host communication.
//!
//! Action plugins never talk to a transport directly. They go through the
//! [`Connection`] trait, so the same plugin converges a host reached over SSH,
//! the control node itself, or an in-memory simulated host in tests.
//!
//! # Supported Transports
//!
//! - **Local**: direct execution on the control node via `sh -c`
//! - **SSH**: the system OpenSSH client in batch mode
//!
//! The executor obtains connections from a [`ConnectionFactory`], which picks
//! the transport from the host's inventory variables.
//!
//! # Example
//!
//! ```rust,ignore
//! use converge::connection::{ExecuteOptions, LocalConnection};
//!
//! let conn = LocalConnection::new();
//! let opts = ExecuteOptions::new().with_escalation(Some("root".into()));
//! let result = conn.execute("systemctl is-active nginx", Some(opts)).await?;
//! println!("active: {}", result.success);
//! ```

/// Local execution connection implementation.
pub mod local;

/// SSH connection implementation driving the OpenSSH client.
pub mod ssh;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::SshConfig;
use crate::inventory::{ConnectionKind, Host};

pub use local::LocalConnection;
pub use ssh::SshConnection;

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish initial connection to the host.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The host could not be reached at all.
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// Command execution failed (not to be confused with non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File upload or download operation failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConnectionError {
    /// Whether the error means the host itself is gone, as opposed to a
    /// single failed operation.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Unreachable(_) | ConnectionError::ConnectionFailed(_)
        )
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// The result of executing a command on a connection.
///
/// ```rust
/// use converge::connection::CommandResult;
///
/// let result = CommandResult::success("active".into(), String::new());
/// assert!(result.success);
///
/// let failed = CommandResult::failure(3, "inactive".into(), String::new());
/// assert_eq!(failed.exit_code, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit code of the command (0 typically indicates success).
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Convenience flag: `true` if `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Create a result from a raw exit code
    pub fn new(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: exit_code == 0,
        }
    }

    /// Create a new successful command result
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    /// Create a new failed command result
    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }

    /// Get the combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Options for command execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Working directory for the command
    pub cwd: Option<String>,
    /// Environment variables to set
    pub env: HashMap<String, String>,
    /// Timeout in seconds (None for no timeout)
    pub timeout: Option<u64>,
    /// Run command with privilege escalation
    pub escalate: bool,
    /// User to escalate to (default: root)
    pub escalate_user: Option<String>,
}

impl ExecuteOptions {
    /// Create new execute options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable privilege escalation
    pub fn with_escalation(mut self, user: Option<String>) -> Self {
        self.escalate = true;
        self.escalate_user = user;
        self
    }
}

/// Options for file transfer
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// File mode (permissions) to set
    pub mode: Option<u32>,
    /// Owner to set
    pub owner: Option<String>,
    /// Group to set
    pub group: Option<String>,
    /// Create parent directories if they don't exist
    pub create_dirs: bool,
    /// Write with privilege escalation
    pub escalate: bool,
}

impl TransferOptions {
    /// Create new transfer options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set file mode
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set owner
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Enable directory creation
    pub fn with_create_dirs(mut self) -> Self {
        self.create_dirs = true;
        self
    }

    /// Write through privilege escalation
    pub fn with_escalation(mut self, escalate: bool) -> Self {
        self.escalate = escalate;
        self
    }
}

/// File statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,
    /// Permission bits (e.g. `0o644`)
    pub mode: u32,
    /// Is this a directory?
    pub is_dir: bool,
}

/// The main connection trait that all transport implementations must implement
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    /// Get the connection identifier (hostname or address)
    fn identifier(&self) -> &str;

    /// Check if the connection is still alive
    async fn is_alive(&self) -> bool;

    /// Execute a command on the target host
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Write content to a file on the target host
    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Read a file from the target host
    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>>;

    /// Check if a path exists on the target host
    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool>;

    /// Get file stats, or `None` if the path does not exist
    async fn stat(&self, path: &Path) -> ConnectionResult<Option<FileStat>>;

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;
}

/// Produces connections for inventory hosts.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to the given host.
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>>;
}

/// Picks local or SSH transport from the host's connection variables.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnectionFactory {
    ssh: SshConfig,
    command_timeout: Option<u64>,
}

impl DefaultConnectionFactory {
    /// Create a factory using the given SSH defaults
    pub fn new(ssh: SshConfig) -> Self {
        Self {
            ssh,
            command_timeout: None,
        }
    }

    /// Timeout applied to the connectivity probe
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.command_timeout = Some(secs);
        self
    }
}

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        match host.connection {
            ConnectionKind::Local => Ok(Arc::new(LocalConnection::new())),
            ConnectionKind::Ssh => {
                let conn = SshConnection::connect(host, &self.ssh, self.command_timeout).await?;
                Ok(Arc::new(conn))
            }
        }
    }
}

/// Quote a string for safe inclusion in a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    shell_words::quote(s).into_owned()
}

/// Wrap a command for privilege escalation with `sudo`.
pub(crate) fn escalate_command(command: &str, options: &ExecuteOptions) -> String {
    let mut cmd = String::new();

    if let Some(cwd) = &options.cwd {
        cmd.push_str(&format!("cd {} && ", shell_quote(cwd)));
    }
    for (key, value) in &options.env {
        cmd.push_str(&format!("{}={} ", key, shell_quote(value)));
    }
    cmd.push_str(command);

    if options.escalate {
        let user = options.escalate_user.as_deref().unwrap_or("root");
        format!("sudo -n -H -u {} sh -c {}", shell_quote(user), shell_quote(&cmd))
    } else {
        cmd
    }
}
