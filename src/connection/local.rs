//! Local connection module
//!
//! Runs commands and file operations on the control node itself. Hosts with
//! `ansible_connection=local` (and `localhost`) are converged through this.

use async_trait::async_trait;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{
    escalate_command, shell_quote, CommandResult, Connection, ConnectionError, ConnectionResult,
    ExecuteOptions, FileStat, TransferOptions,
};

/// Local connection for executing commands on the current host
#[derive(Debug, Clone)]
pub struct LocalConnection {
    identifier: String,
}

impl LocalConnection {
    /// Create a new local connection
    pub fn new() -> Self {
        let identifier = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self { identifier }
    }

    /// Create a local connection with a custom identifier
    pub fn with_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    fn is_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    /// Write through `sudo` when the file needs privileges we lack.
    async fn write_escalated(
        &self,
        content: &[u8],
        path: &Path,
        options: &TransferOptions,
    ) -> ConnectionResult<()> {
        let target = shell_quote(&path.to_string_lossy());
        let mut script = String::new();
        if options.create_dirs {
            if let Some(parent) = path.parent() {
                script.push_str(&format!(
                    "mkdir -p {} && ",
                    shell_quote(&parent.to_string_lossy())
                ));
            }
        }
        script.push_str(&format!("cat > {}", target));

        let mut cmd = Command::new("sudo");
        cmd.arg("-n").arg("sh").arg("-c").arg(&script);
        let result = run_process(cmd, Some(content), None).await?;
        if !result.success {
            return Err(ConnectionError::TransferFailed(format!(
                "Failed to write {}: {}",
                path.display(),
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    fn write_atomic(&self, content: &[u8], path: &Path, create_dirs: bool) -> ConnectionResult<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if create_dirs {
            fs::create_dir_all(parent).map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to create temp file in {}: {}",
                parent.display(),
                e
            ))
        })?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;

        // Keep the existing file's permissions unless told otherwise.
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(tmp.path(), meta.permissions())?;
        } else {
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))?;
        }

        tmp.persist(path).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to write to {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(())
    }

    async fn apply_attributes(&self, path: &Path, options: &TransferOptions) -> ConnectionResult<()> {
        let quoted = shell_quote(&path.to_string_lossy());
        let mut commands = Vec::new();

        if let Some(mode) = options.mode {
            if options.escalate && !Self::is_root() {
                commands.push(format!("chmod {:o} {}", mode, quoted));
            } else {
                fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
                    ConnectionError::TransferFailed(format!(
                        "Failed to set permissions on {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
        }

        let ownership = match (options.owner.as_deref(), options.group.as_deref()) {
            (Some(o), Some(g)) => Some(format!("{}:{}", o, g)),
            (Some(o), None) => Some(o.to_string()),
            (None, Some(g)) => Some(format!(":{}", g)),
            (None, None) => None,
        };
        if let Some(ownership) = ownership {
            commands.push(format!("chown {} {}", shell_quote(&ownership), quoted));
        }

        for command in commands {
            let opts = ExecuteOptions {
                escalate: options.escalate && !Self::is_root(),
                ..Default::default()
            };
            let result = self.execute(&command, Some(opts)).await?;
            if !result.success {
                return Err(ConnectionError::TransferFailed(format!(
                    "'{}' failed: {}",
                    command,
                    result.stderr.trim()
                )));
            }
        }
        Ok(())
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a prepared process, optionally feeding stdin, with an optional timeout.
pub(crate) async fn run_process(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout_secs: Option<u64>,
) -> ConnectionResult<CommandResult> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to write stdin: {}", e))
        })?;
        drop(pipe);
    }

    let wait = child.wait_with_output();
    let output = match timeout_secs {
        Some(secs) => tokio::time::timeout(std::time::Duration::from_secs(secs), wait)
            .await
            .map_err(|_| ConnectionError::Timeout(secs))?,
        None => wait.await,
    }
    .map_err(|e| ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e)))?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    trace!(exit_code = %exit_code, stdout_len = %stdout.len(), stderr_len = %stderr.len(), "Command completed");

    Ok(CommandResult::new(exit_code, stdout, stderr))
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        // Already root: sudo would only add a dependency on its presence.
        let options = if options.escalate
            && Self::is_root()
            && options.escalate_user.as_deref().unwrap_or("root") == "root"
        {
            ExecuteOptions {
                escalate: false,
                ..options
            }
        } else {
            options
        };
        let full = escalate_command(command, &options);
        debug!(command = %full, "Executing local command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&full);
        run_process(cmd, None, options.timeout).await
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        debug!(dst = %remote_path.display(), size = %content.len(), "Writing content locally");

        if options.escalate && !Self::is_root() {
            self.write_escalated(content, remote_path, &options).await?;
        } else {
            self.write_atomic(content, remote_path, options.create_dirs)?;
        }

        self.apply_attributes(remote_path, &options).await
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        debug!(src = %remote_path.display(), "Reading file content locally");

        fs::read(remote_path).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to read {}: {}",
                remote_path.display(),
                e
            ))
        })
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        Ok(path.exists())
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<Option<FileStat>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(FileStat {
                size: metadata.len(),
                mode: metadata.mode() & 0o7777,
                is_dir: metadata.is_dir(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConnectionError::IoError(e)),
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}
