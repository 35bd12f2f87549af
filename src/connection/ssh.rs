//! SSH connection module
//!
//! Drives the system OpenSSH client in batch mode. Multiplexing options from
//! the configuration (`ControlMaster`/`ControlPersist`) keep repeated commands
//! to the same host on one TCP session.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::local::run_process;
use super::{
    escalate_command, shell_quote, CommandResult, Connection, ConnectionError, ConnectionResult,
    ExecuteOptions, FileStat, TransferOptions,
};
use crate::config::SshConfig;
use crate::inventory::Host;

/// Exit code OpenSSH uses for its own failures (auth, DNS, refused).
const SSH_FAILURE_CODE: i32 = 255;

/// SSH connection to a remote host
#[derive(Debug, Clone)]
pub struct SshConnection {
    identifier: String,
    destination: String,
    port: u16,
    private_key_file: Option<String>,
    connect_timeout: u64,
    extra_args: Vec<String>,
    command_timeout: Option<u64>,
}

impl SshConnection {
    /// Build a connection for `host` without contacting it
    pub fn new(host: &Host, config: &SshConfig, command_timeout: Option<u64>) -> Self {
        let user = host.user.clone().or_else(|| config.user.clone());
        let destination = match user {
            Some(user) => format!("{}@{}", user, host.address()),
            None => host.address().to_string(),
        };

        Self {
            identifier: host.name.clone(),
            destination,
            port: host.port.unwrap_or(config.port),
            private_key_file: host
                .private_key_file
                .clone()
                .or_else(|| {
                    config
                        .private_key_file
                        .as_ref()
                        .map(|p| p.to_string_lossy().to_string())
                }),
            connect_timeout: config.connect_timeout,
            extra_args: config.extra_args.clone(),
            command_timeout,
        }
    }

    /// Build a connection and verify the host answers
    pub async fn connect(
        host: &Host,
        config: &SshConfig,
        command_timeout: Option<u64>,
    ) -> ConnectionResult<Self> {
        let conn = Self::new(host, config, command_timeout);
        debug!(host = %conn.identifier, destination = %conn.destination, port = %conn.port, "Connecting via SSH");

        let probe = conn.ssh_command("true");
        let result = run_process(probe, None, Some(conn.connect_timeout + 5)).await;
        match result {
            Ok(r) if r.success => {
                info!(host = %conn.identifier, "SSH connection established");
                Ok(conn)
            }
            Ok(r) => {
                warn!(host = %conn.identifier, stderr = %r.stderr.trim(), "SSH probe failed");
                Err(ConnectionError::Unreachable(format!(
                    "{}: {}",
                    conn.destination,
                    r.stderr.trim()
                )))
            }
            Err(ConnectionError::Timeout(secs)) => Err(ConnectionError::Unreachable(format!(
                "{}: no answer within {}s",
                conn.destination, secs
            ))),
            Err(e) => Err(e),
        }
    }

    /// Arguments shared by every invocation
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.private_key_file {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn ssh_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg(&self.destination)
            .arg("--")
            .arg(remote);
        cmd
    }

    async fn run(
        &self,
        remote: &str,
        stdin: Option<&[u8]>,
        timeout: Option<u64>,
    ) -> ConnectionResult<CommandResult> {
        let timeout = timeout.or(self.command_timeout);
        let result = run_process(self.ssh_command(remote), stdin, timeout).await?;
        if result.exit_code == SSH_FAILURE_CODE && result.stderr.contains("ssh:") {
            return Err(ConnectionError::Unreachable(format!(
                "{}: {}",
                self.destination,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }

    fn transfer_command(command: String, escalate: bool) -> String {
        let opts = ExecuteOptions {
            escalate,
            ..Default::default()
        };
        escalate_command(&command, &opts)
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        matches!(self.run("true", None, Some(self.connect_timeout + 5)).await, Ok(r) if r.success)
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        let full = escalate_command(command, &options);
        debug!(host = %self.identifier, command = %full, "Executing remote command");
        self.run(&full, None, options.timeout).await
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        let target = shell_quote(&remote_path.to_string_lossy());
        debug!(host = %self.identifier, dst = %remote_path.display(), size = %content.len(), "Uploading content");

        let mut script = String::new();
        if options.create_dirs {
            if let Some(parent) = remote_path.parent() {
                script.push_str(&format!(
                    "mkdir -p {} && ",
                    shell_quote(&parent.to_string_lossy())
                ));
            }
        }
        // Write beside the target, then rename so readers never see a partial file.
        script.push_str(&format!(
            "tmp=$(mktemp {target}.XXXXXX) && cat > \"$tmp\" && \
             {{ [ -e {target} ] && chmod --reference={target} \"$tmp\" || chmod 644 \"$tmp\"; }} && \
             mv -f \"$tmp\" {target}",
            target = target
        ));
        if let Some(mode) = options.mode {
            script.push_str(&format!(" && chmod {:o} {}", mode, target));
        }
        let ownership = match (options.owner.as_deref(), options.group.as_deref()) {
            (Some(o), Some(g)) => Some(format!("{}:{}", o, g)),
            (Some(o), None) => Some(o.to_string()),
            (None, Some(g)) => Some(format!(":{}", g)),
            (None, None) => None,
        };
        if let Some(ownership) = ownership {
            script.push_str(&format!(" && chown {} {}", shell_quote(&ownership), target));
        }

        let command = Self::transfer_command(script, options.escalate);
        let result = self.run(&command, Some(content), None).await?;
        if !result.success {
            return Err(ConnectionError::TransferFailed(format!(
                "Failed to write {}: {}",
                remote_path.display(),
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        let command = format!("cat {}", shell_quote(&remote_path.to_string_lossy()));
        let result = self.run(&command, None, None).await?;
        if !result.success {
            return Err(ConnectionError::TransferFailed(format!(
                "Failed to read {}: {}",
                remote_path.display(),
                result.stderr.trim()
            )));
        }
        Ok(result.stdout.into_bytes())
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let command = format!("test -e {}", shell_quote(&path.to_string_lossy()));
        Ok(self.run(&command, None, None).await?.success)
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<Option<FileStat>> {
        let command = format!(
            "stat -c '%s %a %F' {} 2>/dev/null || true",
            shell_quote(&path.to_string_lossy())
        );
        let result = self.run(&command, None, None).await?;
        Ok(parse_stat_output(&result.stdout))
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

/// Parse `stat -c '%s %a %F'` output; empty output means the path is missing
fn parse_stat_output(output: &str) -> Option<FileStat> {
    let mut parts = output.trim().splitn(3, ' ');
    let size = parts.next()?.parse().ok()?;
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    let kind = parts.next().unwrap_or("");
    Some(FileStat {
        size,
        mode,
        is_dir: kind == "directory",
    })
}
