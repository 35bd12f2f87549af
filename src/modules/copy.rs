//! Copy module - Write exact file content to targets
//!
//! Content comes inline (`content`) or from a file on the control node
//! (`src`). The destination is only rewritten when its SHA-256 differs from
//! the declared bytes, so writing the same configuration twice reports a
//! change the first time only. Mode and ownership are converged separately.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;

use super::{
    Diff, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult,
    ModuleStatus, ParamExt,
};
use crate::connection::{shell_quote, Connection};

/// Module for copying content to a destination path
#[derive(Debug)]
pub struct CopyModule;

/// Hex-encoded SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl CopyModule {
    fn declared_content(params: &ModuleParams) -> ModuleResult<Vec<u8>> {
        if let Some(content) = params.get_string("content")? {
            return Ok(content.into_bytes());
        }
        let src = params.get_string_required("src")?;
        std::fs::read(&src).map_err(|e| {
            ModuleError::ExecutionFailed(format!("Could not read source file {}: {}", src, e))
        })
    }

    /// Owner and group of an existing path
    async fn ownership(
        conn: &dyn Connection,
        context: &ModuleContext,
        path: &str,
    ) -> ModuleResult<Option<(String, String)>> {
        let result = context
            .run(conn, &format!("stat -c '%U %G' {}", shell_quote(path)))
            .await?;
        if !result.success {
            return Ok(None);
        }
        Ok(result
            .stdout
            .trim()
            .split_once(' ')
            .map(|(u, g)| (u.to_string(), g.to_string())))
    }
}

#[async_trait]
impl Module for CopyModule {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn description(&self) -> &'static str {
        "Write exact content to a file, idempotent by content hash"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["dest"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        match (params.contains_key("content"), params.contains_key("src")) {
            (false, false) => Err(ModuleError::MissingParameter(
                "one of content or src".to_string(),
            )),
            (true, true) => Err(ModuleError::InvalidParameter(
                "content and src are mutually exclusive".to_string(),
            )),
            _ => params.get_mode("mode").map(|_| ()),
        }
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let dest = params.get_string_required("dest")?;
        let dest_path = Path::new(&dest);
        let content = Self::declared_content(params)?;
        let mode = params.get_mode("mode")?;
        let owner = params.get_string("owner")?;
        let group = params.get_string("group")?;
        let force = params.get_bool_or("force", true);

        let checksum = sha256_hex(&content);
        let stat = conn.stat(dest_path).await?;
        if matches!(stat, Some(s) if s.is_dir) {
            return Err(ModuleError::ExecutionFailed(format!(
                "Destination {} is a directory",
                dest
            )));
        }

        let existing = match stat {
            Some(_) => Some(conn.download_content(dest_path).await?),
            None => None,
        };
        let content_changed = match &existing {
            Some(current) => force && sha256_hex(current) != checksum,
            None => true,
        };

        let mut changes: Vec<String> = Vec::new();
        if content_changed {
            changes.push("content".to_string());
        }
        if let (Some(want), Some(s)) = (mode, stat) {
            if s.mode != want {
                changes.push(format!("mode {:o} -> {:o}", s.mode, want));
            }
        }
        if stat.is_some() && (owner.is_some() || group.is_some()) {
            if let Some((cur_owner, cur_group)) = Self::ownership(conn, context, &dest).await? {
                if owner.as_deref().is_some_and(|o| o != cur_owner)
                    || group.as_deref().is_some_and(|g| g != cur_group)
                {
                    changes.push("ownership".to_string());
                }
            }
        }

        let base = ModuleOutput::ok("")
            .with_data("dest", serde_json::json!(dest))
            .with_data("checksum", serde_json::json!(checksum))
            .with_data("size", serde_json::json!(content.len()));

        if changes.is_empty() {
            return Ok(ModuleOutput {
                msg: format!("{} already up to date", dest),
                ..base
            });
        }

        let diff = if context.diff_mode && content_changed {
            let before = existing
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            Some(Diff::unified(&dest, &before, &String::from_utf8_lossy(&content)))
        } else {
            None
        };

        if !context.check_mode {
            if params.get_bool_or("backup", false) && content_changed && existing.is_some() {
                let backup = format!("{}.{}.bak", dest, &checksum[..8]);
                context
                    .run_checked(
                        conn,
                        &format!("cp -p {} {}", shell_quote(&dest), shell_quote(&backup)),
                    )
                    .await?;
            }

            if content_changed {
                let mut options = context.transfer_options().with_create_dirs();
                options.mode = mode;
                options.owner = owner.clone();
                options.group = group.clone();
                conn.upload_content(&content, dest_path, Some(options))
                    .await?;
            } else {
                if let Some(mode) = mode {
                    context
                        .run_checked(conn, &format!("chmod {:o} {}", mode, shell_quote(&dest)))
                        .await?;
                }
                if owner.is_some() || group.is_some() {
                    let spec = format!(
                        "{}{}",
                        owner.as_deref().unwrap_or(""),
                        group.as_deref().map(|g| format!(":{}", g)).unwrap_or_default()
                    );
                    context
                        .run_checked(
                            conn,
                            &format!("chown {} {}", shell_quote(&spec), shell_quote(&dest)),
                        )
                        .await?;
                }
            }
        }

        let verb = if context.check_mode { "Would update" } else { "Updated" };
        let mut output = ModuleOutput {
            changed: true,
            status: ModuleStatus::Changed,
            msg: format!("{} {}: {}", verb, dest, changes.join(", ")),
            ..base
        };
        if let Some(diff) = diff {
            output = output.with_diff(diff);
        }
        Ok(output)
    }
}
