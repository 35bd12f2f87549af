//! Apt module - Debian/Ubuntu package management
//!
//! Installs, removes and upgrades packages with APT. Installation state is
//! read with `dpkg-query` first, so only packages that actually differ from
//! the declared state are passed to `apt-get`.
//!
//! Answers to `package` as well, since the managed hosts are Debian family.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::{shell_quote, Connection};

/// Desired state for a package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AptState {
    Present,
    Absent,
    Latest,
}

impl AptState {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "present" | "installed" => Ok(AptState::Present),
            "absent" | "removed" => Ok(AptState::Absent),
            "latest" => Ok(AptState::Latest),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: present, absent, latest",
                s
            ))),
        }
    }
}

/// Module for APT package management
#[derive(Debug)]
pub struct AptModule;

impl AptModule {
    /// Installed version of a package, `None` when it is not installed
    async fn installed_version(
        conn: &dyn Connection,
        context: &ModuleContext,
        package: &str,
    ) -> ModuleResult<Option<String>> {
        let cmd = format!(
            "dpkg-query -W -f='${{Status}} ${{Version}}' {} 2>/dev/null",
            shell_quote(package)
        );
        let result = context.run(conn, &cmd).await?;
        if !result.success {
            return Ok(None);
        }
        Ok(parse_dpkg_status(&result.stdout))
    }

    async fn apt_get(
        conn: &dyn Connection,
        context: &ModuleContext,
        action: &str,
        packages: &[String],
    ) -> ModuleResult<()> {
        let pkg_list: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
        let cmd = format!(
            "DEBIAN_FRONTEND=noninteractive apt-get {} -y {}",
            action,
            pkg_list.join(" ")
        );
        context.run_checked(conn, &cmd).await.map_err(|e| {
            ModuleError::ExecutionFailed(format!("apt-get {} failed: {}", action, e))
        })?;
        Ok(())
    }

    /// Whether `apt-get` would upgrade any of the packages
    async fn has_upgrades(
        conn: &dyn Connection,
        context: &ModuleContext,
        packages: &[String],
    ) -> ModuleResult<bool> {
        let pkg_list: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
        let cmd = format!(
            "apt-get -s install --only-upgrade -y {}",
            pkg_list.join(" ")
        );
        let result = context.run(conn, &cmd).await?;
        Ok(result.stdout.lines().any(|l| l.starts_with("Inst ")))
    }
}

/// Parse `${Status} ${Version}` output; only `install ok installed` counts
fn parse_dpkg_status(output: &str) -> Option<String> {
    let output = output.trim();
    let rest = output.strip_prefix("install ok installed")?;
    Some(rest.trim().to_string())
}

#[async_trait]
impl Module for AptModule {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["package"]
    }

    fn description(&self) -> &'static str {
        "Manage packages with the APT package manager"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if !params.contains_key("name") && !params.get_bool_or("update_cache", false) {
            return Err(ModuleError::MissingParameter(
                "name (or update_cache)".to_string(),
            ));
        }
        if let Some(state) = params.get_string("state")? {
            AptState::from_str(&state)?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let packages = params.get_vec_string("name")?.unwrap_or_default();
        let state = AptState::from_str(
            &params
                .get_string("state")?
                .unwrap_or_else(|| "present".to_string()),
        )?;
        let purge = params.get_bool_or("purge", false);

        // A cache refresh is housekeeping, not a state change.
        if params.get_bool_or("update_cache", false) && !context.check_mode {
            context
                .run_checked(conn, "apt-get update")
                .await
                .map_err(|e| {
                    ModuleError::ExecutionFailed(format!("Failed to update apt cache: {}", e))
                })?;
        }

        if packages.is_empty() {
            return Ok(ModuleOutput::ok("Package cache updated"));
        }

        let mut to_install = Vec::new();
        let mut to_remove = Vec::new();
        let mut installed = Vec::new();
        let mut versions: BTreeMap<String, Option<String>> = BTreeMap::new();

        for package in &packages {
            let version = Self::installed_version(conn, context, package).await?;
            match (state, version.is_some()) {
                (AptState::Present | AptState::Latest, false) => to_install.push(package.clone()),
                (AptState::Absent, true) => to_remove.push(package.clone()),
                (AptState::Latest, true) => installed.push(package.clone()),
                _ => {}
            }
            versions.insert(package.clone(), version);
        }

        let upgradable = if state == AptState::Latest && !installed.is_empty() {
            Self::has_upgrades(conn, context, &installed).await?
        } else {
            false
        };

        let mut actions = Vec::new();
        if !to_install.is_empty() {
            actions.push(format!("install {}", to_install.join(", ")));
        }
        if upgradable {
            actions.push(format!("upgrade {}", installed.join(", ")));
        }
        if !to_remove.is_empty() {
            actions.push(format!("remove {}", to_remove.join(", ")));
        }

        if actions.is_empty() {
            return Ok(ModuleOutput::ok(format!(
                "All packages already {}: {}",
                if state == AptState::Absent {
                    "absent"
                } else {
                    "installed"
                },
                packages.join(", ")
            ))
            .with_data("packages", serde_json::json!(versions)));
        }

        if context.check_mode {
            return Ok(ModuleOutput::changed(format!("Would {}", actions.join("; "))));
        }

        if !to_install.is_empty() {
            Self::apt_get(conn, context, "install", &to_install).await?;
        }
        if upgradable {
            Self::apt_get(conn, context, "install --only-upgrade", &installed).await?;
        }
        if !to_remove.is_empty() {
            let action = if purge { "remove --purge" } else { "remove" };
            Self::apt_get(conn, context, action, &to_remove).await?;
        }

        for package in &packages {
            let version = Self::installed_version(conn, context, package).await?;
            versions.insert(package.clone(), version);
        }

        Ok(
            ModuleOutput::changed(format!("Did {}", actions.join("; ")))
                .with_data("packages", serde_json::json!(versions)),
        )
    }
}
