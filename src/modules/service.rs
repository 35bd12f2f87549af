//! Service module - Service management
//!
//! Manages systemd units. The current state is queried with
//! `systemctl is-active` and `systemctl is-enabled`, and start/stop/enable/
//! disable are only issued when the unit differs from the declared state.
//! `restarted` and `reloaded` always act and always report a change.

use async_trait::async_trait;

use super::{
    Diff, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::{shell_quote, Connection};

/// Desired state for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Started,
    Stopped,
    Restarted,
    Reloaded,
}

impl ServiceState {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "started" | "running" => Ok(ServiceState::Started),
            "stopped" => Ok(ServiceState::Stopped),
            "restarted" => Ok(ServiceState::Restarted),
            "reloaded" => Ok(ServiceState::Reloaded),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: started, stopped, restarted, reloaded",
                s
            ))),
        }
    }
}

/// Observed state of a unit
#[derive(Debug, Clone, PartialEq, Eq)]
struct UnitStatus {
    exists: bool,
    active: bool,
    enabled: bool,
}

/// Module for service management
#[derive(Debug)]
pub struct ServiceModule;

impl ServiceModule {
    async fn status(
        conn: &dyn Connection,
        context: &ModuleContext,
        service: &str,
    ) -> ModuleResult<UnitStatus> {
        let quoted = shell_quote(service);

        let load = context
            .run(conn, &format!("systemctl show -p LoadState --value {}", quoted))
            .await?;
        let exists = load.success && load.stdout.trim() != "not-found";

        let active = context
            .run(conn, &format!("systemctl is-active {}", quoted))
            .await?;
        let enabled = context
            .run(conn, &format!("systemctl is-enabled {}", quoted))
            .await?;

        Ok(UnitStatus {
            exists,
            active: active.success && active.stdout.trim() == "active",
            enabled: enabled.success
                && matches!(enabled.stdout.trim(), "enabled" | "enabled-runtime" | "alias"),
        })
    }

    async fn systemctl(
        conn: &dyn Connection,
        context: &ModuleContext,
        action: &str,
        service: &str,
    ) -> ModuleResult<()> {
        let cmd = format!("systemctl {} {}", action, shell_quote(service));
        context.run_checked(conn, &cmd).await.map_err(|e| {
            ModuleError::ExecutionFailed(format!("Failed to {} service '{}': {}", action, service, e))
        })?;
        Ok(())
    }
}

fn describe(status: &UnitStatus) -> String {
    format!(
        "{}, {}",
        if status.active { "active" } else { "inactive" },
        if status.enabled { "enabled" } else { "disabled" }
    )
}

#[async_trait]
impl Module for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["systemd"]
    }

    fn description(&self) -> &'static str {
        "Manage systemd services"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let state = params.get_string("state")?;
        if let Some(state) = &state {
            ServiceState::from_str(state)?;
        }
        if state.is_none() && params.get_bool("enabled")?.is_none() {
            return Err(ModuleError::MissingParameter(
                "one of state or enabled".to_string(),
            ));
        }
        Ok(())
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let service = params.get_string_required("name")?;
        let state = params
            .get_string("state")?
            .map(|s| ServiceState::from_str(&s))
            .transpose()?;
        let enabled = params.get_bool("enabled")?;

        let before = Self::status(conn, context, &service).await?;
        if !before.exists {
            return Err(ModuleError::ExecutionFailed(format!(
                "Could not find the requested service {}",
                service
            )));
        }

        let mut actions: Vec<&str> = Vec::new();
        match state {
            Some(ServiceState::Started) if !before.active => actions.push("start"),
            Some(ServiceState::Stopped) if before.active => actions.push("stop"),
            Some(ServiceState::Restarted) => actions.push("restart"),
            Some(ServiceState::Reloaded) => actions.push("reload"),
            _ => {}
        }
        match enabled {
            Some(true) if !before.enabled => actions.push("enable"),
            Some(false) if before.enabled => actions.push("disable"),
            _ => {}
        }

        let mut after = before.clone();
        for action in &actions {
            match *action {
                "start" | "restart" | "reload" => after.active = true,
                "stop" => after.active = false,
                "enable" => after.enabled = true,
                "disable" => after.enabled = false,
                _ => {}
            }
        }

        let data = serde_json::json!({
            "name": service,
            "state": if after.active { "started" } else { "stopped" },
            "enabled": after.enabled,
        });

        if actions.is_empty() {
            return Ok(ModuleOutput::ok(format!(
                "Service '{}' already {}",
                service,
                describe(&before)
            ))
            .with_data("status", data));
        }

        let diff = Diff::new(describe(&before), describe(&after));

        if context.check_mode {
            return Ok(ModuleOutput::changed(format!(
                "Would {} service '{}'",
                actions.join(" and "),
                service
            ))
            .with_diff(diff)
            .with_data("status", data));
        }

        for action in &actions {
            Self::systemctl(conn, context, action, &service).await?;
        }

        Ok(ModuleOutput::changed(format!(
            "Service '{}': {}",
            service,
            actions.join(", ")
        ))
        .with_diff(diff)
        .with_data("status", data))
    }
}
