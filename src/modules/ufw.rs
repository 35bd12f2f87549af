//! UFW module - Uncomplicated Firewall management
//!
//! ## Parameters
//!
//! - `rule`: Rule action (allow, deny, reject, limit)
//! - `port`: Port number or range (e.g., "22", "8000:9000")
//! - `proto`: Protocol (tcp, udp, any)
//! - `from_ip` / `to_ip`: Source and destination address or subnet
//! - `direction`: Traffic direction (in, out, incoming, outgoing, routed)
//! - `delete`: Remove the rule instead of adding it
//! - `state`: Firewall state (enabled, disabled, reloaded)
//! - `policy` (or `default`): Default policy for `direction`
//!
//! Rules are compared against `ufw show added`, which lists user rules in
//! the same command form this module builds, so an existing rule is never
//! added a second time. The firewall is only enabled when `ufw status`
//! reports it inactive.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{
    Diff, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::{shell_quote, Connection};

/// Regex for validating port specifications
static PORT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(:\d+)?$").expect("Invalid port regex"));

/// Regex for validating IP addresses (IPv4/IPv6 with optional CIDR)
static IP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(any|\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(/\d{1,2})?|[a-fA-F0-9:]+(/\d{1,3})?)$")
        .expect("Invalid IP regex")
});

/// `Default: deny (incoming), allow (outgoing), disabled (routed)`
static POLICY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\w+) \((incoming|outgoing|routed)\)").expect("Invalid policy regex")
});

/// Rule actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UfwRule {
    Allow,
    Deny,
    Reject,
    Limit,
}

impl UfwRule {
    pub fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(UfwRule::Allow),
            "deny" => Ok(UfwRule::Deny),
            "reject" => Ok(UfwRule::Reject),
            "limit" => Ok(UfwRule::Limit),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid rule '{}'. Valid rules: allow, deny, reject, limit",
                s
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UfwRule::Allow => "allow",
            UfwRule::Deny => "deny",
            UfwRule::Reject => "reject",
            UfwRule::Limit => "limit",
        }
    }
}

/// Firewall state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UfwState {
    Enabled,
    Disabled,
    Reloaded,
}

impl UfwState {
    pub fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "enabled" => Ok(UfwState::Enabled),
            "disabled" => Ok(UfwState::Disabled),
            "reloaded" => Ok(UfwState::Reloaded),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: enabled, disabled, reloaded",
                s
            ))),
        }
    }
}

/// Parsed module parameters
#[derive(Debug, Clone, Default, PartialEq)]
struct UfwConfig {
    rule: Option<UfwRule>,
    port: Option<String>,
    proto: Option<String>,
    from_ip: Option<String>,
    to_ip: Option<String>,
    direction: Option<String>,
    delete: bool,
    state: Option<UfwState>,
    policy: Option<String>,
}

impl UfwConfig {
    fn from_params(params: &ModuleParams) -> ModuleResult<Self> {
        let rule = params
            .get_string("rule")?
            .map(|r| UfwRule::from_str(&r))
            .transpose()?;
        let state = params
            .get_string("state")?
            .map(|s| UfwState::from_str(&s))
            .transpose()?;

        let port = params.get_string("port")?;
        if let Some(port) = &port {
            if !PORT_REGEX.is_match(port) {
                return Err(ModuleError::InvalidParameter(format!(
                    "Invalid port '{}'",
                    port
                )));
            }
        }

        let proto = params.get_string("proto")?.map(|p| p.to_lowercase());
        if let Some(proto) = &proto {
            if !matches!(proto.as_str(), "tcp" | "udp" | "any") {
                return Err(ModuleError::InvalidParameter(format!(
                    "Invalid proto '{}'. Valid protocols: tcp, udp, any",
                    proto
                )));
            }
        }

        let from_ip = params.get_string("from_ip")?.or(params.get_string("src")?);
        let to_ip = params.get_string("to_ip")?.or(params.get_string("dest")?);
        for ip in from_ip.iter().chain(to_ip.iter()) {
            if !IP_REGEX.is_match(ip) {
                return Err(ModuleError::InvalidParameter(format!(
                    "Invalid address '{}'",
                    ip
                )));
            }
        }

        let direction = params.get_string("direction")?.map(|d| {
            match d.to_lowercase().as_str() {
                "in" => "incoming".to_string(),
                "out" => "outgoing".to_string(),
                other => other.to_string(),
            }
        });
        let policy = params.get_string("policy")?.or(params.get_string("default")?);

        let config = Self {
            rule,
            port,
            proto,
            from_ip,
            to_ip,
            direction,
            delete: params.get_bool_or("delete", false),
            state,
            policy,
        };

        if config.rule.is_none() && config.state.is_none() && config.policy.is_none() {
            return Err(ModuleError::MissingParameter(
                "one of rule, state or policy".to_string(),
            ));
        }
        if config.rule.is_some() && config.port.is_none() && config.from_ip.is_none() {
            return Err(ModuleError::MissingParameter(
                "port or from_ip for rule".to_string(),
            ));
        }
        if config.policy.is_some() && config.direction.is_none() {
            return Err(ModuleError::MissingParameter(
                "direction for policy".to_string(),
            ));
        }
        Ok(config)
    }

    /// The rule in the canonical form `ufw show added` prints
    fn rule_spec(&self) -> Option<String> {
        let rule = self.rule?;
        let mut parts = vec!["ufw".to_string(), rule.as_str().to_string()];

        match self.direction.as_deref() {
            Some("outgoing") => parts.push("out".to_string()),
            Some("routed") => parts.insert(1, "route".to_string()),
            _ => {}
        }

        let proto = self.proto.as_deref().filter(|p| *p != "any");
        if self.from_ip.is_none() && self.to_ip.is_none() {
            if let Some(port) = &self.port {
                match proto {
                    Some(proto) => parts.push(format!("{}/{}", port, proto)),
                    None => parts.push(port.clone()),
                }
            }
        } else {
            parts.push(format!("from {}", self.from_ip.as_deref().unwrap_or("any")));
            parts.push(format!("to {}", self.to_ip.as_deref().unwrap_or("any")));
            if let Some(port) = &self.port {
                parts.push(format!("port {}", port));
            }
            if let Some(proto) = proto {
                parts.push(format!("proto {}", proto));
            }
        }
        Some(parts.join(" "))
    }
}

/// Module for UFW firewall management
#[derive(Debug)]
pub struct UfwModule;

impl UfwModule {
    async fn status(conn: &dyn Connection, context: &ModuleContext) -> ModuleResult<String> {
        let result = context
            .run_checked(conn, "ufw status verbose")
            .await
            .map_err(|e| ModuleError::ExecutionFailed(format!("ufw is not usable: {}", e)))?;
        Ok(result.stdout)
    }

    async fn added_rules(
        conn: &dyn Connection,
        context: &ModuleContext,
    ) -> ModuleResult<Vec<String>> {
        let result = context.run_checked(conn, "ufw show added").await?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("ufw "))
            .map(String::from)
            .collect())
    }
}

fn is_active(status: &str) -> bool {
    status
        .lines()
        .any(|l| l.trim().eq_ignore_ascii_case("status: active"))
}

fn current_policy(status: &str, direction: &str) -> Option<String> {
    let line = status.lines().find(|l| l.trim_start().starts_with("Default:"))?;
    POLICY_REGEX
        .captures_iter(line)
        .find(|c| &c[2] == direction)
        .map(|c| c[1].to_string())
}

#[async_trait]
impl Module for UfwModule {
    fn name(&self) -> &'static str {
        "ufw"
    }

    fn description(&self) -> &'static str {
        "Manage firewall rules with UFW"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        UfwConfig::from_params(params).map(|_| ())
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let config = UfwConfig::from_params(params)?;
        let status = Self::status(conn, context).await?;

        let mut commands: Vec<String> = Vec::new();

        if let (Some(policy), Some(direction)) = (&config.policy, &config.direction) {
            if current_policy(&status, direction).as_deref() != Some(policy.as_str()) {
                commands.push(format!(
                    "ufw default {} {}",
                    shell_quote(policy),
                    shell_quote(direction)
                ));
            }
        }

        if let Some(spec) = config.rule_spec() {
            let exists = Self::added_rules(conn, context).await?.contains(&spec);
            match (config.delete, exists) {
                (false, false) => commands.push(spec),
                (true, true) => commands.push(spec.replacen("ufw ", "ufw delete ", 1)),
                _ => {}
            }
        }

        let active = is_active(&status);
        match config.state {
            Some(UfwState::Enabled) if !active => commands.push("ufw --force enable".to_string()),
            Some(UfwState::Disabled) if active => commands.push("ufw disable".to_string()),
            Some(UfwState::Reloaded) => commands.push("ufw reload".to_string()),
            _ => {}
        }

        if commands.is_empty() {
            return Ok(ModuleOutput::ok("Firewall already in desired state"));
        }

        let diff = Diff::new("", commands.join("\n"));
        if context.check_mode {
            return Ok(ModuleOutput::changed(format!("Would run: {}", commands.join("; ")))
                .with_diff(diff));
        }

        for cmd in &commands {
            context.run_checked(conn, cmd).await.map_err(|e| {
                ModuleError::ExecutionFailed(format!("Failed to apply '{}': {}", cmd, e))
            })?;
        }

        Ok(ModuleOutput::changed(commands.join("; "))
            .with_diff(diff)
            .with_data("commands", serde_json::json!(commands)))
    }
}
