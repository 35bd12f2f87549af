//! Host definition for the converge inventory.
//!
//! A `Host` is one managed node: its inventory name, how to reach it, its own
//! variables and the groups it belongs to.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use super::{InventoryError, InventoryResult};

/// Transport used to reach a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// SSH connection (default)
    #[default]
    Ssh,
    /// Run on the control node
    Local,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::Ssh => write!(f, "ssh"),
            ConnectionKind::Local => write!(f, "local"),
        }
    }
}

/// A managed host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Inventory hostname (the name used in patterns and `inventory_hostname`)
    pub name: String,

    /// Address to connect to (`ansible_host`), defaults to the name
    pub address: Option<String>,

    /// SSH port (`ansible_port`)
    pub port: Option<u16>,

    /// Remote user (`ansible_user`)
    pub user: Option<String>,

    /// Private key (`ansible_ssh_private_key_file`)
    pub private_key_file: Option<String>,

    /// Transport (`ansible_connection`)
    pub connection: ConnectionKind,

    /// Forced privilege escalation (`ansible_become`)
    pub r#become: Option<bool>,

    /// Host variables, including the connection variables above
    pub vars: IndexMap<String, serde_json::Value>,

    /// Groups this host belongs to
    pub groups: IndexSet<String>,
}

impl Host {
    /// Create a new host. `localhost` and loopback addresses use a local connection.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let connection = if matches!(name.as_str(), "localhost" | "127.0.0.1" | "::1") {
            ConnectionKind::Local
        } else {
            ConnectionKind::Ssh
        };

        Self {
            name,
            address: None,
            port: None,
            user: None,
            private_key_file: None,
            connection,
            r#become: None,
            vars: IndexMap::new(),
            groups: IndexSet::new(),
        }
    }

    /// Parse an INI host line: `name key=value key2="quoted value"`
    pub fn parse(line: &str) -> InventoryResult<Self> {
        let words = shell_words::split(line)
            .map_err(|e| InventoryError::Parse(format!("invalid host line '{}': {}", line, e)))?;

        let mut words = words.into_iter();
        let name = words
            .next()
            .ok_or_else(|| InventoryError::Parse(format!("empty host line '{}'", line)))?;

        let mut host = Host::new(name);
        for word in words {
            let (key, value) = word.split_once('=').ok_or_else(|| {
                InventoryError::Parse(format!(
                    "expected key=value for host '{}', got '{}'",
                    host.name, word
                ))
            })?;
            host.set_var(key, parse_scalar(value));
        }

        Ok(host)
    }

    /// Set a variable, updating connection parameters for the `ansible_*` keys
    pub fn set_var(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        match key.as_str() {
            "ansible_host" => self.address = value_as_string(&value),
            "ansible_port" => {
                self.port = value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .and_then(|p| u16::try_from(p).ok());
            }
            "ansible_user" | "ansible_ssh_user" => self.user = value_as_string(&value),
            "ansible_ssh_private_key_file" => self.private_key_file = value_as_string(&value),
            "ansible_connection" => {
                self.connection = match value.as_str() {
                    Some("local") => ConnectionKind::Local,
                    _ => ConnectionKind::Ssh,
                };
            }
            "ansible_become" => {
                self.r#become = value
                    .as_bool()
                    .or_else(|| value.as_str().map(|s| matches!(s, "true" | "yes" | "1")));
            }
            _ => {}
        }
        self.vars.insert(key, value);
    }

    /// Address used for connecting
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Add the host to a group
    pub fn add_to_group(&mut self, group: impl Into<String>) {
        self.groups.insert(group.into());
    }

    /// Check if the host is in a group
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Merge variables from another definition of the same host
    pub fn merge_vars(&mut self, vars: &IndexMap<String, serde_json::Value>) {
        for (key, value) in vars {
            self.set_var(key.clone(), value.clone());
        }
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn value_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Interpret an INI value: quoted strings, booleans, integers, else string
pub(crate) fn parse_scalar(value: &str) -> serde_json::Value {
    let value = value.trim();

    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        return serde_json::Value::String(value[1..value.len() - 1].to_string());
    }

    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" => return serde_json::Value::Bool(true),
        "false" | "no" | "off" => return serde_json::Value::Bool(false),
        _ => {}
    }

    if let Ok(n) = value.parse::<i64>() {
        return serde_json::Value::from(n);
    }

    serde_json::Value::String(value.to_string())
}
