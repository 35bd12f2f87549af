//! Inventory management for converge.
//!
//! The inventory maps logical host groups (`ubu1`, `webservers`, `all`) to the
//! concrete hosts a play targets. It supports:
//! - Loading from YAML, INI and JSON formats
//! - Host pattern matching (unions, intersections, exclusions, globs)
//! - Group hierarchy and variable inheritance
//!
//! An inventory is resolved once per run and shared read-only between the
//! concurrently running hosts.

pub mod group;
pub mod host;

pub use group::Group;
pub use host::{ConnectionKind, Host};

use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use host::parse_scalar;

/// Errors that can occur during inventory operations
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("inventory file not found: {0}")]
    NotFound(PathBuf),

    #[error("inventory parse error: {0}")]
    Parse(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("invalid host pattern: {0}")]
    InvalidPattern(String),
}

/// Result type for inventory operations
pub type InventoryResult<T> = Result<T, InventoryError>;

/// The main inventory structure holding all hosts and groups
#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: IndexMap<String, Host>,
    groups: IndexMap<String, Group>,
    source: Option<PathBuf>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    /// Create a new empty inventory with the implicit groups
    pub fn new() -> Self {
        let mut groups = IndexMap::new();
        groups.insert("all".to_string(), Group::new("all"));
        groups.insert("ungrouped".to_string(), Group::new("ungrouped"));

        Self {
            hosts: IndexMap::new(),
            groups,
            source: None,
        }
    }

    /// Inventory containing only `localhost` over a local connection
    pub fn localhost() -> Self {
        let mut inventory = Self::new();
        inventory.add_host(Host::new("localhost"));
        inventory
    }

    /// Load an inventory file, detecting the format from the extension or content
    pub fn load<P: AsRef<Path>>(path: P) -> InventoryResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(InventoryError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let mut inventory = match extension {
            "yml" | "yaml" => Self::from_yaml_str(&content)?,
            "json" => Self::from_json_str(&content)?,
            "ini" | "cfg" => Self::from_ini_str(&content)?,
            _ => match serde_yaml::from_str::<serde_json::Value>(&content) {
                Ok(serde_json::Value::Object(_)) => Self::from_yaml_str(&content)?,
                _ => Self::from_ini_str(&content)?,
            },
        };

        inventory.source = Some(path.to_path_buf());
        debug!(
            path = %path.display(),
            hosts = inventory.host_count(),
            groups = inventory.groups.len(),
            "Loaded inventory"
        );
        Ok(inventory)
    }

    /// Parse a YAML inventory (`all: {hosts, children, vars}` or flat groups)
    pub fn from_yaml_str(content: &str) -> InventoryResult<Self> {
        let data: serde_json::Value = serde_yaml::from_str(content)?;
        Self::from_structured(data)
    }

    /// Parse a JSON inventory (same shape as YAML, plus `_meta.hostvars`)
    pub fn from_json_str(content: &str) -> InventoryResult<Self> {
        let data: serde_json::Value = serde_json::from_str(content)?;
        Self::from_structured(data)
    }

    fn from_structured(data: serde_json::Value) -> InventoryResult<Self> {
        let mut inventory = Self::new();

        let serde_json::Value::Object(mut map) = data else {
            return Err(InventoryError::Parse(
                "inventory root must be a mapping of groups".to_string(),
            ));
        };

        let meta = map.remove("_meta");

        if let Some(all) = map.get("all") {
            inventory.parse_group("all", all)?;
            for (name, value) in &map {
                if name != "all" {
                    inventory.parse_group(name, value)?;
                }
            }
        } else {
            for (name, value) in &map {
                inventory.parse_group(name, value)?;
            }
        }

        if let Some(hostvars) = meta
            .as_ref()
            .and_then(|m| m.get("hostvars"))
            .and_then(|h| h.as_object())
        {
            for (host_name, vars) in hostvars {
                if let (Some(host), Some(vars)) = (inventory.hosts.get_mut(host_name), vars.as_object()) {
                    for (key, value) in vars {
                        host.set_var(key.clone(), value.clone());
                    }
                }
            }
        }

        inventory.finalize();
        Ok(inventory)
    }

    fn parse_group(&mut self, name: &str, value: &serde_json::Value) -> InventoryResult<()> {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name));

        let serde_json::Value::Object(map) = value else {
            // `group:` with no body is an empty group
            return if value.is_null() {
                Ok(())
            } else {
                Err(InventoryError::Parse(format!(
                    "group '{}' must be a mapping",
                    name
                )))
            };
        };

        match map.get("hosts") {
            Some(serde_json::Value::Object(hosts)) => {
                for (host_name, host_vars) in hosts {
                    let vars = host_vars.as_object().cloned().unwrap_or_default();
                    self.declare_host(name, host_name, vars.into_iter());
                }
            }
            Some(serde_json::Value::Array(hosts)) => {
                for host_name in hosts.iter().filter_map(|h| h.as_str()) {
                    self.declare_host(name, host_name, std::iter::empty());
                }
            }
            Some(serde_json::Value::Null) | None => {}
            Some(_) => {
                return Err(InventoryError::Parse(format!(
                    "hosts of group '{}' must be a mapping or a list",
                    name
                )))
            }
        }

        if let Some(serde_json::Value::Object(children)) = map.get("children") {
            for (child_name, child_value) in children {
                if let Some(group) = self.groups.get_mut(name) {
                    group.add_child(child_name.clone());
                }
                self.parse_group(child_name, child_value)?;
            }
        }

        if let Some(serde_json::Value::Object(vars)) = map.get("vars") {
            if let Some(group) = self.groups.get_mut(name) {
                for (key, value) in vars {
                    group.set_var(key.clone(), value.clone());
                }
            }
        }

        Ok(())
    }

    fn declare_host(
        &mut self,
        group: &str,
        host_name: &str,
        vars: impl Iterator<Item = (String, serde_json::Value)>,
    ) {
        let host = self
            .hosts
            .entry(host_name.to_string())
            .or_insert_with(|| Host::new(host_name));
        for (key, value) in vars {
            host.set_var(key, value);
        }
        host.add_to_group(group);

        if let Some(g) = self.groups.get_mut(group) {
            g.add_host(host_name);
        }
    }

    /// Parse an INI inventory
    pub fn from_ini_str(content: &str) -> InventoryResult<Self> {
        let mut inventory = Self::new();
        let mut current_group = "ungrouped".to_string();
        let mut is_vars_section = false;
        let mut is_children_section = false;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let section = &line[1..line.len() - 1];

                match section.rsplit_once(':') {
                    Some((group_name, "vars")) => {
                        current_group = group_name.to_string();
                        is_vars_section = true;
                        is_children_section = false;
                    }
                    Some((group_name, "children")) => {
                        current_group = group_name.to_string();
                        is_vars_section = false;
                        is_children_section = true;
                    }
                    _ => {
                        current_group = section.to_string();
                        is_vars_section = false;
                        is_children_section = false;
                    }
                }

                inventory
                    .groups
                    .entry(current_group.clone())
                    .or_insert_with(|| Group::new(&current_group));
                continue;
            }

            if is_vars_section {
                let (key, value) = line.split_once('=').ok_or_else(|| {
                    InventoryError::Parse(format!(
                        "line {}: expected key=value in [{}:vars]",
                        lineno + 1,
                        current_group
                    ))
                })?;
                if let Some(group) = inventory.groups.get_mut(&current_group) {
                    group.set_var(key.trim(), parse_scalar(value));
                }
            } else if is_children_section {
                if let Some(group) = inventory.groups.get_mut(&current_group) {
                    group.add_child(line);
                }
                inventory
                    .groups
                    .entry(line.to_string())
                    .or_insert_with(|| Group::new(line));
            } else {
                let parsed = Host::parse(line)?;
                let name = parsed.name.clone();
                inventory.declare_host(&current_group, &name, parsed.vars.into_iter());
            }
        }

        inventory.finalize();
        Ok(inventory)
    }

    /// Compute parents, `all` membership and `ungrouped`
    fn finalize(&mut self) {
        let edges: Vec<(String, String)> = self
            .groups
            .values()
            .flat_map(|g| g.children.iter().map(move |c| (g.name.clone(), c.clone())))
            .collect();
        for (parent, child) in edges {
            if let Some(group) = self.groups.get_mut(&child) {
                group.add_parent(parent);
            }
        }

        // Group membership through child groups, e.g. a host in `ubu1` under `web`.
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for group_name in names {
            if let Some(group) = self.groups.get(&group_name) {
                let members: Vec<String> = self
                    .hosts_in_group(group)
                    .into_iter()
                    .map(|h| h.to_string())
                    .collect();
                for member in members {
                    if let Some(host) = self.hosts.get_mut(&member) {
                        host.add_to_group(group_name.clone());
                    }
                }
            }
        }

        let host_names: Vec<String> = self.hosts.keys().cloned().collect();
        for name in host_names {
            let ungrouped = self
                .hosts
                .get(&name)
                .map(|h| h.groups.iter().all(|g| g == "all" || g == "ungrouped"))
                .unwrap_or(false);

            if let Some(host) = self.hosts.get_mut(&name) {
                host.add_to_group("all");
                if ungrouped {
                    host.add_to_group("ungrouped");
                }
            }
            if let Some(all) = self.groups.get_mut("all") {
                all.add_host(name.clone());
            }
            if ungrouped {
                if let Some(g) = self.groups.get_mut("ungrouped") {
                    g.add_host(name.clone());
                }
            }
        }
    }

    /// Add a host to the inventory
    pub fn add_host(&mut self, mut host: Host) {
        let name = host.name.clone();
        if host.groups.is_empty() {
            host.add_to_group("ungrouped");
        }
        host.add_to_group("all");

        for group in host.groups.clone() {
            self.groups
                .entry(group.clone())
                .or_insert_with(|| Group::new(&group))
                .add_host(name.clone());
        }

        self.hosts.insert(name, host);
    }

    /// Add a group to the inventory, replacing any group with the same name
    pub fn add_group(&mut self, group: Group) {
        for host_name in &group.hosts {
            if let Some(host) = self.hosts.get_mut(host_name) {
                host.add_to_group(group.name.clone());
            }
        }
        self.groups.insert(group.name.clone(), group);
    }

    /// Get a host by name
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Get a group by name
    pub fn get_group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// All hosts in inventory order
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// All groups
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Count total hosts
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Where the inventory was loaded from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Resolve a host pattern to hosts in inventory order.
    ///
    /// Supported patterns:
    /// - `all` or `*` - all hosts
    /// - `hostname` or `groupname`
    /// - `a:b` or `a,b` - union
    /// - `a:&b` - intersection
    /// - `a:!b` - exclusion
    /// - `web*` - glob over host and group names
    /// - `~regex` - regex over host names
    pub fn hosts_for_pattern(&self, pattern: &str) -> InventoryResult<Vec<&Host>> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(InventoryError::InvalidPattern(
                "empty host pattern".to_string(),
            ));
        }

        let mut union: IndexSet<&str> = IndexSet::new();
        let mut intersections: Vec<HashSet<&str>> = Vec::new();
        let mut exclusions: HashSet<&str> = HashSet::new();

        for part in pattern.split([':', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(sub) = part.strip_prefix('&') {
                intersections.push(self.match_atom(sub)?.into_iter().collect());
            } else if let Some(sub) = part.strip_prefix('!') {
                exclusions.extend(self.match_atom(sub)?);
            } else {
                union.extend(self.match_atom(part)?);
            }
        }

        Ok(self
            .hosts
            .values()
            .filter(|h| union.contains(h.name.as_str()))
            .filter(|h| intersections.iter().all(|set| set.contains(h.name.as_str())))
            .filter(|h| !exclusions.contains(h.name.as_str()))
            .collect())
    }

    fn match_atom(&self, atom: &str) -> InventoryResult<Vec<&str>> {
        if atom == "all" || atom == "*" {
            return Ok(self.hosts.keys().map(String::as_str).collect());
        }

        if let Some(expr) = atom.strip_prefix('~') {
            let regex =
                Regex::new(expr).map_err(|_| InventoryError::InvalidPattern(atom.to_string()))?;
            return Ok(self
                .hosts
                .keys()
                .filter(|name| regex.is_match(name))
                .map(String::as_str)
                .collect());
        }

        if atom.contains(['*', '?', '[']) {
            let matcher = globset::Glob::new(atom)
                .map_err(|_| InventoryError::InvalidPattern(atom.to_string()))?
                .compile_matcher();
            let mut names: Vec<&str> = Vec::new();
            for group in self.groups.values().filter(|g| matcher.is_match(&g.name)) {
                names.extend(self.hosts_in_group(group));
            }
            names.extend(
                self.hosts
                    .keys()
                    .filter(|name| matcher.is_match(name.as_str()))
                    .map(String::as_str),
            );
            return Ok(names);
        }

        if let Some(group) = self.groups.get(atom) {
            return Ok(self.hosts_in_group(group));
        }

        if let Some((name, _)) = self.hosts.get_key_value(atom) {
            return Ok(vec![name.as_str()]);
        }

        warn!(pattern = %atom, "Could not match supplied host pattern");
        Ok(Vec::new())
    }

    /// Hosts in a group, including hosts of child groups
    fn hosts_in_group<'a>(&'a self, group: &'a Group) -> Vec<&'a str> {
        let mut seen: IndexSet<&str> = IndexSet::new();
        let mut visited: HashSet<&str> = HashSet::new();
        self.collect_group_hosts(group, &mut seen, &mut visited);
        seen.into_iter().collect()
    }

    fn collect_group_hosts<'a>(
        &'a self,
        group: &'a Group,
        out: &mut IndexSet<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) {
        if !visited.insert(group.name.as_str()) {
            return;
        }
        out.extend(group.hosts.iter().map(String::as_str));
        for child in &group.children {
            if let Some(child) = self.groups.get(child) {
                self.collect_group_hosts(child, out, visited);
            }
        }
    }

    /// Depth of a group below `all`, used for variable precedence
    fn group_depth(&self, name: &str, visiting: &mut HashSet<String>) -> usize {
        if name == "all" || !visiting.insert(name.to_string()) {
            return 0;
        }
        let depth = self
            .groups
            .get(name)
            .map(|g| {
                g.parents
                    .iter()
                    .map(|p| self.group_depth(p, visiting))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        visiting.remove(name);
        depth + 1
    }

    /// Effective variables for a host: `all` vars, then groups from shallow
    /// to deep (ties by name), then the host's own vars.
    pub fn host_vars(&self, host: &Host) -> IndexMap<String, serde_json::Value> {
        let mut ordered: Vec<(usize, &str)> = host
            .groups
            .iter()
            .map(|g| (self.group_depth(g, &mut HashSet::new()), g.as_str()))
            .collect();
        ordered.sort();

        let mut vars = IndexMap::new();
        for (_, group_name) in ordered {
            if let Some(group) = self.groups.get(group_name) {
                for (key, value) in &group.vars {
                    vars.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in &host.vars {
            vars.insert(key.clone(), value.clone());
        }
        vars
    }

    /// Groups of a host, excluding `all` and `ungrouped`, sorted by name
    pub fn group_names(&self, host: &Host) -> Vec<String> {
        let mut names: Vec<String> = host
            .groups
            .iter()
            .filter(|g| g.as_str() != "all" && g.as_str() != "ungrouped")
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Every group with its hosts (the `groups` template variable)
    pub fn groups_map(&self) -> IndexMap<String, Vec<String>> {
        self.groups
            .values()
            .map(|g| {
                (
                    g.name.clone(),
                    self.hosts_in_group(g).into_iter().map(String::from).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INI: &str = r#"
# lab machines
[ubu1]
ubu1 ansible_host=192.168.0.102

[ubu2]
ubu2 ansible_host=192.168.0.103

[lab:children]
ubu1
ubu2

[lab:vars]
ansible_user=admin
elk_host=192.168.0.103

[ubu2:vars]
elk_host=localhost
"#;

    fn names(hosts: Vec<&Host>) -> Vec<&str> {
        hosts.into_iter().map(|h| h.name.as_str()).collect()
    }

    #[test]
    fn test_empty_inventory() {
        let inv = Inventory::new();
        assert_eq!(inv.host_count(), 0);
        assert!(inv.get_group("all").is_some());
        assert!(inv.get_group("ungrouped").is_some());
    }

    #[test]
    fn test_parse_ini() {
        let inv = Inventory::from_ini_str(INI).unwrap();
        assert_eq!(inv.host_count(), 2);

        let ubu2 = inv.get_host("ubu2").unwrap();
        assert_eq!(ubu2.address(), "192.168.0.103");
        assert!(ubu2.in_group("ubu2"));
        assert!(ubu2.in_group("lab"));
        assert!(ubu2.in_group("all"));
        assert!(!ubu2.in_group("ungrouped"));
        assert_eq!(inv.group_names(ubu2), vec!["lab", "ubu2"]);
    }

    #[test]
    fn test_child_group_vars_override_parent() {
        let inv = Inventory::from_ini_str(INI).unwrap();
        let ubu1 = inv.get_host("ubu1").unwrap();
        let ubu2 = inv.get_host("ubu2").unwrap();

        let vars1 = inv.host_vars(ubu1);
        let vars2 = inv.host_vars(ubu2);
        assert_eq!(vars1["elk_host"], serde_json::json!("192.168.0.103"));
        assert_eq!(vars2["elk_host"], serde_json::json!("localhost"));
        assert_eq!(vars1["ansible_user"], serde_json::json!("admin"));
        assert_eq!(vars1["ansible_host"], serde_json::json!("192.168.0.102"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
all:
  vars:
    ntp_server: pool.ntp.org
  children:
    ubu1:
      hosts:
        ubu1:
          ansible_host: 192.168.0.102
    ubu2:
      hosts:
        ubu2:
          ansible_host: 192.168.0.103
          ansible_port: 2222
  hosts:
    control:
      ansible_connection: local
"#;
        let inv = Inventory::from_yaml_str(yaml).unwrap();
        assert_eq!(inv.host_count(), 3);
        assert_eq!(inv.get_host("ubu2").unwrap().port, Some(2222));
        assert_eq!(
            inv.get_host("control").unwrap().connection,
            ConnectionKind::Local
        );
        assert_eq!(
            inv.host_vars(inv.get_host("ubu1").unwrap())["ntp_server"],
            serde_json::json!("pool.ntp.org")
        );
    }

    #[test]
    fn test_parse_json_with_meta() {
        let json = r#"{
            "ubu1": {"hosts": ["ubu1"]},
            "_meta": {"hostvars": {"ubu1": {"ansible_host": "10.0.0.5"}}}
        }"#;
        let inv = Inventory::from_json_str(json).unwrap();
        assert_eq!(inv.get_host("ubu1").unwrap().address(), "10.0.0.5");
    }

    #[test]
    fn test_pattern_matching() {
        let inv = Inventory::from_ini_str(INI).unwrap();

        assert_eq!(names(inv.hosts_for_pattern("all").unwrap()), vec!["ubu1", "ubu2"]);
        assert_eq!(names(inv.hosts_for_pattern("ubu2").unwrap()), vec!["ubu2"]);
        assert_eq!(names(inv.hosts_for_pattern("lab:!ubu1").unwrap()), vec!["ubu2"]);
        assert_eq!(names(inv.hosts_for_pattern("ubu2,ubu1").unwrap()), vec!["ubu1", "ubu2"]);
        assert_eq!(names(inv.hosts_for_pattern("lab:&ubu1").unwrap()), vec!["ubu1"]);
        assert_eq!(names(inv.hosts_for_pattern("ubu*").unwrap()), vec!["ubu1", "ubu2"]);
        assert_eq!(names(inv.hosts_for_pattern("~ubu[2]").unwrap()), vec!["ubu2"]);
    }

    #[test]
    fn test_unmatched_pattern_is_empty_not_error() {
        let inv = Inventory::from_ini_str(INI).unwrap();
        assert!(inv.hosts_for_pattern("dbservers").unwrap().is_empty());
        assert!(inv.hosts_for_pattern("  ").is_err());
    }

    #[test]
    fn test_ungrouped_hosts() {
        let inv = Inventory::from_ini_str("loose ansible_host=10.0.0.9\n[web]\nweb1\n").unwrap();
        assert_eq!(names(inv.hosts_for_pattern("ungrouped").unwrap()), vec!["loose"]);
        assert_eq!(inv.groups_map()["web"], vec!["web1".to_string()]);
    }

    #[test]
    fn test_load_detects_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, INI).unwrap();
        let inv = Inventory::load(&path).unwrap();
        assert_eq!(inv.host_count(), 2);
        assert_eq!(inv.source(), Some(path.as_path()));

        assert!(matches!(
            Inventory::load(dir.path().join("missing")),
            Err(InventoryError::NotFound(_))
        ));
    }
}
