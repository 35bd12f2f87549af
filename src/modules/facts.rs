//! Facts modules - Query target state
//!
//! - `setup` gathers distribution, host and kernel facts. The executor runs
//!   it implicitly at the start of a play when `gather_facts` is on.
//! - `package_facts` lists installed packages from `dpkg-query`.
//! - `service_facts` lists systemd services and their state.
//!
//! All of them are read-only and never report a change. Results are returned
//! under `ansible_facts` and merged into the host's fact set.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult};
use crate::connection::Connection;

/// Probe printing `key=value` lines for the `setup` facts
pub const SETUP_SCRIPT: &str = r#"if [ -r /etc/os-release ]; then . /etc/os-release; fi
echo "os_id=${ID:-}"
echo "os_name=${NAME:-}"
echo "os_version_id=${VERSION_ID:-}"
echo "os_codename=${VERSION_CODENAME:-}"
echo "os_like=${ID_LIKE:-}"
echo "hostname=$(hostname -s 2>/dev/null || hostname)"
echo "fqdn=$(hostname -f 2>/dev/null || hostname)"
echo "system=$(uname -s)"
echo "kernel=$(uname -r)"
echo "architecture=$(uname -m)"
echo "default_ipv4=$(ip -4 route get 1.1.1.1 2>/dev/null | sed -n 's/.* src \([0-9.]*\).*/\1/p')""#;

/// Installed packages, one `status<TAB>name<TAB>version<TAB>arch` per line
pub const PACKAGE_QUERY: &str =
    r"dpkg-query -W -f='${db:Status-Abbrev}\t${Package}\t${Version}\t${Architecture}\n'";

/// Loaded service units
pub const SERVICE_UNITS_QUERY: &str =
    "systemctl list-units --type=service --all --no-legend --no-pager --plain";

/// Service unit files and their enablement
pub const SERVICE_FILES_QUERY: &str =
    "systemctl list-unit-files --type=service --no-legend --no-pager";

async fn query(conn: &dyn Connection, context: &ModuleContext, cmd: &str) -> ModuleResult<String> {
    let result = context.run(conn, cmd).await?;
    if !result.success {
        return Err(ModuleError::CommandFailed {
            code: result.exit_code,
            message: format!("'{}' failed: {}", cmd, result.stderr.trim()),
        });
    }
    Ok(result.stdout)
}

fn os_family(id: &str, like: &str) -> &'static str {
    let ids: Vec<&str> = std::iter::once(id).chain(like.split_whitespace()).collect();
    if ids.iter().any(|i| matches!(*i, "debian" | "ubuntu")) {
        "Debian"
    } else if ids.iter().any(|i| matches!(*i, "rhel" | "fedora" | "centos")) {
        "RedHat"
    } else if ids.iter().any(|i| *i == "arch") {
        "Archlinux"
    } else if ids.iter().any(|i| i.starts_with("suse") || *i == "opensuse") {
        "Suse"
    } else {
        "Unknown"
    }
}

/// Turn the `setup` probe output into facts
pub fn parse_setup_output(output: &str) -> Map<String, Value> {
    let raw: std::collections::HashMap<&str, &str> = output
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim().trim_matches('"')))
        .collect();
    let get = |key: &str| raw.get(key).copied().unwrap_or("");

    let version = get("os_version_id");
    let distribution = match get("os_name") {
        "" => "Unknown",
        // "Debian GNU/Linux" is reported as "Debian".
        name => name.split_whitespace().next().unwrap_or(name),
    };

    let mut facts = Map::new();
    facts.insert("distribution".into(), json!(distribution));
    facts.insert("distribution_version".into(), json!(version));
    facts.insert(
        "distribution_major_version".into(),
        json!(version.split('.').next().unwrap_or("")),
    );
    facts.insert("distribution_release".into(), json!(get("os_codename")));
    facts.insert(
        "os_family".into(),
        json!(os_family(get("os_id"), get("os_like"))),
    );
    facts.insert("hostname".into(), json!(get("hostname")));
    facts.insert("nodename".into(), json!(get("hostname")));
    facts.insert("fqdn".into(), json!(get("fqdn")));
    facts.insert("system".into(), json!(get("system")));
    facts.insert("kernel".into(), json!(get("kernel")));
    facts.insert("architecture".into(), json!(get("architecture")));
    let address = get("default_ipv4");
    if !address.is_empty() {
        facts.insert("default_ipv4".into(), json!({ "address": address }));
    }
    facts
}

/// Turn `dpkg-query` output into `packages: name -> [{name, version, ...}]`
pub fn parse_package_output(output: &str) -> Map<String, Value> {
    let mut packages = Map::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        let [status, name, version, arch] = fields[..] else {
            continue;
        };
        if !status.trim().starts_with("ii") {
            continue;
        }
        let entry = json!({
            "name": name,
            "version": version,
            "arch": arch,
            "source": "apt",
        });
        match packages
            .entry(name.to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            Value::Array(list) => list.push(entry),
            other => *other = Value::Array(vec![entry]),
        }
    }
    packages
}

/// Merge `list-units` and `list-unit-files` output into `services`
pub fn parse_service_output(units: &str, unit_files: &str) -> Map<String, Value> {
    let mut services = Map::new();

    for line in unit_files.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(status)) = (parts.next(), parts.next()) else {
            continue;
        };
        services.insert(
            name.to_string(),
            json!({"name": name, "state": "stopped", "status": status, "source": "systemd"}),
        );
    }

    for line in units.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [name, load, active, sub, ..] = parts[..] else {
            continue;
        };
        if load == "not-found" {
            continue;
        }
        let state = match (active, sub) {
            ("active", "running") => "running",
            ("active", _) => "running",
            ("inactive", _) | ("failed", _) => "stopped",
            _ => "unknown",
        };
        let entry = services.entry(name.to_string()).or_insert_with(|| {
            json!({"name": name, "state": state, "status": "unknown", "source": "systemd"})
        });
        entry["state"] = json!(state);
    }

    services
}

/// Gathers distribution and host facts
#[derive(Debug)]
pub struct SetupModule;

#[async_trait]
impl Module for SetupModule {
    fn name(&self) -> &'static str {
        "setup"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["gather_facts"]
    }

    fn description(&self) -> &'static str {
        "Gather distribution, host and kernel facts"
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        _params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let output = query(conn, context, SETUP_SCRIPT).await?;
        let facts = parse_setup_output(&output);
        Ok(ModuleOutput::ok(format!("Gathered {} facts", facts.len())).with_facts(facts))
    }
}

/// Gathers installed package facts
#[derive(Debug)]
pub struct PackageFactsModule;

#[async_trait]
impl Module for PackageFactsModule {
    fn name(&self) -> &'static str {
        "package_facts"
    }

    fn description(&self) -> &'static str {
        "Gather installed package facts"
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        _params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let output = query(conn, context, PACKAGE_QUERY).await?;
        let packages = parse_package_output(&output);
        let count = packages.len();
        let mut facts = Map::new();
        facts.insert("packages".into(), Value::Object(packages));
        Ok(ModuleOutput::ok(format!("Found {} installed packages", count)).with_facts(facts))
    }
}

/// Gathers service state facts
#[derive(Debug)]
pub struct ServiceFactsModule;

#[async_trait]
impl Module for ServiceFactsModule {
    fn name(&self) -> &'static str {
        "service_facts"
    }

    fn description(&self) -> &'static str {
        "Gather service state facts"
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        _params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let units = query(conn, context, SERVICE_UNITS_QUERY).await?;
        let unit_files = query(conn, context, SERVICE_FILES_QUERY).await?;
        let services = parse_service_output(&units, &unit_files);
        let count = services.len();
        let mut facts = Map::new();
        facts.insert("services".into(), Value::Object(services));
        Ok(ModuleOutput::ok(format!("Found {} services", count)).with_facts(facts))
    }
}
