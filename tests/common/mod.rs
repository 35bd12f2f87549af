//! Shared test utilities for the converge test suite.
//!
//! This module provides:
//! - `SimulatedHost`, an in-memory Ubuntu target that interprets the commands
//!   the built-in actions issue (dpkg-query, apt-get, systemctl, ufw, ...)
//! - `SimulatedFleet`, a `ConnectionFactory` over simulated hosts that can
//!   also mark hosts unreachable
//! - `RecordingCallback`, which keeps execution events for assertions
//! - Loaders for the demo inventory and playbook
//!
//! Every command and upload is logged with a sequence number shared by the
//! whole fleet, so tests can assert both that an action never ran and the
//! order in which hosts were touched.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;

use converge::callback::ExecutionCallback;
use converge::connection::{
    CommandResult, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
    ExecuteOptions, FileStat, TransferOptions,
};
use converge::executor::{Executor, ExecutorConfig, PlaybookReport, TaskResult, TaskStatus};
use converge::inventory::{Host, Inventory};
use converge::modules::facts::SETUP_SCRIPT;
use converge::modules::ModuleRegistry;
use converge::playbook::Playbook;

// ============================================================================
// Demo fixtures
// ============================================================================

pub const DEMO_INVENTORY: &str = include_str!("../../demos/inventory.ini");
pub const DEMO_PLAYBOOK: &str = include_str!("../../demos/site.yml");

pub const JAIL_LOCAL: &str = "[sshd]
enabled = true
port = ssh
maxretry = 3
bantime = 3600
logpath = /var/log/auth.log
";

pub const BEATS_INPUT: &str = r#"input {
  beats {
    port => 5044
  }
}

output {
  elasticsearch {
    hosts => ["localhost:9200"]
    index => "filebeat-%{+YYYY.MM.dd}"
  }
}
"#;

pub const FILEBEAT_LOGSTASH: &str = r#"filebeat.inputs:
  - type: log
    enabled: true
    paths:
      - /var/log/*.log
      - /var/log/nginx/*.log

output.logstash:
  hosts: ["192.168.0.103:5044"]

logging.level: info
logging.to_files: true
logging.files:
  path: /var/log/filebeat
  name: filebeat
  keepfiles: 7
  permissions: 0644
"#;

pub const FILEBEAT_ELASTICSEARCH: &str = r#"filebeat.inputs:
  - type: log
    enabled: true
    paths:
      - /var/log/*.log
      - /var/log/nginx/*.log

output.elasticsearch:
  hosts: ["192.168.0.103:9200"]
"#;

const DEFAULT_SSHD_CONFIG: &str = "Include /etc/ssh/sshd_config.d/*.conf
#PermitRootLogin prohibit-password
#PasswordAuthentication yes
X11Forwarding yes
#MaxAuthTries 6
#ClientAliveInterval 0
UsePAM yes
";

pub fn demo_inventory() -> Inventory {
    Inventory::from_ini_str(DEMO_INVENTORY).expect("demo inventory parses")
}

pub fn demo_playbook() -> Playbook {
    parse_playbook(DEMO_PLAYBOOK)
}

pub fn parse_playbook(yaml: &str) -> Playbook {
    Playbook::from_yaml(yaml, None, &ModuleRegistry::with_builtins()).expect("playbook parses")
}

/// Both demo hosts as freshly provisioned Ubuntu machines
pub fn demo_fleet() -> SimulatedFleet {
    SimulatedFleet::new()
        .with_host(SimulatedHost::ubuntu("ubu1").with_address("192.168.0.102"))
        .with_host(SimulatedHost::ubuntu("ubu2").with_address("192.168.0.103"))
}

/// Run a playbook against simulated hosts
pub async fn run_playbook(
    playbook: &Playbook,
    inventory: &Inventory,
    fleet: &SimulatedFleet,
    config: ExecutorConfig,
) -> PlaybookReport {
    Executor::new(config, Arc::new(inventory.clone()), Arc::new(fleet.clone()))
        .run(playbook)
        .await
        .expect("run completes")
}

/// Results of one named task on one host
pub fn task_results<'a>(report: &'a PlaybookReport, host: &str, task: &str) -> Vec<&'a TaskResult> {
    report
        .plays
        .iter()
        .filter_map(|p| p.results.get(host))
        .flatten()
        .filter(|r| r.task == task)
        .collect()
}

/// The single result of a named task on one host
pub fn task_result<'a>(report: &'a PlaybookReport, host: &str, task: &str) -> &'a TaskResult {
    let results = task_results(report, host, task);
    assert_eq!(results.len(), 1, "expected one result for '{}' on {}", task, host);
    results[0]
}

pub fn changed_tasks(report: &PlaybookReport, host: &str) -> Vec<String> {
    report
        .results_for(host)
        .filter(|r| r.changed)
        .map(|r| r.task.clone())
        .collect()
}

// ============================================================================
// Simulated host
// ============================================================================

/// A systemd unit on the simulated host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit {
    pub active: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFile {
    pub content: Vec<u8>,
    pub mode: u32,
}

/// One command or upload seen by a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Fleet-wide sequence number
    pub seq: u64,
    pub command: String,
    pub escalated: bool,
}

#[derive(Debug, Default)]
struct SimState {
    address: String,
    packages: BTreeMap<String, String>,
    unavailable: HashSet<String>,
    services: BTreeMap<String, Unit>,
    firewall_active: bool,
    firewall_rules: Vec<String>,
    policies: BTreeMap<String, String>,
    files: BTreeMap<PathBuf, SimFile>,
    failing: Vec<String>,
    require_root: bool,
    log: Vec<Event>,
}

/// In-memory target host
#[derive(Debug)]
pub struct SimulatedHost {
    name: String,
    clock: Arc<AtomicU64>,
    state: Mutex<SimState>,
}

/// Units installed along with a package
fn service_for_package(package: &str) -> Option<&'static str> {
    match package {
        "fail2ban" => Some("fail2ban"),
        "nginx" => Some("nginx"),
        "mysql-server" => Some("mysql"),
        "php-fpm" => Some("php-fpm"),
        "elasticsearch" => Some("elasticsearch"),
        "logstash" => Some("logstash"),
        "kibana" => Some("kibana"),
        "filebeat" => Some("filebeat"),
        "apache2" => Some("apache2"),
        _ => None,
    }
}

fn unit_name(raw: &str) -> &str {
    raw.trim_end_matches(".service")
}

impl SimulatedHost {
    /// An empty host: no packages, services or files
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(SimState::default()),
        }
    }

    /// A fresh Ubuntu install: sshd running, cups running, avahi-daemon
    /// installed but stopped, the stock sshd_config
    pub fn ubuntu(name: impl Into<String>) -> Self {
        Self::new(name)
            .with_package("openssh-server", "1:8.9p1-3ubuntu0.6")
            .with_package("cups", "2.4.1op1-1ubuntu4")
            .with_package("avahi-daemon", "0.8-5ubuntu5")
            .with_service("ssh", true, true)
            .with_service("cups", true, true)
            .with_service("avahi-daemon", false, true)
            .with_file("/etc/ssh/sshd_config", DEFAULT_SSHD_CONFIG)
    }

    pub fn with_address(self, address: &str) -> Self {
        self.state.lock().address = address.to_string();
        self
    }

    pub fn with_package(self, name: &str, version: &str) -> Self {
        self.state
            .lock()
            .packages
            .insert(name.to_string(), version.to_string());
        self
    }

    /// `apt-get install` of this package fails
    pub fn without_candidate(self, name: &str) -> Self {
        self.state.lock().unavailable.insert(name.to_string());
        self
    }

    pub fn with_service(self, name: &str, active: bool, enabled: bool) -> Self {
        self.state
            .lock()
            .services
            .insert(name.to_string(), Unit { active, enabled });
        self
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.state.lock().files.insert(
            PathBuf::from(path),
            SimFile {
                content: content.as_bytes().to_vec(),
                mode: 0o644,
            },
        );
        self
    }

    /// Any command containing `pattern` exits 1
    pub fn failing_on(self, pattern: &str) -> Self {
        self.state.lock().failing.push(pattern.to_string());
        self
    }

    /// Mutations and `ufw` need privilege escalation
    pub fn requiring_root(self) -> Self {
        self.state.lock().require_root = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overwrite a file behind the run's back, keeping its mode
    pub fn put_file(&self, path: &str, content: &str) {
        let mut state = self.state.lock();
        let mode = state.files.get(Path::new(path)).map_or(0o644, |f| f.mode);
        state.files.insert(
            PathBuf::from(path),
            SimFile {
                content: content.as_bytes().to_vec(),
                mode,
            },
        );
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().log.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.command).collect()
    }

    /// How many commands equal `command`
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == command).count()
    }

    pub fn ran(&self, command: &str) -> bool {
        self.count(command) > 0
    }

    /// Sequence number of the first event matching `command`
    pub fn first_seq(&self, command: &str) -> Option<u64> {
        self.events()
            .into_iter()
            .find(|e| e.command == command)
            .map(|e| e.seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.events().last().map(|e| e.seq)
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state
            .lock()
            .files
            .get(Path::new(path))
            .map(|f| String::from_utf8_lossy(&f.content).into_owned())
    }

    pub fn file_mode(&self, path: &str) -> Option<u32> {
        self.state.lock().files.get(Path::new(path)).map(|f| f.mode)
    }

    pub fn service(&self, name: &str) -> Option<Unit> {
        self.state.lock().services.get(name).copied()
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.state.lock().packages.contains_key(name)
    }

    pub fn firewall_active(&self) -> bool {
        self.state.lock().firewall_active
    }

    pub fn firewall_rules(&self) -> Vec<String> {
        self.state.lock().firewall_rules.clone()
    }

    fn record(&self, state: &mut SimState, command: String, escalated: bool) {
        let seq = self.clock.fetch_add(1, Ordering::SeqCst);
        state.log.push(Event {
            seq,
            command,
            escalated,
        });
    }
}

fn ok(stdout: impl Into<String>) -> CommandResult {
    CommandResult::success(stdout.into(), String::new())
}

fn fail(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandResult {
    CommandResult::failure(code, stdout.into(), stderr.into())
}

fn denied() -> CommandResult {
    fail(1, "", "Permission denied (are you root?)")
}

impl SimState {
    fn run(&mut self, host: &str, command: &str, escalated: bool) -> CommandResult {
        if command == SETUP_SCRIPT {
            return ok(format!(
                "os_id=ubuntu\nos_name=Ubuntu\nos_version_id=22.04\nos_codename=jammy\n\
                 os_like=debian\nhostname={host}\nfqdn={host}.lan\nsystem=Linux\n\
                 kernel=5.15.0-91-generic\narchitecture=x86_64\ndefault_ipv4={}\n",
                self.address
            ));
        }
        if self.failing.iter().any(|p| command.contains(p.as_str())) {
            return fail(1, "", format!("simulated failure: {}", command));
        }

        let Ok(mut argv) = shell_words::split(command) else {
            return fail(2, "", "sh: syntax error");
        };
        while argv
            .first()
            .is_some_and(|a| a.contains('=') && !a.starts_with('-'))
        {
            argv.remove(0);
        }
        argv.retain(|a| !a.starts_with("2>") && a != "&&");
        let Some(program) = argv.first().cloned() else {
            return ok("");
        };
        let args: Vec<&str> = argv[1..].iter().map(String::as_str).collect();

        match program.as_str() {
            "dpkg-query" => self.dpkg_query(&args),
            "apt-get" => self.apt_get(&args, escalated),
            "systemctl" => self.systemctl(&args, escalated),
            "ufw" => {
                if self.require_root && !escalated {
                    return fail(1, "", "ERROR: You need to be root to run this script");
                }
                self.ufw(&args)
            }
            "stat" => match args.last() {
                Some(path) if self.files.contains_key(Path::new(path)) => ok("root root\n"),
                Some(path) => fail(1, "", format!("stat: cannot statx '{}'", path)),
                None => fail(1, "", "stat: missing operand"),
            },
            "cp" => {
                if self.require_root && !escalated {
                    return denied();
                }
                let paths: Vec<&&str> = args.iter().filter(|a| !a.starts_with('-')).collect();
                match paths.as_slice() {
                    [from, to] => match self.files.get(Path::new(**from)).cloned() {
                        Some(file) => {
                            self.files.insert(PathBuf::from(**to), file);
                            ok("")
                        }
                        None => fail(1, "", format!("cp: cannot stat '{}'", from)),
                    },
                    _ => fail(1, "", "cp: missing operand"),
                }
            }
            "chmod" => {
                if self.require_root && !escalated {
                    return denied();
                }
                match args.as_slice() {
                    [mode, path] => {
                        let Ok(mode) = u32::from_str_radix(mode, 8) else {
                            return fail(1, "", format!("chmod: invalid mode: '{}'", mode));
                        };
                        match self.files.get_mut(Path::new(path)) {
                            Some(file) => {
                                file.mode = mode;
                                ok("")
                            }
                            None => fail(1, "", format!("chmod: cannot access '{}'", path)),
                        }
                    }
                    _ => fail(1, "", "chmod: missing operand"),
                }
            }
            "chown" => ok(""),
            "cat" => match args.first().and_then(|p| self.files.get(Path::new(p))) {
                Some(file) => ok(String::from_utf8_lossy(&file.content).into_owned()),
                None => fail(1, "", "cat: No such file or directory"),
            },
            "test" => match args.as_slice() {
                [_, path] if self.files.contains_key(Path::new(path)) => ok(""),
                _ => fail(1, "", ""),
            },
            "echo" => ok(format!("{}\n", args.join(" "))),
            "true" => ok(""),
            "false" => fail(1, "", ""),
            "exit" => {
                let code = args.first().and_then(|c| c.parse().ok()).unwrap_or(0);
                CommandResult::new(code, String::new(), String::new())
            }
            other => fail(127, "", format!("sh: 1: {}: not found", other)),
        }
    }

    fn dpkg_query(&self, args: &[&str]) -> CommandResult {
        let format = args
            .iter()
            .find_map(|a| a.strip_prefix("-f="))
            .unwrap_or("");
        if format.contains("db:Status-Abbrev") {
            let listing: String = self
                .packages
                .iter()
                .map(|(name, version)| format!("ii \t{}\t{}\tamd64\n", name, version))
                .collect();
            return ok(listing);
        }

        let Some(package) = args.iter().rev().find(|a| !a.starts_with('-')) else {
            return fail(2, "", "dpkg-query: need an action option");
        };
        match self.packages.get(*package) {
            Some(version) => ok(format!("install ok installed {}", version)),
            None => fail(
                1,
                "",
                format!("dpkg-query: no packages found matching {}", package),
            ),
        }
    }

    fn apt_get(&mut self, args: &[&str], escalated: bool) -> CommandResult {
        let simulate = args.contains(&"-s");
        let purge = args.contains(&"--purge");
        let only_upgrade = args.contains(&"--only-upgrade");
        let words: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();
        let Some((action, packages)) = words.split_first() else {
            return fail(100, "", "E: Invalid operation");
        };

        if simulate {
            return ok("NOTE: This is only a simulation!\n");
        }
        if self.require_root && !escalated {
            return fail(
                100,
                "",
                "E: Could not open lock file /var/lib/dpkg/lock-frontend - open (13: Permission denied)",
            );
        }

        match *action {
            "update" => ok("Reading package lists... Done\n"),
            "install" => {
                if let Some(missing) = packages.iter().find(|p| self.unavailable.contains(**p)) {
                    return fail(100, "", format!("E: Unable to locate package {}", missing));
                }
                if only_upgrade {
                    return ok("0 upgraded, 0 newly installed\n");
                }
                for package in packages {
                    self.packages
                        .entry(package.to_string())
                        .or_insert_with(|| "1.0-1".to_string());
                    if let Some(unit) = service_for_package(package) {
                        self.services.entry(unit.to_string()).or_insert(Unit {
                            active: false,
                            enabled: false,
                        });
                    }
                }
                ok(format!("{} newly installed\n", packages.len()))
            }
            "remove" | "purge" => {
                for package in packages {
                    self.packages.remove(*package);
                    if let Some(unit) = service_for_package(package) {
                        self.services.remove(unit);
                    }
                }
                let verb = if purge || *action == "purge" { "purged" } else { "removed" };
                ok(format!("{} {}\n", packages.len(), verb))
            }
            other => fail(100, "", format!("E: Invalid operation {}", other)),
        }
    }

    fn systemctl(&mut self, args: &[&str], escalated: bool) -> CommandResult {
        let Some((action, rest)) = args.split_first() else {
            return fail(1, "", "systemctl: missing action");
        };

        match *action {
            "list-units" => {
                let listing: String = self
                    .services
                    .iter()
                    .map(|(name, unit)| {
                        let (active, sub) = if unit.active {
                            ("active", "running")
                        } else {
                            ("inactive", "dead")
                        };
                        format!("{}.service loaded {} {} {}\n", name, active, sub, name)
                    })
                    .collect();
                return ok(listing);
            }
            "list-unit-files" => {
                let listing: String = self
                    .services
                    .iter()
                    .map(|(name, unit)| {
                        let state = if unit.enabled { "enabled" } else { "disabled" };
                        format!("{}.service {} enabled\n", name, state)
                    })
                    .collect();
                return ok(listing);
            }
            _ => {}
        }

        let Some(name) = rest.iter().rev().find(|a| !a.starts_with('-')).map(|n| unit_name(n))
        else {
            return fail(1, "", format!("systemctl {}: missing unit", action));
        };
        let unit = self.services.get(name).copied();

        match *action {
            "show" => ok(if unit.is_some() { "loaded\n" } else { "not-found\n" }),
            "is-active" => match unit {
                Some(u) if u.active => ok("active\n"),
                _ => fail(3, "inactive\n", ""),
            },
            "is-enabled" => match unit {
                Some(u) if u.enabled => ok("enabled\n"),
                Some(_) => fail(1, "disabled\n", ""),
                None => fail(
                    1,
                    "",
                    format!(
                        "Failed to get unit file state for {}.service: No such file or directory",
                        name
                    ),
                ),
            },
            "status" => match unit {
                Some(u) if u.active => ok(format!(
                    "* {}.service\n     Active: active (running)\n",
                    name
                )),
                Some(_) => fail(
                    3,
                    format!("* {}.service\n     Active: inactive (dead)\n", name),
                    "",
                ),
                None => fail(4, "", format!("Unit {}.service could not be found.", name)),
            },
            "start" | "stop" | "restart" | "reload" | "enable" | "disable" => {
                if self.require_root && !escalated {
                    return fail(1, "", "Failed: Access denied");
                }
                let Some(unit) = self.services.get_mut(name) else {
                    return fail(
                        5,
                        "",
                        format!("Failed to {} {}.service: Unit {}.service not found.", action, name, name),
                    );
                };
                match *action {
                    "start" | "restart" | "reload" => unit.active = true,
                    "stop" => unit.active = false,
                    "enable" => unit.enabled = true,
                    _ => unit.enabled = false,
                }
                ok("")
            }
            other => fail(1, "", format!("Unknown command verb {}.", other)),
        }
    }

    fn ufw(&mut self, args: &[&str]) -> CommandResult {
        match args {
            ["status", ..] => {
                if !self.firewall_active {
                    return ok("Status: inactive\n");
                }
                let policy = |dir: &str, default: &str| {
                    self.policies
                        .get(dir)
                        .cloned()
                        .unwrap_or_else(|| default.to_string())
                };
                ok(format!(
                    "Status: active\nLogging: on (low)\nDefault: {} (incoming), {} (outgoing), disabled (routed)\n",
                    policy("incoming", "deny"),
                    policy("outgoing", "allow"),
                ))
            }
            ["show", "added"] => {
                let mut out = String::from("Added user rules (see 'ufw status' for running firewall):\n");
                if self.firewall_rules.is_empty() {
                    out.push_str("(None)\n");
                }
                for rule in &self.firewall_rules {
                    out.push_str(rule);
                    out.push('\n');
                }
                ok(out)
            }
            ["--force", "enable"] | ["enable"] => {
                self.firewall_active = true;
                ok("Firewall is active and enabled on system startup\n")
            }
            ["disable"] => {
                self.firewall_active = false;
                ok("Firewall stopped and disabled on system startup\n")
            }
            ["reload"] => ok("Firewall reloaded\n"),
            ["default", policy, direction] => {
                self.policies
                    .insert(direction.to_string(), policy.to_string());
                ok(format!("Default {} policy changed to '{}'\n", direction, policy))
            }
            ["delete", rest @ ..] => {
                let rule = format!("ufw {}", rest.join(" "));
                self.firewall_rules.retain(|r| *r != rule);
                ok("Rule deleted\n")
            }
            [verb, ..] if matches!(*verb, "allow" | "deny" | "reject" | "limit" | "route") => {
                let rule = format!("ufw {}", args.join(" "));
                if self.firewall_rules.contains(&rule) {
                    return ok("Skipping adding existing rule\n");
                }
                self.firewall_rules.push(rule);
                ok("Rule added\n")
            }
            _ => fail(1, "", "ERROR: Invalid syntax"),
        }
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.files.keys().any(|p| p != path && p.starts_with(path))
    }
}

enum Pending {
    Done(CommandResult),
    Sleep(Duration),
}

#[async_trait]
impl Connection for SimulatedHost {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let escalated = options.map_or(false, |o| o.escalate);
        let pending = {
            let mut state = self.state.lock();
            self.record(&mut state, command.to_string(), escalated);
            match command.strip_prefix("sleep ") {
                Some(secs) => match secs.trim().parse::<f64>() {
                    Ok(secs) => Pending::Sleep(Duration::from_secs_f64(secs)),
                    Err(_) => Pending::Done(fail(1, "", "sleep: invalid time interval")),
                },
                None => Pending::Done(state.run(&self.name, command, escalated)),
            }
        };
        match pending {
            Pending::Done(result) => Ok(result),
            Pending::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ok(""))
            }
        }
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        let mut state = self.state.lock();
        self.record(
            &mut state,
            format!("upload {}", remote_path.display()),
            options.escalate,
        );
        if state.require_root && !options.escalate && remote_path.starts_with("/etc") {
            return Err(ConnectionError::TransferFailed(format!(
                "{}: Permission denied",
                remote_path.display()
            )));
        }
        let mode = options
            .mode
            .or_else(|| state.files.get(remote_path).map(|f| f.mode))
            .unwrap_or(0o644);
        state.files.insert(
            remote_path.to_path_buf(),
            SimFile {
                content: content.to_vec(),
                mode,
            },
        );
        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(remote_path)
            .map(|f| f.content.clone())
            .ok_or_else(|| {
                ConnectionError::TransferFailed(format!(
                    "{}: No such file or directory",
                    remote_path.display()
                ))
            })
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let state = self.state.lock();
        Ok(state.files.contains_key(path) || state.is_dir(path))
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<Option<FileStat>> {
        let state = self.state.lock();
        if let Some(file) = state.files.get(path) {
            return Ok(Some(FileStat {
                size: file.content.len() as u64,
                mode: file.mode,
                is_dir: false,
            }));
        }
        Ok(state.is_dir(path).then_some(FileStat {
            size: 4096,
            mode: 0o755,
            is_dir: true,
        }))
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

// ============================================================================
// Simulated fleet
// ============================================================================

/// Connection factory handing out simulated hosts by inventory name
#[derive(Debug, Clone, Default)]
pub struct SimulatedFleet {
    hosts: IndexMap<String, Arc<SimulatedHost>>,
    unreachable: HashSet<String>,
    clock: Arc<AtomicU64>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, mut host: SimulatedHost) -> Self {
        host.clock = Arc::clone(&self.clock);
        self.hosts.insert(host.name.clone(), Arc::new(host));
        self
    }

    /// Connecting to this host fails as unreachable
    pub fn unreachable(mut self, name: &str) -> Self {
        self.unreachable.insert(name.to_string());
        self
    }

    pub fn host(&self, name: &str) -> Arc<SimulatedHost> {
        Arc::clone(self.hosts.get(name).expect("host is part of the fleet"))
    }
}

#[async_trait]
impl ConnectionFactory for SimulatedFleet {
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        if self.unreachable.contains(&host.name) {
            return Err(ConnectionError::Unreachable(format!(
                "ssh: connect to host {} port 22: Connection timed out",
                host.address()
            )));
        }
        match self.hosts.get(&host.name) {
            Some(sim) => Ok(Arc::clone(sim) as Arc<dyn Connection>),
            None => Err(ConnectionError::ConnectionFailed(format!(
                "no simulated host named {}",
                host.name
            ))),
        }
    }
}

// ============================================================================
// Recording callback
// ============================================================================

/// Keeps every execution event as a short string
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<String>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn handler_runs(&self, host: &str, handler: &str) -> usize {
        let wanted = format!("handler {} {}", host, handler);
        self.events().iter().filter(|e| **e == wanted).count()
    }
}

#[async_trait]
impl ExecutionCallback for RecordingCallback {
    async fn on_play_start(&self, name: &str, hosts: &[String]) {
        self.events
            .lock()
            .push(format!("play_start {} [{}]", name, hosts.join(",")));
    }

    async fn on_play_end(&self, name: &str) {
        self.events.lock().push(format!("play_end {}", name));
    }

    async fn on_task_complete(&self, result: &TaskResult) {
        self.events
            .lock()
            .push(format!("{} {} {}", result.status, result.host, result.task));
    }

    async fn on_handler_triggered(&self, name: &str, host: &str) {
        self.events.lock().push(format!("handler {} {}", host, name));
    }
}

pub fn status_of(report: &PlaybookReport, host: &str, task: &str) -> TaskStatus {
    task_result(report, host, task).status
}
