//! CLI tests for converge
//!
//! Drives the binary with assert_cmd:
//! - `check` against the demo playbook and inventory
//! - `list-hosts` for patterns and playbooks
//! - `run` against localhost
//! - exit codes for missing or invalid input

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

fn converge_cmd() -> Command {
    let mut cmd = Command::cargo_bin("converge").unwrap();
    cmd.env_remove("CONVERGE_INVENTORY")
        .env_remove("CONVERGE_CONFIG")
        .arg("--no-color");
    cmd
}

fn demo(path: &str) -> String {
    format!("{}/demos/{}", env!("CARGO_MANIFEST_DIR"), path)
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

// ============================================================================
// Global flags
// ============================================================================

#[test]
fn test_help_lists_subcommands() {
    converge_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("list-hosts"));
}

#[test]
fn test_version() {
    converge_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_subcommand_fails() {
    converge_cmd().arg("deploy").assert().failure();
}

// ============================================================================
// check
// ============================================================================

#[test]
fn test_check_demo_playbook() {
    converge_cmd()
        .args(["check", &demo("site.yml"), "-i", &demo("inventory.ini")])
        .assert()
        .success()
        .stdout(predicate::str::contains("PLAY [Baseline hardening]"))
        .stdout(predicate::str::contains("hosts (2): ubu1, ubu2"))
        .stdout(predicate::str::contains("PLAY [ELK stack]"))
        .stdout(predicate::str::contains("- Configure fail2ban SSH jail"))
        .stdout(predicate::str::contains("(3 plays,"))
        .stdout(predicate::str::contains("is valid"));
}

#[test]
fn test_check_missing_playbook_exits_4() {
    converge_cmd()
        .args(["check", "does-not-exist.yml"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("does-not-exist.yml"));
}

#[test]
fn test_check_unknown_action_exits_4() {
    let dir = tempdir().unwrap();
    let playbook = write_file(
        &dir,
        "bad.yml",
        r#"
- name: Bad
  hosts: all
  tasks:
    - name: Nobody implements this
      frobnicate:
        level: 11
"#,
    );

    converge_cmd()
        .arg("check")
        .arg(&playbook)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("frobnicate"));
}

#[test]
fn test_check_unknown_handler_exits_4() {
    let dir = tempdir().unwrap();
    let playbook = write_file(
        &dir,
        "bad.yml",
        r#"
- name: Bad notify
  hosts: all
  tasks:
    - name: Notifies nobody
      debug:
        msg: hi
      notify: Restart nothing
"#,
    );

    converge_cmd()
        .arg("check")
        .arg(&playbook)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Restart nothing"));
}

#[test]
fn test_check_missing_inventory_exits_5() {
    converge_cmd()
        .args(["check", &demo("site.yml"), "-i", "no-such-inventory.ini"])
        .assert()
        .code(5);
}

// ============================================================================
// list-hosts
// ============================================================================

#[test]
fn test_list_hosts_all() {
    converge_cmd()
        .args(["list-hosts", "-i", &demo("inventory.ini")])
        .assert()
        .success()
        .stdout(predicate::str::contains("hosts (2):"))
        .stdout(predicate::str::contains("ubu1"))
        .stdout(predicate::str::contains("ubu2"));
}

#[test]
fn test_list_hosts_group_pattern() {
    converge_cmd()
        .args(["list-hosts", "elk", "-i", &demo("inventory.ini")])
        .assert()
        .success()
        .stdout(predicate::str::contains("hosts (1):"))
        .stdout(predicate::str::contains("ubu2"))
        .stdout(predicate::str::contains("ubu1").not());
}

#[test]
fn test_list_hosts_for_playbook() {
    converge_cmd()
        .args(["list-hosts", &demo("site.yml"), "-i", &demo("inventory.ini")])
        .assert()
        .success()
        .stdout(predicate::str::contains("play: Baseline hardening (all)"))
        .stdout(predicate::str::contains("play: Ship logs with Filebeat (ubu1)"));
}

#[test]
fn test_list_hosts_with_vars() {
    converge_cmd()
        .args(["list-hosts", "ubu2", "--vars", "-i", &demo("inventory.ini")])
        .assert()
        .success()
        .stdout(predicate::str::contains("elk_host"))
        .stdout(predicate::str::contains("192.168.0.103"));
}

#[test]
fn test_list_hosts_respects_limit() {
    converge_cmd()
        .args(["list-hosts", "all", "-l", "web", "-i", &demo("inventory.ini")])
        .assert()
        .success()
        .stdout(predicate::str::contains("hosts (1):"))
        .stdout(predicate::str::contains("ubu2").not());
}

// ============================================================================
// run
// ============================================================================

#[test]
fn test_run_debug_on_localhost() {
    let dir = tempdir().unwrap();
    let playbook = write_file(
        &dir,
        "hello.yml",
        r#"
- name: Local
  hosts: localhost
  gather_facts: no
  vars:
    greeting: hello
  tasks:
    - name: Say hello
      debug:
        msg: "{{ greeting }} from {{ inventory_hostname }}"
"#,
    );

    converge_cmd()
        .arg("run")
        .arg(&playbook)
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from localhost"))
        .stdout(predicate::str::contains("PLAY RECAP"));
}

#[test]
fn test_run_failure_exits_2() {
    let dir = tempdir().unwrap();
    let playbook = write_file(
        &dir,
        "fail.yml",
        r#"
- name: Local failure
  hosts: localhost
  gather_facts: no
  tasks:
    - name: Always fails
      command: "false"
"#,
    );

    converge_cmd().arg("run").arg(&playbook).assert().code(2);
}

#[test]
fn test_run_extra_vars_override_play_vars() {
    let dir = tempdir().unwrap();
    let playbook = write_file(
        &dir,
        "vars.yml",
        r#"
- name: Vars
  hosts: localhost
  gather_facts: no
  vars:
    target: default
  tasks:
    - name: Show target
      debug:
        msg: "target is {{ target }}"
"#,
    );

    converge_cmd()
        .arg("run")
        .arg(&playbook)
        .args(["-e", "target=override"])
        .assert()
        .success()
        .stdout(predicate::str::contains("target is override"));
}

#[test]
fn test_run_missing_playbook_exits_4() {
    converge_cmd()
        .args(["run", "missing.yml"])
        .assert()
        .code(4);
}
