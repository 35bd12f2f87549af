//! Convergence tests for the demo playbook
//!
//! Runs `demos/site.yml` against two simulated Ubuntu hosts and checks the
//! properties a converged fleet must show:
//!
//! - a second run reports no changes
//! - the stop loop never touches services that are absent or already stopped
//! - the SSH restart handler fires once per host however often it is notified
//! - `inventory_hostname` conditions confine tasks to one host
//! - the fail2ban jail is written once and left alone afterwards
//! - plays run strictly one after another
//! - the rendered configuration files match byte for byte

mod common;

use std::sync::Arc;

use common::*;
use converge::executor::{Executor, ExecutorConfig, TaskStatus};
use pretty_assertions::assert_eq;
use serde_json::json;

async fn converge(fleet: &SimulatedFleet) -> converge::executor::PlaybookReport {
    run_playbook(&demo_playbook(), &demo_inventory(), fleet, ExecutorConfig::default()).await
}

// ============================================================================
// First run
// ============================================================================

#[tokio::test]
async fn test_first_run_converges_both_hosts() {
    let fleet = demo_fleet();
    let report = converge(&fleet).await;

    assert!(report.is_success(), "run failed: {:?}", report.error());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.plays.len(), 3);
    assert_eq!(report.plays[0].hosts, vec!["ubu1", "ubu2"]);
    assert_eq!(report.plays[1].hosts, vec!["ubu2"]);
    assert_eq!(report.plays[2].hosts, vec!["ubu1"]);

    let ubu1 = fleet.host("ubu1");
    for package in ["ufw", "fail2ban", "nginx", "mysql-server", "php-fpm", "php-mysql", "filebeat"] {
        assert!(ubu1.has_package(package), "ubu1 is missing {}", package);
    }
    for service in ["fail2ban", "nginx", "mysql", "php-fpm", "filebeat"] {
        let unit = ubu1.service(service).unwrap();
        assert!(unit.active && unit.enabled, "{} should be running and enabled", service);
    }
    assert!(ubu1.firewall_active());
    assert_eq!(
        ubu1.firewall_rules(),
        vec!["ufw allow 22/tcp".to_string(), "ufw allow 80/tcp".to_string()]
    );

    let ubu2 = fleet.host("ubu2");
    for service in ["elasticsearch", "logstash", "kibana"] {
        let unit = ubu2.service(service).unwrap();
        assert!(unit.active && unit.enabled, "{} should be running and enabled", service);
    }
    assert_eq!(
        ubu2.firewall_rules(),
        vec![
            "ufw allow 22/tcp".to_string(),
            "ufw allow 9200/tcp".to_string(),
            "ufw allow 5044/tcp".to_string(),
            "ufw allow 5601/tcp".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_mutations_run_escalated() {
    let fleet = SimulatedFleet::new()
        .with_host(SimulatedHost::ubuntu("ubu1").requiring_root())
        .with_host(SimulatedHost::ubuntu("ubu2").requiring_root());
    let report = converge(&fleet).await;

    assert!(report.is_success(), "run failed: {:?}", report.error());
    let installs: Vec<_> = fleet
        .host("ubu1")
        .events()
        .into_iter()
        .filter(|e| e.command.contains("apt-get install") || e.command.starts_with("ufw "))
        .collect();
    assert!(!installs.is_empty());
    assert!(installs.iter().all(|e| e.escalated));
}

#[tokio::test]
async fn test_apt_cache_refresh_is_not_a_change() {
    let fleet = demo_fleet();
    converge(&fleet).await;
    let report = converge(&fleet).await;

    let result = task_result(&report, "ubu1", "Install base packages");
    assert_eq!(result.status, TaskStatus::Ok);
    assert!(fleet.host("ubu1").count("apt-get update") >= 2);
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn test_second_run_reports_no_changes() {
    let fleet = demo_fleet();
    let first = converge(&fleet).await;
    assert!(first.stats["ubu1"].changed > 0);
    assert!(first.stats["ubu2"].changed > 0);

    fleet.host("ubu1").clear_log();
    fleet.host("ubu2").clear_log();
    let second = converge(&fleet).await;

    assert!(second.is_success());
    for host in ["ubu1", "ubu2"] {
        assert_eq!(changed_tasks(&second, host), Vec::<String>::new(), "{} changed", host);
        assert_eq!(second.stats[host].changed, 0);
        assert_eq!(second.stats[host].failed, 0);

        let sim = fleet.host(host);
        let writes: Vec<String> = sim
            .commands()
            .into_iter()
            .filter(|c| {
                c.starts_with("upload ")
                    || c.contains("apt-get install")
                    || c.contains("apt-get remove")
                    || c.starts_with("systemctl restart")
                    || c.starts_with("systemctl start")
                    || c.starts_with("systemctl stop")
                    || c.starts_with("systemctl enable")
                    || c == "ufw --force enable"
            })
            .collect();
        assert_eq!(writes, Vec::<String>::new(), "{} was modified on the second run", host);
    }
}

#[tokio::test]
async fn test_handlers_do_not_fire_on_converged_hosts() {
    let fleet = demo_fleet();
    converge(&fleet).await;

    let callback = Arc::new(RecordingCallback::new());
    let executor = Executor::new(
        ExecutorConfig::default(),
        Arc::new(demo_inventory()),
        Arc::new(fleet.clone()),
    )
    .with_callback(callback.clone());
    let report = executor.run(&demo_playbook()).await.unwrap();

    assert!(report.is_success());
    assert!(callback.events().iter().all(|e| !e.starts_with("handler ")));
}

// ============================================================================
// Stop loop
// ============================================================================

#[tokio::test]
async fn test_stop_loop_only_stops_running_services() {
    let fleet = demo_fleet();
    let report = converge(&fleet).await;
    let ubu1 = fleet.host("ubu1");

    assert!(!ubu1.ran("systemctl stop apache2"));
    assert!(!ubu1.ran("systemctl stop rpcbind"));
    assert!(!ubu1.ran("systemctl stop avahi-daemon"));
    assert_eq!(ubu1.count("systemctl stop cups"), 1);
    assert!(!ubu1.service("cups").unwrap().active);

    let result = task_result(&report, "ubu1", "Stop unwanted services");
    assert_eq!(result.status, TaskStatus::Changed);
    let items: Vec<(&str, TaskStatus)> = result
        .items
        .iter()
        .map(|i| (i.label.as_str(), i.status))
        .collect();
    assert_eq!(
        items,
        vec![
            ("apache2", TaskStatus::Skipped),
            ("avahi-daemon", TaskStatus::Ok),
            ("cups", TaskStatus::Changed),
            ("rpcbind", TaskStatus::Skipped),
        ]
    );
}

#[tokio::test]
async fn test_status_probe_tolerates_missing_units() {
    let fleet = demo_fleet();
    let report = converge(&fleet).await;

    let probe = task_result(&report, "ubu2", "Check status of unwanted services");
    assert_eq!(probe.status, TaskStatus::Ok);
    assert!(!probe.changed);
    assert_eq!(probe.items.len(), 4);
    assert!(probe.items.iter().all(|i| i.status == TaskStatus::Ok));
    assert_eq!(fleet.host("ubu2").count("systemctl status apache2"), 1);
}

// ============================================================================
// Handlers
// ============================================================================

#[tokio::test]
async fn test_ssh_handler_runs_once_per_host() {
    let fleet = demo_fleet();
    let callback = Arc::new(RecordingCallback::new());
    let executor = Executor::new(
        ExecutorConfig::default(),
        Arc::new(demo_inventory()),
        Arc::new(fleet.clone()),
    )
    .with_callback(callback.clone());
    let report = executor.run(&demo_playbook()).await.unwrap();
    assert!(report.is_success());

    for host in ["ubu1", "ubu2"] {
        // Notified by three changed tasks, five changed items in total.
        assert_eq!(fleet.host(host).count("systemctl restart ssh"), 1);
        assert_eq!(callback.handler_runs(host, "Restart SSH"), 1);
        assert_eq!(task_results(&report, host, "Restart SSH").len(), 1);
    }
}

#[tokio::test]
async fn test_handlers_run_after_all_tasks_in_notification_order() {
    let fleet = demo_fleet();
    converge(&fleet).await;
    let ubu1 = fleet.host("ubu1");

    let restart_ssh = ubu1.first_seq("systemctl restart ssh").unwrap();
    let restart_fail2ban = ubu1.first_seq("systemctl restart fail2ban").unwrap();
    let last_play_task = ubu1.first_seq("systemctl enable php-fpm").unwrap();
    assert!(last_play_task < restart_ssh);
    assert!(restart_ssh < restart_fail2ban);
}

#[tokio::test]
async fn test_elk_handlers_restart_each_service_once() {
    let fleet = demo_fleet();
    converge(&fleet).await;
    let ubu2 = fleet.host("ubu2");

    // Elasticsearch is notified by two tasks.
    assert_eq!(ubu2.count("systemctl restart elasticsearch"), 1);
    assert_eq!(ubu2.count("systemctl restart logstash"), 1);
    assert_eq!(ubu2.count("systemctl restart kibana"), 1);
    assert_eq!(fleet.host("ubu1").count("systemctl restart filebeat"), 1);
}

// ============================================================================
// Host targeting
// ============================================================================

#[tokio::test]
async fn test_inventory_hostname_condition_targets_one_host() {
    let fleet = demo_fleet();
    let report = converge(&fleet).await;
    let ubu2 = fleet.host("ubu2");

    assert_eq!(status_of(&report, "ubu2", "Install web stack"), TaskStatus::Skipped);
    assert_eq!(status_of(&report, "ubu2", "Allow HTTP on the web host"), TaskStatus::Skipped);
    assert_eq!(status_of(&report, "ubu1", "Allow ELK ports on the log host"), TaskStatus::Skipped);
    assert_eq!(status_of(&report, "ubu1", "Install web stack"), TaskStatus::Changed);

    assert!(!ubu2.has_package("nginx"));
    assert!(!ubu2.ran("ufw allow 80/tcp"));
    assert!(!ubu2.commands().iter().any(|c| c.contains("nginx")));
    assert!(!fleet.host("ubu1").ran("ufw allow 9200/tcp"));
}

#[tokio::test]
async fn test_play_patterns_select_hosts() {
    let fleet = demo_fleet();
    let report = converge(&fleet).await;

    assert!(task_results(&report, "ubu1", "Install Java and the ELK stack").is_empty());
    assert!(task_results(&report, "ubu2", "Install Filebeat").is_empty());
    assert!(!fleet.host("ubu2").has_package("filebeat"));
    assert!(!fleet.host("ubu1").has_package("elasticsearch"));
}

// ============================================================================
// fail2ban jail
// ============================================================================

#[tokio::test]
async fn test_jail_local_written_once() {
    let fleet = demo_fleet();

    let first = converge(&fleet).await;
    assert_eq!(status_of(&first, "ubu1", "Configure fail2ban SSH jail"), TaskStatus::Changed);
    assert_eq!(fleet.host("ubu1").file("/etc/fail2ban/jail.local").unwrap(), JAIL_LOCAL);
    assert_eq!(fleet.host("ubu1").file_mode("/etc/fail2ban/jail.local"), Some(0o644));
    assert_eq!(fleet.host("ubu1").count("systemctl restart fail2ban"), 1);

    let second = converge(&fleet).await;
    assert_eq!(status_of(&second, "ubu1", "Configure fail2ban SSH jail"), TaskStatus::Ok);
    assert_eq!(fleet.host("ubu1").count("upload /etc/fail2ban/jail.local"), 1);
    assert_eq!(fleet.host("ubu1").count("systemctl restart fail2ban"), 1);
}

#[tokio::test]
async fn test_jail_local_drift_is_repaired() {
    let fleet = demo_fleet();
    converge(&fleet).await;

    fleet
        .host("ubu2")
        .put_file("/etc/fail2ban/jail.local", "[sshd]\nenabled = false\n");
    let report = converge(&fleet).await;

    assert_eq!(status_of(&report, "ubu2", "Configure fail2ban SSH jail"), TaskStatus::Changed);
    assert_eq!(fleet.host("ubu2").file("/etc/fail2ban/jail.local").unwrap(), JAIL_LOCAL);
    assert_eq!(fleet.host("ubu2").count("systemctl restart fail2ban"), 2);
    assert_eq!(changed_tasks(&report, "ubu1"), Vec::<String>::new());
}

#[tokio::test]
async fn test_check_mode_reports_drift_without_fixing() {
    let fleet = demo_fleet();
    converge(&fleet).await;
    let drifted = "[sshd]\nenabled = false\n";
    fleet.host("ubu1").put_file("/etc/fail2ban/jail.local", drifted);
    fleet.host("ubu1").clear_log();

    let config = ExecutorConfig {
        check_mode: true,
        ..Default::default()
    };
    let report = run_playbook(&demo_playbook(), &demo_inventory(), &fleet, config).await;

    assert!(report.is_success(), "run failed: {:?}", report.error());
    assert_eq!(changed_tasks(&report, "ubu1"), vec!["Configure fail2ban SSH jail", "Restart fail2ban"]);
    assert_eq!(fleet.host("ubu1").file("/etc/fail2ban/jail.local").unwrap(), drifted);
    let ubu1 = fleet.host("ubu1");
    assert!(!ubu1.commands().iter().any(|c| c.starts_with("upload ")));
    assert!(!ubu1.ran("systemctl restart fail2ban"));
    assert!(!ubu1.ran("systemctl status cups"));
}

// ============================================================================
// Play ordering
// ============================================================================

#[tokio::test]
async fn test_plays_run_in_declared_order() {
    let fleet = demo_fleet();
    let callback = Arc::new(RecordingCallback::new());
    let executor = Executor::new(
        ExecutorConfig::default(),
        Arc::new(demo_inventory()),
        Arc::new(fleet.clone()),
    )
    .with_callback(callback.clone());
    executor.run(&demo_playbook()).await.unwrap();

    // Everything ubu2 does happens before Filebeat is configured on ubu1.
    let filebeat_config = fleet
        .host("ubu1")
        .first_seq("upload /etc/filebeat/filebeat.yml")
        .unwrap();
    let ubu2_last = fleet.host("ubu2").last_seq().unwrap();
    assert!(ubu2_last < filebeat_config);
    let elk_started = fleet
        .host("ubu2")
        .first_seq("systemctl start logstash")
        .unwrap();
    assert!(elk_started < filebeat_config);

    let events = callback.events();
    let position = |wanted: &str| {
        events
            .iter()
            .position(|e| e.starts_with(wanted))
            .unwrap_or_else(|| panic!("no event starting with '{}'", wanted))
    };
    assert!(position("play_end Baseline hardening") < position("play_start ELK stack [ubu2]"));
    assert!(position("play_end ELK stack") < position("play_start Ship logs with Filebeat [ubu1]"));
    let last_baseline_task = events
        .iter()
        .rposition(|e| e.ends_with("Ensure web services are running"))
        .unwrap();
    assert!(last_baseline_task < position("play_start ELK stack"));
}

// ============================================================================
// Rendered artifacts
// ============================================================================

#[tokio::test]
async fn test_elk_configuration_files() {
    let fleet = demo_fleet();
    converge(&fleet).await;
    let ubu2 = fleet.host("ubu2");

    assert_eq!(
        ubu2.file("/etc/logstash/conf.d/02-beats-input.conf").unwrap(),
        BEATS_INPUT
    );
    assert_eq!(
        ubu2.file("/etc/elasticsearch/elasticsearch.yml").unwrap(),
        "network.host: 192.168.0.103\nhttp.port: 9200\n"
    );
    assert_eq!(
        ubu2.file("/etc/kibana/kibana.yml").unwrap(),
        "elasticsearch.hosts: [\"http://192.168.0.103:9200\"]\n"
    );
}

#[tokio::test]
async fn test_filebeat_ships_to_logstash_by_default() {
    let fleet = demo_fleet();
    let report = converge(&fleet).await;

    assert_eq!(
        status_of(&report, "ubu1", "Configure Filebeat to ship to Elasticsearch"),
        TaskStatus::Skipped
    );
    assert_eq!(
        fleet.host("ubu1").file("/etc/filebeat/filebeat.yml").unwrap(),
        FILEBEAT_LOGSTASH
    );
    assert_eq!(fleet.host("ubu1").count("upload /etc/filebeat/filebeat.yml"), 1);
}

#[tokio::test]
async fn test_filebeat_elasticsearch_variant() {
    let fleet = demo_fleet();
    let mut config = ExecutorConfig::default();
    config
        .extra_vars
        .insert("filebeat_output".to_string(), json!("elasticsearch"));
    let report = run_playbook(&demo_playbook(), &demo_inventory(), &fleet, config).await;

    assert_eq!(
        status_of(&report, "ubu1", "Configure Filebeat to ship to Logstash"),
        TaskStatus::Skipped
    );
    assert_eq!(
        fleet.host("ubu1").file("/etc/filebeat/filebeat.yml").unwrap(),
        FILEBEAT_ELASTICSEARCH
    );
}

#[tokio::test]
async fn test_sshd_config_hardened_in_place() {
    let fleet = demo_fleet();
    converge(&fleet).await;

    assert_eq!(
        fleet.host("ubu1").file("/etc/ssh/sshd_config").unwrap(),
        "Include /etc/ssh/sshd_config.d/*.conf
PermitRootLogin no
PasswordAuthentication no
X11Forwarding no
MaxAuthTries 3
ClientAliveInterval 300
UsePAM yes
"
    );
}

#[tokio::test]
async fn test_loop_labels_use_loop_control() {
    let fleet = demo_fleet();
    let report = converge(&fleet).await;

    let result = task_result(&report, "ubu2", "Harden remaining SSH options");
    let labels: Vec<&str> = result.items.iter().map(|i| i.label.as_str()).collect();
    assert_eq!(
        labels,
        vec!["X11Forwarding no", "MaxAuthTries 3", "ClientAliveInterval 300"]
    );
}

// ============================================================================
// Recap
// ============================================================================

#[tokio::test]
async fn test_recap_counts() {
    let fleet = demo_fleet();
    let report = converge(&fleet).await;

    let ubu2 = report.stats["ubu2"];
    assert_eq!(ubu2.failed, 0);
    assert_eq!(ubu2.unreachable, 0);
    // Three host-conditional tasks in the baseline play are skipped on ubu2.
    assert_eq!(ubu2.skipped, 3);
    assert!(ubu2.changed <= ubu2.ok);

    let tasks_run = report.results_for("ubu2").count();
    assert_eq!(ubu2.ok + ubu2.skipped, tasks_run);
}
