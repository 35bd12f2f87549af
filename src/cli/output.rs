//! Console output
//!
//! Ansible-style play, task and recap lines on stdout. Logs go to stderr
//! through `tracing`, so the two never interleave on the same stream.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use colored::{Color, ColoredString, Colorize};

use converge::callback::ExecutionCallback;
use converge::executor::{HostStats, PlaybookReport, TaskResult, TaskStatus};

/// Formats human-readable output
#[derive(Debug)]
pub struct OutputFormatter {
    verbosity: u8,
    start_time: Instant,
}

impl OutputFormatter {
    pub fn new(use_color: bool, verbosity: u8) -> Self {
        if !use_color {
            colored::control::set_override(false);
        }
        Self {
            verbosity,
            start_time: Instant::now(),
        }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    fn header(kind: &str, title: &str) {
        let header = format!("{} [{}]", kind, title);
        let stars = "*".repeat(80_usize.saturating_sub(header.len() + 1));
        println!("\n{} {}", header.bright_white().bold(), stars.bright_black());
    }

    pub fn play_header(&self, play_name: &str) {
        Self::header("PLAY", play_name);
    }

    pub fn task_header(&self, task_name: &str) {
        Self::header("TASK", task_name);
    }

    pub fn handler_header(&self, handler_name: &str) {
        Self::header("RUNNING HANDLER", handler_name);
    }

    pub fn info(&self, message: &str) {
        println!("{}", message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", "[WARNING]:".yellow().bold(), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "ERROR!".red().bold(), message);
    }

    fn status_label(status: TaskStatus, ignored: bool) -> ColoredString {
        match status {
            TaskStatus::Ok => "ok".green(),
            TaskStatus::Changed => "changed".yellow(),
            TaskStatus::Skipped => "skipping".cyan(),
            TaskStatus::Failed if ignored => "failed (ignored)".red(),
            TaskStatus::Failed => "fatal".red().bold(),
            TaskStatus::Unreachable => "fatal".red().bold(),
        }
    }

    /// Print one task result line (and per-item lines for loops)
    pub fn task_result(&self, result: &TaskResult) {
        for item in &result.items {
            let mut line = format!(
                "{}: [{}] => (item={})",
                Self::status_label(item.status, false),
                result.host,
                item.label
            );
            if item.status == TaskStatus::Failed {
                if let Some(msg) = &item.msg {
                    line.push_str(&format!(" => {}", msg.red()));
                }
            }
            println!("{}", line);
        }

        let label = Self::status_label(result.status, result.ignored);
        match result.status {
            TaskStatus::Unreachable => println!(
                "{}: [{}]: UNREACHABLE! => {}",
                label,
                result.host,
                result.msg.as_deref().unwrap_or_default()
            ),
            TaskStatus::Failed => {
                let mut detail = result.msg.clone().unwrap_or_default();
                if let Some(rc) = result.rc {
                    detail.push_str(&format!(" (rc={})", rc));
                }
                if let Some(stderr) = result.stderr.as_deref().filter(|s| !s.trim().is_empty()) {
                    detail.push_str(&format!("\n{}", stderr.trim_end()));
                }
                println!("{}: [{}]: FAILED! => {}", label, result.host, detail.red());
                if result.ignored {
                    println!("{}", "...ignoring".cyan());
                }
            }
            _ if result.items.is_empty() || self.verbosity > 0 => {
                let show_msg = self.verbosity > 0 || result.action == "debug";
                match result.msg.as_deref().filter(|_| show_msg) {
                    Some(msg) => println!("{}: [{}] => {}", label, result.host, msg),
                    None => println!("{}: [{}]", label, result.host),
                }
            }
            _ => {}
        }

        for diff in &result.diff {
            if let Some(details) = &diff.details {
                for line in details.lines() {
                    let colored = if line.starts_with('+') && !line.starts_with("+++") {
                        line.green()
                    } else if line.starts_with('-') && !line.starts_with("---") {
                        line.red()
                    } else {
                        line.normal()
                    };
                    println!("{}", colored);
                }
            }
        }
    }

    /// Print the recap table
    pub fn recap(&self, report: &PlaybookReport) {
        Self::header("PLAY RECAP", "");
        for (host, stats) in &report.stats {
            println!("{:<30} : {}", Self::host_label(host, stats), Self::stats_line(stats));
        }
        if report.cancelled {
            self.warning("run cancelled, some tasks were not issued");
        } else if report.halted {
            self.warning("run halted by any_errors_fatal");
        }
        println!("\nPlaybook finished in {}", format_duration(self.start_time.elapsed()));
    }

    fn host_label(host: &str, stats: &HostStats) -> ColoredString {
        if stats.failed > 0 || stats.unreachable > 0 {
            host.red().bold()
        } else if stats.changed > 0 {
            host.yellow()
        } else {
            host.green()
        }
    }

    fn stats_line(stats: &HostStats) -> String {
        let fmt_stat = |label: &str, value: usize, color: Color| -> String {
            if value > 0 {
                format!("{}={:<4}", label.color(color), value)
            } else {
                format!("{}={:<4}", label, value).dimmed().to_string()
            }
        };
        [
            fmt_stat("ok", stats.ok, Color::Green),
            fmt_stat("changed", stats.changed, Color::Yellow),
            fmt_stat("unreachable", stats.unreachable, Color::Red),
            fmt_stat("failed", stats.failed, Color::Red),
            fmt_stat("skipped", stats.skipped, Color::Cyan),
            fmt_stat("rescued", stats.rescued, Color::Magenta),
            fmt_stat("ignored", stats.ignored, Color::Blue),
        ]
        .join(" ")
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{:.2}s", secs)
    } else {
        format!("{}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    }
}

/// Prints execution events as they arrive
#[derive(Debug)]
pub struct ConsoleCallback {
    output: OutputFormatter,
    /// Last task header printed, so parallel hosts share one header
    last_header: Mutex<Option<String>>,
}

impl ConsoleCallback {
    pub fn new(output: OutputFormatter) -> Self {
        Self {
            output,
            last_header: Mutex::new(None),
        }
    }

    fn header_once(&self, title: &str, handler: bool) {
        let Ok(mut last) = self.last_header.lock() else {
            return;
        };
        if last.as_deref() != Some(title) {
            if handler {
                self.output.handler_header(title);
            } else {
                self.output.task_header(title);
            }
            *last = Some(title.to_string());
        }
    }
}

#[async_trait]
impl ExecutionCallback for ConsoleCallback {
    async fn on_playbook_start(&self, name: &str) {
        if self.output.verbosity() > 0 {
            self.output.info(&format!("PLAYBOOK: {}", name));
        }
    }

    async fn on_playbook_end(&self, report: &PlaybookReport) {
        self.output.recap(report);
    }

    async fn on_play_start(&self, name: &str, hosts: &[String]) {
        self.output.play_header(name);
        if hosts.is_empty() {
            self.output.info("skipping: no hosts matched");
        }
        if let Ok(mut last) = self.last_header.lock() {
            *last = None;
        }
    }

    async fn on_task_start(&self, name: &str, _host: &str) {
        self.header_once(name, false);
    }

    async fn on_task_complete(&self, result: &TaskResult) {
        self.header_once(&result.task, false);
        self.output.task_result(result);
    }

    async fn on_handler_triggered(&self, name: &str, _host: &str) {
        self.header_once(name, true);
    }
}
