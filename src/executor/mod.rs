//! Play runner
//!
//! Plays run one after another in declared order. Within a play every
//! selected host gets its own tokio task, bounded by a semaphore of `forks`
//! permits, and runs the play's tasks sequentially against its own
//! [`HostContext`]. A host that fails or becomes unreachable stops for the
//! rest of the run without affecting the others, unless the play (or the
//! configuration) sets `any_errors_fatal`, in which case no new task is
//! issued to any host.
//!
//! Cancellation (Ctrl-C or the run timeout) works the same way: tasks that
//! are already running finish and report their real result, nothing new is
//! started, and the report is marked cancelled.

pub mod handlers;
pub mod runtime;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::callback::{ExecutionCallback, NoopCallback};
use crate::config::Config;
use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use crate::inventory::{Host, Inventory};
use crate::playbook::{Play, Playbook};
use crate::template::TemplateEngine;

pub use runtime::{HostContext, HostStats, PlayScope};
pub use task::{Flow, Inherited, TaskExecutor, TaskResult, TaskStatus};

/// Configuration for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of hosts running in parallel
    pub forks: usize,
    /// Report what would change without changing it
    pub check_mode: bool,
    /// Attach before/after diffs to results
    pub diff_mode: bool,
    /// Per-command timeout in seconds
    pub task_timeout: Option<u64>,
    /// Whole-run timeout
    pub run_timeout: Option<Duration>,
    /// Gather facts unless a play says otherwise
    pub gather_facts: bool,
    /// Halt on the first failure unless a play says otherwise
    pub any_errors_fatal: bool,
    /// Default escalation user
    pub become_user: String,
    /// Further restrict every play's hosts to this pattern
    pub limit: Option<String>,
    /// Variables from the command line, highest precedence
    pub extra_vars: IndexMap<String, JsonValue>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            forks: 5,
            check_mode: false,
            diff_mode: false,
            task_timeout: Some(300),
            run_timeout: None,
            gather_facts: true,
            any_errors_fatal: false,
            become_user: "root".to_string(),
            limit: None,
            extra_vars: IndexMap::new(),
        }
    }
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            forks: config.defaults.forks.max(1),
            check_mode: false,
            diff_mode: config.output.diff,
            task_timeout: config.command_timeout(),
            run_timeout: config.defaults.run_timeout.map(Duration::from_secs),
            gather_facts: config.defaults.gather_facts,
            any_errors_fatal: config.defaults.any_errors_fatal,
            become_user: config.defaults.become_user.clone(),
            limit: None,
            extra_vars: IndexMap::new(),
        }
    }
}

/// Task results of one play, per host
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlayReport {
    pub name: String,
    /// Hosts the play ran on
    pub hosts: Vec<String>,
    pub results: IndexMap<String, Vec<TaskResult>>,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaybookReport {
    pub playbook: String,
    /// Recap counters in inventory order
    pub stats: IndexMap<String, HostStats>,
    pub plays: Vec<PlayReport>,
    /// Hosts with an unrecovered task failure
    pub failed_hosts: Vec<String>,
    pub unreachable_hosts: Vec<String>,
    /// Hosts that had tasks left unissued
    pub cancelled_hosts: Vec<String>,
    /// The run was cancelled (Ctrl-C or run timeout)
    pub cancelled: bool,
    /// The run was halted by `any_errors_fatal`
    pub halted: bool,
}

impl PlaybookReport {
    /// Every result for a host across all plays, in execution order
    pub fn results_for<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a TaskResult> + 'a {
        self.plays
            .iter()
            .filter_map(move |p| p.results.get(host))
            .flatten()
    }

    /// The error describing an unsuccessful run
    pub fn error(&self) -> Option<Error> {
        if self.cancelled {
            Some(Error::Cancelled(format!(
                "{} host(s) had tasks left unissued",
                self.cancelled_hosts.len()
            )))
        } else if !self.failed_hosts.is_empty() {
            Some(Error::HostsFailed {
                hosts: self.failed_hosts.clone(),
            })
        } else if !self.unreachable_hosts.is_empty() {
            Some(Error::HostsUnreachable {
                hosts: self.unreachable_hosts.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }

    /// Process exit code: 0 on success, otherwise the error's code
    pub fn exit_code(&self) -> i32 {
        self.error().map(|e| e.exit_code()).unwrap_or(0)
    }
}

/// The main executor engine
pub struct Executor {
    config: Arc<ExecutorConfig>,
    inventory: Arc<Inventory>,
    connections: Arc<dyn ConnectionFactory>,
    callback: Arc<dyn ExecutionCallback>,
    engine: Arc<TemplateEngine>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        inventory: Arc<Inventory>,
        connections: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let forks = config.forks.max(1);
        Self {
            config: Arc::new(config),
            inventory,
            connections,
            callback: Arc::new(NoopCallback),
            engine: Arc::new(TemplateEngine::new()),
            semaphore: Arc::new(Semaphore::new(forks)),
            cancel: CancellationToken::new(),
        }
    }

    /// Receive execution events
    pub fn with_callback(mut self, callback: Arc<dyn ExecutionCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Token that cancels the run when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hosts a play applies to, in inventory order
    fn select_hosts(&self, play: &Play) -> Result<Vec<Host>> {
        let mut hosts: Vec<Host> = self
            .inventory
            .hosts_for_pattern(&play.hosts)?
            .into_iter()
            .cloned()
            .collect();
        if let Some(limit) = &self.config.limit {
            let allowed: Vec<String> = self
                .inventory
                .hosts_for_pattern(limit)?
                .into_iter()
                .map(|h| h.name.clone())
                .collect();
            hosts.retain(|h| allowed.contains(&h.name));
        }
        Ok(hosts)
    }

    /// Run every play of a playbook
    #[instrument(skip(self, playbook), fields(playbook = %playbook.name))]
    pub async fn run(&self, playbook: &Playbook) -> Result<PlaybookReport> {
        self.callback.on_playbook_start(&playbook.name).await;

        // `halt` stops issuing tasks; cancelling the run cancels it too.
        let halt = self.cancel.child_token();
        let timer = self.config.run_timeout.map(|limit| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(timeout = ?limit, "Run timeout reached, no new tasks will be issued");
                cancel.cancel();
            })
        });

        let hostvars = Arc::new(PlayScope::inventory_hostvars(&self.inventory));
        let groups = Arc::new(PlayScope::inventory_groups(&self.inventory));
        let mut contexts: IndexMap<String, HostContext> = IndexMap::new();
        let mut report = PlaybookReport {
            playbook: playbook.name.clone(),
            ..Default::default()
        };

        let outcome = self
            .run_plays(playbook, &halt, &hostvars, &groups, &mut contexts, &mut report)
            .await;
        if let Some(timer) = timer {
            timer.abort();
        }
        outcome?;

        for host in self.inventory.hosts() {
            let Some(ctx) = contexts.get(&host.name) else {
                continue;
            };
            report.stats.insert(host.name.clone(), ctx.stats);
            if ctx.failed {
                report.failed_hosts.push(host.name.clone());
            }
            if ctx.unreachable {
                report.unreachable_hosts.push(host.name.clone());
            }
            if ctx.cancelled {
                report.cancelled_hosts.push(host.name.clone());
            }
        }
        report.cancelled = self.cancel.is_cancelled();
        report.halted = halt.is_cancelled() && !report.cancelled;

        for ctx in contexts.values() {
            if let Some(conn) = ctx.connection() {
                if let Err(e) = conn.close().await {
                    warn!(host = %ctx.name(), error = %e, "Failed to close connection");
                }
            }
        }

        info!(
            failed = report.failed_hosts.len(),
            unreachable = report.unreachable_hosts.len(),
            cancelled = report.cancelled,
            "Playbook finished"
        );
        self.callback.on_playbook_end(&report).await;
        Ok(report)
    }

    async fn run_plays(
        &self,
        playbook: &Playbook,
        halt: &CancellationToken,
        hostvars: &Arc<JsonValue>,
        groups: &Arc<JsonValue>,
        contexts: &mut IndexMap<String, HostContext>,
        report: &mut PlaybookReport,
    ) -> Result<()> {
        for play in &playbook.plays {
            let selected = self.select_hosts(play)?;
            let hosts: Vec<Host> = selected
                .into_iter()
                .filter(|h| contexts.get(&h.name).map_or(true, HostContext::is_active))
                .collect();

            if halt.is_cancelled() {
                for host in hosts {
                    contexts
                        .entry(host.name.clone())
                        .or_insert_with(|| HostContext::new(host))
                        .cancelled = true;
                }
                continue;
            }

            let names: Vec<String> = hosts.iter().map(|h| h.name.clone()).collect();
            self.callback.on_play_start(&play.name, &names).await;
            info!(play = %play.name, hosts = names.len(), "Starting play");

            if hosts.is_empty() {
                warn!(play = %play.name, pattern = %play.hosts, "No hosts matched, skipping play");
                self.callback.on_play_end(&play.name).await;
                report.plays.push(PlayReport {
                    name: play.name.clone(),
                    ..Default::default()
                });
                continue;
            }

            let shared_play = Arc::new(play.clone());
            let play_hosts = Arc::new(names.clone());
            let fatal = play.any_errors_fatal.unwrap_or(self.config.any_errors_fatal);

            let handles: Vec<_> = hosts
                .into_iter()
                .map(|host| {
                    let ctx = contexts
                        .shift_remove(&host.name)
                        .unwrap_or_else(|| HostContext::new(host.clone()));
                    let run = HostRun {
                        play: Arc::clone(&shared_play),
                        play_hosts: Arc::clone(&play_hosts),
                        inventory: Arc::clone(&self.inventory),
                        engine: Arc::clone(&self.engine),
                        connections: Arc::clone(&self.connections),
                        callback: Arc::clone(&self.callback),
                        semaphore: Arc::clone(&self.semaphore),
                        config: Arc::clone(&self.config),
                        hostvars: Arc::clone(hostvars),
                        groups: Arc::clone(groups),
                        halt: halt.clone(),
                        fatal,
                    };
                    (host, tokio::spawn(run.run(ctx)))
                })
                .collect();

            let (hosts, handles): (Vec<Host>, Vec<_>) = handles.into_iter().unzip();
            let finished = join_all(handles).await;

            let mut play_report = PlayReport {
                name: play.name.clone(),
                hosts: names,
                results: IndexMap::new(),
            };
            for (host, joined) in hosts.into_iter().zip(finished) {
                match joined {
                    Ok((ctx, results)) => {
                        play_report.results.insert(host.name.clone(), results);
                        contexts.insert(host.name.clone(), ctx);
                    }
                    Err(e) => {
                        error!(host = %host.name, error = %e, "Host execution aborted");
                        let mut ctx = HostContext::new(host.clone());
                        ctx.failed = true;
                        ctx.stats.failed += 1;
                        contexts.insert(host.name.clone(), ctx);
                    }
                }
            }
            report.plays.push(play_report);
            self.callback.on_play_end(&play.name).await;
        }
        Ok(())
    }
}

/// Everything one host task needs for one play
struct HostRun {
    play: Arc<Play>,
    play_hosts: Arc<Vec<String>>,
    inventory: Arc<Inventory>,
    engine: Arc<TemplateEngine>,
    connections: Arc<dyn ConnectionFactory>,
    callback: Arc<dyn ExecutionCallback>,
    semaphore: Arc<Semaphore>,
    config: Arc<ExecutorConfig>,
    hostvars: Arc<JsonValue>,
    groups: Arc<JsonValue>,
    halt: CancellationToken,
    /// `any_errors_fatal` in effect for this play
    fatal: bool,
}

impl HostRun {
    fn fail_host(&self, ctx: &mut HostContext) {
        if !ctx.unreachable {
            ctx.failed = true;
        }
        if self.fatal && !self.halt.is_cancelled() {
            warn!(host = %ctx.name(), play = %self.play.name, "any_errors_fatal set, halting run");
            self.halt.cancel();
        }
    }

    #[instrument(skip_all, fields(host = %ctx.name(), play = %self.play.name))]
    async fn run(self, mut ctx: HostContext) -> (HostContext, Vec<TaskResult>) {
        let mut results = Vec::new();

        let Ok(_permit) = self.semaphore.acquire().await else {
            ctx.cancelled = true;
            return (ctx, results);
        };
        if self.halt.is_cancelled() {
            ctx.cancelled = true;
            return (ctx, results);
        }
        ctx.begin_play();

        let executor = TaskExecutor {
            scope: PlayScope {
                engine: &self.engine,
                inventory: &self.inventory,
                play: &self.play,
                play_hosts: &self.play_hosts,
                hostvars: &self.hostvars,
                groups: &self.groups,
                extra_vars: &self.config.extra_vars,
            },
            callback: self.callback.as_ref(),
            stop: &self.halt,
            check_mode: self.config.check_mode,
            diff_mode: self.config.diff_mode,
            timeout: self.config.task_timeout,
            become_user: &self.config.become_user,
        };

        if ctx.connection().is_none() {
            match self.connections.connect(&ctx.host).await {
                Ok(conn) => ctx.set_connection(conn),
                Err(e) => {
                    let result = executor.report_unreachable(&mut ctx, e.to_string()).await;
                    results.push(result);
                    self.fail_host(&mut ctx);
                    return (ctx, results);
                }
            }
        }

        let gather = self.play.gather_facts.unwrap_or(self.config.gather_facts);
        if gather && !ctx.facts_gathered() {
            let result = executor.gather_facts(&mut ctx).await;
            let failed = result.is_unhandled_failure();
            results.push(result);
            if failed {
                self.fail_host(&mut ctx);
                return (ctx, results);
            }
        }

        let flow = executor
            .run_tasks(&self.play.tasks, &mut ctx, &Inherited::default(), &mut results)
            .await;
        if flow == Flow::Failed {
            self.fail_host(&mut ctx);
        }

        let run_handlers = match flow {
            Flow::Continue => true,
            Flow::Failed => self.play.force_handlers && !ctx.unreachable,
            Flow::Stopped => false,
        };
        if run_handlers && ctx.has_pending_handlers() {
            let handler_flow =
                handlers::flush(&executor, &self.play.handlers, &mut ctx, &mut results).await;
            if handler_flow == Flow::Failed {
                self.fail_host(&mut ctx);
            }
        }

        info!(
            ok = ctx.stats.ok,
            changed = ctx.stats.changed,
            failed = ctx.failed,
            "Host finished play"
        );
        (ctx, results)
    }
}
