//! Task execution
//!
//! Applies one task to one host: expands the loop, evaluates `when` for each
//! item, renders arguments, runs the action plugin and then applies the
//! `until`, `changed_when` and `failed_when` overrides. The aggregated result
//! is registered, notifies handlers when it changed, and updates the host's
//! stats.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::callback::ExecutionCallback;
use crate::connection::Connection;
use crate::executor::runtime::{HostContext, PlayScope};
use crate::modules::facts::SetupModule;
use crate::modules::{
    execute_module, Diff, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleStatus,
};
use crate::playbook::{Action, Task, TaskBody};
use crate::template::TemplateVars;

/// Status of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task completed successfully without changes
    Ok,
    /// Task completed successfully with changes
    Changed,
    /// Task failed
    Failed,
    /// Task was skipped (condition not met)
    Skipped,
    /// Host was unreachable
    Unreachable,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Ok => "ok",
            TaskStatus::Changed => "changed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipping",
            TaskStatus::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Outcome of one loop item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSummary {
    pub label: String,
    pub status: TaskStatus,
    pub msg: Option<String>,
}

/// Result of executing a task on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: String,
    pub host: String,
    /// Action plugin name as written
    pub action: String,
    pub status: TaskStatus,
    pub changed: bool,
    /// Failed, but tolerated by `ignore_errors`
    pub ignored: bool,
    pub msg: Option<String>,
    pub rc: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// One entry per changed item when diff mode is on
    pub diff: Vec<Diff>,
    /// Per-item outcomes for looped tasks
    pub items: Vec<ItemSummary>,
}

impl TaskResult {
    fn new(task: &str, host: &str, action: &str) -> Self {
        Self {
            task: task.to_string(),
            host: host.to_string(),
            action: action.to_string(),
            status: TaskStatus::Ok,
            changed: false,
            ignored: false,
            msg: None,
            rc: None,
            stdout: None,
            stderr: None,
            diff: Vec::new(),
            items: Vec::new(),
        }
    }

    /// Whether this result stops the host
    pub fn is_unhandled_failure(&self) -> bool {
        match self.status {
            TaskStatus::Failed => !self.ignored,
            TaskStatus::Unreachable => true,
            _ => false,
        }
    }
}

/// How a task sequence ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Every task ran (or was skipped or ignored)
    Continue,
    /// A task failed without being ignored or rescued
    Failed,
    /// The run was stopped before all tasks were issued
    Stopped,
}

/// Keywords a block passes down to its tasks
#[derive(Debug, Clone, Default)]
pub struct Inherited {
    when: Vec<String>,
    ignore_errors: Option<bool>,
    r#become: Option<bool>,
    become_user: Option<String>,
    vars: IndexMap<String, JsonValue>,
}

impl Inherited {
    fn extend(&self, block: &Task) -> Self {
        let mut inner = self.clone();
        inner.when.extend(block.when.iter().cloned());
        inner.ignore_errors = block.ignore_errors.or(self.ignore_errors);
        inner.r#become = block.r#become.or(self.r#become);
        inner.become_user = block.become_user.clone().or_else(|| self.become_user.clone());
        for (key, value) in &block.vars {
            inner.vars.insert(key.clone(), value.clone());
        }
        inner
    }
}

/// Outcome of a single invocation of an action
#[derive(Debug, Clone, Default)]
struct ItemRecord {
    changed: bool,
    failed: bool,
    skipped: bool,
    unreachable: bool,
    msg: Option<String>,
    diff: Option<Diff>,
    /// Plugin data and command output, as registered
    data: Map<String, JsonValue>,
    label: Option<String>,
}

impl ItemRecord {
    fn skipped(reason: String) -> Self {
        let mut data = Map::new();
        data.insert("skip_reason".into(), json!(reason));
        Self {
            skipped: true,
            msg: Some(reason),
            data,
            ..Default::default()
        }
    }

    fn failed(msg: impl Into<String>) -> Self {
        Self {
            failed: true,
            msg: Some(msg.into()),
            ..Default::default()
        }
    }

    fn unreachable(msg: impl Into<String>) -> Self {
        Self {
            unreachable: true,
            msg: Some(msg.into()),
            ..Default::default()
        }
    }

    fn from_output(output: ModuleOutput) -> Self {
        let mut data: Map<String, JsonValue> = output.data.into_iter().collect();
        if let Some(rc) = output.rc {
            data.insert("rc".into(), json!(rc));
        }
        if let Some(stdout) = &output.stdout {
            data.insert("stdout".into(), json!(stdout));
            data.insert("stdout_lines".into(), json!(stdout.lines().collect::<Vec<_>>()));
        }
        if let Some(stderr) = &output.stderr {
            data.insert("stderr".into(), json!(stderr));
            data.insert("stderr_lines".into(), json!(stderr.lines().collect::<Vec<_>>()));
        }
        Self {
            changed: output.changed,
            failed: output.status == ModuleStatus::Failed,
            skipped: output.status == ModuleStatus::Skipped,
            unreachable: false,
            msg: Some(output.msg).filter(|m| !m.is_empty()),
            diff: output.diff,
            data,
            label: None,
        }
    }

    fn status(&self) -> TaskStatus {
        if self.unreachable {
            TaskStatus::Unreachable
        } else if self.failed {
            TaskStatus::Failed
        } else if self.skipped {
            TaskStatus::Skipped
        } else if self.changed {
            TaskStatus::Changed
        } else {
            TaskStatus::Ok
        }
    }

    /// The value stored by `register`
    fn registered(&self) -> JsonValue {
        let mut value = self.data.clone();
        value.insert("changed".into(), json!(self.changed));
        value.insert("failed".into(), json!(self.failed || self.unreachable));
        value.insert("skipped".into(), json!(self.skipped));
        if self.unreachable {
            value.insert("unreachable".into(), json!(true));
        }
        if let Some(msg) = &self.msg {
            value.insert("msg".into(), json!(msg));
        }
        JsonValue::Object(value)
    }

    fn rc(&self) -> Option<i32> {
        self.data.get("rc").and_then(|v| v.as_i64()).map(|rc| rc as i32)
    }

    fn text(&self, key: &str) -> Option<String> {
        self.data.get(key).and_then(|v| v.as_str()).map(String::from)
    }
}

/// Runs tasks for one host within one play
pub struct TaskExecutor<'a> {
    pub scope: PlayScope<'a>,
    pub callback: &'a dyn ExecutionCallback,
    /// Cancelled when no new task may be issued
    pub stop: &'a CancellationToken,
    pub check_mode: bool,
    pub diff_mode: bool,
    /// Per-command timeout in seconds
    pub timeout: Option<u64>,
    /// Escalation user when neither task nor play names one
    pub become_user: &'a str,
}

impl<'a> TaskExecutor<'a> {
    /// Run tasks in order until one fails or the run is stopped
    pub fn run_tasks<'s>(
        &'s self,
        tasks: &'s [Task],
        ctx: &'s mut HostContext,
        inherited: &'s Inherited,
        results: &'s mut Vec<TaskResult>,
    ) -> BoxFuture<'s, Flow> {
        Box::pin(async move {
            for task in tasks {
                if self.stop.is_cancelled() {
                    ctx.cancelled = true;
                    return Flow::Stopped;
                }
                match self.run_task(task, ctx, inherited, results).await {
                    Flow::Continue => {}
                    other => return other,
                }
            }
            Flow::Continue
        })
    }

    /// Run one task, which may be a block
    pub fn run_task<'s>(
        &'s self,
        task: &'s Task,
        ctx: &'s mut HostContext,
        inherited: &'s Inherited,
        results: &'s mut Vec<TaskResult>,
    ) -> BoxFuture<'s, Flow> {
        Box::pin(async move {
            match &task.body {
                TaskBody::Action(action) => {
                    let result = self.run_action(task, action, ctx, inherited).await;
                    let flow = if result.is_unhandled_failure() {
                        Flow::Failed
                    } else {
                        Flow::Continue
                    };
                    results.push(result);
                    flow
                }
                TaskBody::Block {
                    block,
                    rescue,
                    always,
                } => {
                    let inner = inherited.extend(task);
                    let mut flow = self.run_tasks(block, ctx, &inner, results).await;

                    if flow == Flow::Failed && !rescue.is_empty() && !ctx.unreachable {
                        info!(host = %ctx.name(), block = %task.name, "Running rescue section");
                        ctx.stats.failed = ctx.stats.failed.saturating_sub(1);
                        ctx.stats.rescued += 1;
                        flow = self.run_tasks(rescue, ctx, &inner, results).await;
                    }

                    if flow != Flow::Stopped && !always.is_empty() && !ctx.unreachable {
                        let always_flow = self.run_tasks(always, ctx, &inner, results).await;
                        if always_flow != Flow::Continue {
                            flow = always_flow;
                        }
                    }
                    flow
                }
            }
        })
    }

    /// Gather `setup` facts for the host at the start of a play
    #[instrument(skip_all, fields(host = %ctx.name()))]
    pub async fn gather_facts(&self, ctx: &mut HostContext) -> TaskResult {
        const NAME: &str = "Gathering Facts";
        self.callback.on_task_start(NAME, ctx.name()).await;

        let record = match ctx.connection() {
            Some(conn) => {
                let module_ctx = ModuleContext::new(ctx.name()).with_timeout(self.timeout);
                Self::apply(&SetupModule, conn.as_ref(), &ModuleParams::new(), &module_ctx).await
            }
            None => ItemRecord::unreachable("no connection to host"),
        };
        if let Some(JsonValue::Object(facts)) = record.data.get("ansible_facts") {
            ctx.merge_facts(facts);
            ctx.mark_facts_gathered();
        }

        let mut result = TaskResult::new(NAME, ctx.name(), "setup");
        result.status = record.status();
        result.msg = record.msg.clone();
        self.finish(&mut result, ctx, false).await;
        result
    }

    /// Report a host that could not be connected to
    pub async fn report_unreachable(&self, ctx: &mut HostContext, msg: String) -> TaskResult {
        let mut result = TaskResult::new("Connect", ctx.name(), "connection");
        result.status = TaskStatus::Unreachable;
        result.msg = Some(msg);
        self.finish(&mut result, ctx, false).await;
        result
    }

    #[instrument(skip_all, fields(host = %ctx.name(), task = %task.name))]
    async fn run_action(
        &self,
        task: &Task,
        action: &Action,
        ctx: &mut HostContext,
        inherited: &Inherited,
    ) -> TaskResult {
        self.callback.on_task_start(&task.name, ctx.name()).await;
        let mut result = TaskResult::new(&task.name, ctx.name(), &action.name);

        let records = match self.evaluate(task, action, ctx, inherited).await {
            Ok(records) => records,
            Err(message) => vec![ItemRecord::failed(message)],
        };

        let looped = action.loop_items.is_some();
        let registered = if looped {
            let changed = records.iter().any(|r| r.changed);
            let failed = records.iter().any(|r| r.failed || r.unreachable);
            let skipped = records.iter().all(|r| r.skipped);
            let msg = if records.is_empty() {
                "No items in the list"
            } else if failed {
                "One or more items failed"
            } else {
                "All items completed"
            };
            result.status = if records.iter().any(|r| r.unreachable) {
                TaskStatus::Unreachable
            } else if failed {
                TaskStatus::Failed
            } else if skipped {
                TaskStatus::Skipped
            } else if changed {
                TaskStatus::Changed
            } else {
                TaskStatus::Ok
            };
            result.changed = changed;
            result.msg = Some(msg.to_string());
            result.items = records
                .iter()
                .map(|r| ItemSummary {
                    label: r.label.clone().unwrap_or_default(),
                    status: r.status(),
                    msg: r.msg.clone(),
                })
                .collect();
            json!({
                "changed": changed,
                "failed": failed,
                "skipped": skipped,
                "msg": msg,
                "results": records.iter().map(ItemRecord::registered).collect::<Vec<_>>(),
            })
        } else {
            let record = records
                .first()
                .cloned()
                .unwrap_or_else(|| ItemRecord::failed("task produced no result"));
            result.status = record.status();
            result.changed = record.changed;
            result.msg = record.msg.clone();
            result.rc = record.rc();
            result.stdout = record.text("stdout");
            result.stderr = record.text("stderr");
            record.registered()
        };
        result.diff = records.iter().filter_map(|r| r.diff.clone()).collect();

        if let Some(name) = &action.register {
            ctx.register(name.clone(), registered);
        }

        if result.changed
            && !action.notify.is_empty()
            && !matches!(result.status, TaskStatus::Failed | TaskStatus::Unreachable)
        {
            ctx.notify(action.notify.iter());
        }

        let ignore_errors = task.ignore_errors.or(inherited.ignore_errors).unwrap_or(false);
        self.finish(&mut result, ctx, ignore_errors).await;
        result
    }

    /// Record stats, flag the host and report the result
    async fn finish(&self, result: &mut TaskResult, ctx: &mut HostContext, ignore_errors: bool) {
        match result.status {
            TaskStatus::Ok => ctx.stats.ok += 1,
            TaskStatus::Changed => {
                ctx.stats.ok += 1;
                ctx.stats.changed += 1;
            }
            TaskStatus::Skipped => ctx.stats.skipped += 1,
            TaskStatus::Failed if ignore_errors => {
                result.ignored = true;
                ctx.stats.ignored += 1;
                warn!(host = %result.host, task = %result.task, msg = ?result.msg, "Task failed, ignoring");
            }
            TaskStatus::Failed => {
                ctx.stats.failed += 1;
                warn!(host = %result.host, task = %result.task, msg = ?result.msg, "Task failed");
            }
            TaskStatus::Unreachable => {
                ctx.stats.unreachable += 1;
                ctx.unreachable = true;
                warn!(host = %result.host, task = %result.task, msg = ?result.msg, "Host unreachable");
            }
        }
        debug!(host = %result.host, task = %result.task, status = %result.status, "Task finished");
        self.callback.on_task_complete(result).await;
    }

    /// Expand the loop and run every item
    async fn evaluate(
        &self,
        task: &Task,
        action: &Action,
        ctx: &mut HostContext,
        inherited: &Inherited,
    ) -> Result<Vec<ItemRecord>, String> {
        let engine = self.scope.engine;
        let mut vars = ctx.template_vars(&self.scope);
        for (key, value) in inherited.vars.iter().chain(task.vars.iter()) {
            let rendered = engine
                .render_value(value, &vars)
                .map_err(|e| format!("variable '{}': {}", key, e))?;
            vars.insert(key.clone(), rendered);
        }

        let conditions: Vec<&String> = inherited.when.iter().chain(task.when.iter()).collect();

        let Some(source) = &action.loop_items else {
            return Ok(vec![self.run_item(task, action, ctx, inherited, &vars, &conditions).await]);
        };

        let items = match engine.render_value(source, &vars).map_err(|e| e.to_string())? {
            JsonValue::Array(items) => items,
            other => {
                return Err(format!(
                    "Invalid data passed to 'loop', it requires a list, got this instead: {}",
                    other
                ))
            }
        };

        let control = &action.loop_control;
        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut item_vars = vars.clone();
            item_vars.insert(control.loop_var.clone(), item.clone());
            if let Some(index_var) = &control.index_var {
                item_vars.insert(index_var.clone(), json!(index));
            }

            let label = match &control.label {
                Some(template) => engine
                    .render_str(template, &item_vars)
                    .unwrap_or_else(|_| template.clone()),
                None => match &item {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                },
            };

            let mut record = self
                .run_item(task, action, ctx, inherited, &item_vars, &conditions)
                .await;
            record.data.insert(control.loop_var.clone(), item.clone());
            if control.loop_var != "item" {
                record.data.insert("item".into(), item);
            }
            record.data.insert("ansible_loop_var".into(), json!(control.loop_var));
            record.label = Some(label);
            let stop = record.unreachable;
            records.push(record);
            if stop {
                break;
            }
        }
        Ok(records)
    }

    /// One invocation: condition, arguments, plugin, overrides
    async fn run_item(
        &self,
        task: &Task,
        action: &Action,
        ctx: &mut HostContext,
        inherited: &Inherited,
        vars: &TemplateVars,
        conditions: &[&String],
    ) -> ItemRecord {
        let engine = self.scope.engine;

        for condition in conditions {
            match engine.evaluate_condition(condition, vars) {
                Ok(true) => {}
                Ok(false) => {
                    return ItemRecord::skipped(format!(
                        "Conditional result was False: {}",
                        condition
                    ))
                }
                Err(e) => return ItemRecord::failed(e.to_string()),
            }
        }

        let mut params: ModuleParams = match engine.render_value(&action.args, vars) {
            Ok(JsonValue::Object(map)) => map.into_iter().collect(),
            Ok(other) => return ItemRecord::failed(format!("arguments must be a mapping, got {}", other)),
            Err(e) => return ItemRecord::failed(e.to_string()),
        };
        if !action.environment.is_empty() {
            let env = JsonValue::Object(action.environment.clone().into_iter().collect());
            match engine.render_value(&env, vars) {
                Ok(env) => {
                    params.insert("environment".to_string(), env);
                }
                Err(e) => return ItemRecord::failed(e.to_string()),
            }
        }

        let Some(conn) = ctx.connection() else {
            return ItemRecord::unreachable("no connection to host");
        };

        let play = self.scope.play;
        let r#become = task
            .r#become
            .or(inherited.r#become)
            .unwrap_or(play.r#become || ctx.host.r#become.unwrap_or(false));
        let become_user = task
            .become_user
            .clone()
            .or_else(|| inherited.become_user.clone())
            .or_else(|| play.become_user.clone())
            .unwrap_or_else(|| self.become_user.to_string());
        let module_ctx = ModuleContext::new(ctx.name())
            .with_check_mode(self.check_mode)
            .with_diff_mode(self.diff_mode)
            .with_become(r#become, Some(become_user))
            .with_timeout(self.timeout)
            .with_vars(Arc::new(vars.clone()));

        let max_attempts = if action.until.is_some() {
            action.retries + 1
        } else {
            1
        };
        let mut attempt = 0;
        let mut record = loop {
            attempt += 1;
            let mut record =
                Self::apply(action.module.as_ref(), conn.as_ref(), &params, &module_ctx).await;
            let Some(until) = &action.until else {
                break record;
            };
            if record.unreachable {
                break record;
            }
            record.data.insert("attempts".into(), json!(attempt));
            let check_vars = bind_result(vars, action.register.as_deref(), &record);
            match all_conditions(engine, until, &check_vars) {
                Ok(true) => break record,
                Ok(false) if attempt >= max_attempts || self.stop.is_cancelled() => {
                    record.failed = true;
                    record.msg = Some(format!("Retry limit reached after {} attempts", attempt));
                    break record;
                }
                Ok(false) => {
                    warn!(host = %ctx.name(), task = %task.name, attempt, "Condition not met, retrying");
                    tokio::time::sleep(Duration::from_secs(action.delay)).await;
                }
                Err(e) => {
                    record.failed = true;
                    record.msg = Some(e.to_string());
                    break record;
                }
            }
        };

        if let Some(JsonValue::Object(facts)) = record.data.get("ansible_facts") {
            ctx.merge_facts(facts);
        }

        if record.unreachable || record.skipped {
            return record;
        }

        if let Some(changed_when) = &action.changed_when {
            let check_vars = bind_result(vars, action.register.as_deref(), &record);
            match all_conditions(engine, changed_when, &check_vars) {
                Ok(changed) => record.changed = changed,
                Err(e) => {
                    record.failed = true;
                    record.msg = Some(e.to_string());
                }
            }
        }

        if let Some(failed_when) = &action.failed_when {
            let check_vars = bind_result(vars, action.register.as_deref(), &record);
            match all_conditions(engine, failed_when, &check_vars) {
                Ok(true) => {
                    record.failed = true;
                    if record.msg.is_none() {
                        record.msg = Some("failed_when condition matched".to_string());
                    }
                }
                Ok(false) => record.failed = false,
                Err(e) => {
                    record.failed = true;
                    record.msg = Some(e.to_string());
                }
            }
        }

        record
    }

    async fn apply(
        module: &dyn crate::modules::Module,
        conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ItemRecord {
        match execute_module(module, conn, params, context).await {
            Ok(output) => ItemRecord::from_output(output),
            Err(ModuleError::Connection(e)) if e.is_unreachable() => {
                ItemRecord::unreachable(e.to_string())
            }
            Err(e) => ItemRecord::failed(e.to_string()),
        }
    }
}

/// Variables with the current result bound under the register name
fn bind_result(vars: &TemplateVars, register: Option<&str>, record: &ItemRecord) -> TemplateVars {
    let mut bound = vars.clone();
    let registered = record.registered();
    if let Some(name) = register {
        bound.insert(name.to_string(), registered.clone());
    }
    if let JsonValue::Object(fields) = registered {
        for (key, value) in fields {
            bound.entry(key).or_insert(value);
        }
    }
    bound
}

fn all_conditions(
    engine: &crate::template::TemplateEngine,
    conditions: &[String],
    vars: &TemplateVars,
) -> crate::template::TemplateResult<bool> {
    for condition in conditions {
        if !engine.evaluate_condition(condition, vars)? {
            return Ok(false);
        }
    }
    Ok(true)
}
