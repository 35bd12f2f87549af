//! Playbook definitions and parsing.
//!
//! A playbook is a YAML list of plays. Parsing happens in two steps: the
//! document is first deserialized into loose `*Definition` structs, then
//! compiled into [`Playbook`]/[`Play`]/[`Task`] with every action resolved
//! against the [`ModuleRegistry`] and every `notify` checked against the
//! play's handlers. A playbook that loads is therefore free of unknown
//! actions and dangling handler references before anything runs.

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::modules::{Module, ModuleRegistry};

/// Actions whose string form is a raw command line rather than `k=v` pairs
const FREE_FORM_ACTIONS: &[&str] = &["shell", "command", "raw"];

/// `key=value` options allowed inside a free-form command line
static FREE_FORM_OPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|\s)(chdir|creates|removes|executable)=("[^"]*"|'[^']*'|\S+)"#)
        .expect("valid free-form option regex")
});

fn deserialize_opt_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value = JsonValue::deserialize(deserializer)?;
    match &value {
        JsonValue::Bool(b) => Ok(Some(*b)),
        JsonValue::String(s) => match s.to_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Ok(Some(true)),
            "no" | "false" | "off" | "0" => Ok(Some(false)),
            _ => Err(D::Error::custom(format!("invalid boolean string: {}", s))),
        },
        JsonValue::Number(n) => Ok(Some(n.as_i64() != Some(0))),
        JsonValue::Null => Ok(None),
        _ => Err(D::Error::custom(format!("invalid boolean value: {}", value))),
    }
}

/// A condition: a bare bool, one expression, or a list ANDed together
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Conditional {
    Bool(bool),
    Single(String),
    List(Vec<JsonValue>),
}

impl Conditional {
    fn into_conditions(self) -> Vec<String> {
        match self {
            Conditional::Bool(b) => vec![b.to_string()],
            Conditional::Single(s) => vec![s],
            Conditional::List(list) => list
                .into_iter()
                .map(|v| match v {
                    JsonValue::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
        }
    }
}

/// A string or a list of strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Loop control options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoopControl {
    /// Variable the current item is bound to
    #[serde(default = "default_loop_var")]
    pub loop_var: String,
    /// Variable the current index is bound to
    #[serde(default)]
    pub index_var: Option<String>,
    /// Template used to label items in output
    #[serde(default)]
    pub label: Option<String>,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            loop_var: default_loop_var(),
            index_var: None,
            label: None,
        }
    }
}

fn default_loop_var() -> String {
    "item".to_string()
}

/// Play definition from YAML
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlayDefinition {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    hosts: Option<OneOrMany>,
    #[serde(default, rename = "become", deserialize_with = "deserialize_opt_bool")]
    become_: Option<bool>,
    #[serde(default)]
    become_user: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_bool")]
    gather_facts: Option<bool>,
    #[serde(default)]
    vars: IndexMap<String, JsonValue>,
    #[serde(default)]
    tasks: Vec<TaskDefinition>,
    #[serde(default)]
    handlers: Vec<TaskDefinition>,
    #[serde(default, deserialize_with = "deserialize_opt_bool")]
    any_errors_fatal: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_opt_bool")]
    force_handlers: Option<bool>,
}

/// Task (or handler) definition from YAML
#[derive(Debug, Deserialize)]
struct TaskDefinition {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    when: Option<Conditional>,
    #[serde(default)]
    register: Option<String>,
    #[serde(default)]
    notify: Option<OneOrMany>,
    #[serde(default)]
    listen: Option<OneOrMany>,
    #[serde(default, rename = "loop", alias = "with_items")]
    loop_items: Option<JsonValue>,
    #[serde(default)]
    loop_control: Option<LoopControl>,
    #[serde(default)]
    changed_when: Option<Conditional>,
    #[serde(default)]
    failed_when: Option<Conditional>,
    #[serde(default)]
    until: Option<Conditional>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    delay: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_opt_bool")]
    ignore_errors: Option<bool>,
    #[serde(default, rename = "become", deserialize_with = "deserialize_opt_bool")]
    become_: Option<bool>,
    #[serde(default)]
    become_user: Option<String>,
    #[serde(default)]
    args: Option<IndexMap<String, JsonValue>>,
    #[serde(default)]
    vars: IndexMap<String, JsonValue>,
    #[serde(default)]
    environment: IndexMap<String, JsonValue>,
    #[serde(default)]
    block: Option<Vec<TaskDefinition>>,
    #[serde(default)]
    rescue: Option<Vec<TaskDefinition>>,
    #[serde(default)]
    always: Option<Vec<TaskDefinition>>,
    /// The action key and its arguments
    #[serde(flatten)]
    action: IndexMap<String, JsonValue>,
}

/// A parsed and resolved playbook
#[derive(Debug, Clone)]
pub struct Playbook {
    /// Name derived from the file name
    pub name: String,
    /// Path the playbook was loaded from
    pub path: Option<PathBuf>,
    /// Plays in declared order
    pub plays: Vec<Play>,
}

/// A play: a host pattern mapped to tasks and handlers
#[derive(Debug, Clone)]
pub struct Play {
    pub name: String,
    /// Host pattern resolved against the inventory
    pub hosts: String,
    pub r#become: bool,
    pub become_user: Option<String>,
    /// `None` falls back to the configured default
    pub gather_facts: Option<bool>,
    pub vars: IndexMap<String, JsonValue>,
    pub tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
    /// `None` falls back to the configured default
    pub any_errors_fatal: Option<bool>,
    pub force_handlers: bool,
}

/// A task: either one action or a block of tasks
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    /// Conditions ANDed together
    pub when: Vec<String>,
    pub ignore_errors: Option<bool>,
    pub r#become: Option<bool>,
    pub become_user: Option<String>,
    /// Task-scoped variables
    pub vars: IndexMap<String, JsonValue>,
    pub body: TaskBody,
}

/// What a task does
#[derive(Debug, Clone)]
pub enum TaskBody {
    /// Apply one action plugin
    Action(Box<Action>),
    /// Run a group of tasks with optional rescue and always sections
    Block {
        block: Vec<Task>,
        rescue: Vec<Task>,
        always: Vec<Task>,
    },
}

/// A resolved action invocation
#[derive(Debug, Clone)]
pub struct Action {
    /// Action name as written in the playbook
    pub name: String,
    /// The plugin, resolved at load time
    pub module: Arc<dyn Module>,
    /// Arguments (a JSON object, possibly containing templates)
    pub args: JsonValue,
    /// Loop source: a list or a template yielding one
    pub loop_items: Option<JsonValue>,
    pub loop_control: LoopControl,
    pub register: Option<String>,
    pub notify: Vec<String>,
    pub changed_when: Option<Vec<String>>,
    pub failed_when: Option<Vec<String>>,
    pub until: Option<Vec<String>>,
    pub retries: u32,
    /// Seconds between retries
    pub delay: u64,
    pub environment: IndexMap<String, JsonValue>,
}

/// A handler: a task that runs when notified
#[derive(Debug, Clone)]
pub struct Handler {
    pub name: String,
    /// Extra notification topics this handler answers to
    pub listen: Vec<String>,
    pub task: Task,
}

impl Handler {
    /// Whether a notification name triggers this handler
    pub fn answers_to(&self, notification: &str) -> bool {
        self.name == notification || self.listen.iter().any(|l| l == notification)
    }
}

impl Playbook {
    /// Load and resolve a playbook file
    pub async fn load(path: impl AsRef<Path>, registry: &ModuleRegistry) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::playbook_parse(path, format!("Failed to read file: {}", e), None)
        })?;
        Self::from_yaml(&content, Some(path.to_path_buf()), registry)
    }

    /// Parse and resolve a playbook from YAML
    pub fn from_yaml(
        yaml: &str,
        path: Option<PathBuf>,
        registry: &ModuleRegistry,
    ) -> Result<Self> {
        let source = path.clone().unwrap_or_else(|| PathBuf::from("<string>"));
        let definitions: Vec<PlayDefinition> = serde_yaml::from_str(yaml)
            .map_err(|e| Error::playbook_parse(&source, e.to_string(), Some(e)))?;

        if definitions.is_empty() {
            return Err(Error::PlaybookValidation(
                "Playbook must contain at least one play".to_string(),
            ));
        }

        let plays = definitions
            .into_iter()
            .enumerate()
            .map(|(idx, def)| compile_play(def, idx, registry))
            .collect::<Result<Vec<_>>>()?;

        let name = path
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "playbook".to_string());

        Ok(Self { name, path, plays })
    }

    /// Total number of tasks across all plays, counting block members
    pub fn task_count(&self) -> usize {
        self.plays.iter().map(|p| count_tasks(&p.tasks)).sum()
    }
}

fn count_tasks(tasks: &[Task]) -> usize {
    tasks
        .iter()
        .map(|t| match &t.body {
            TaskBody::Action(_) => 1,
            TaskBody::Block {
                block,
                rescue,
                always,
            } => count_tasks(block) + count_tasks(rescue) + count_tasks(always),
        })
        .sum()
}

fn compile_play(def: PlayDefinition, idx: usize, registry: &ModuleRegistry) -> Result<Play> {
    let hosts = def
        .hosts
        .map(|h| h.into_vec().join(":"))
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| {
            Error::PlaybookValidation(format!(
                "Play {} ({}) has no hosts",
                idx + 1,
                def.name.as_deref().unwrap_or("unnamed")
            ))
        })?;
    let name = def.name.unwrap_or_else(|| hosts.clone());

    let tasks = def
        .tasks
        .into_iter()
        .map(|t| compile_task(t, registry))
        .collect::<Result<Vec<_>>>()?;

    let handlers = def
        .handlers
        .into_iter()
        .map(|h| {
            let listen = h.listen.clone().map(OneOrMany::into_vec).unwrap_or_default();
            let task = compile_task(h, registry)?;
            Ok(Handler {
                name: task.name.clone(),
                listen,
                task,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let play = Play {
        name,
        hosts,
        r#become: def.become_.unwrap_or(false),
        become_user: def.become_user,
        gather_facts: def.gather_facts,
        vars: def.vars,
        tasks,
        handlers,
        any_errors_fatal: def.any_errors_fatal,
        force_handlers: def.force_handlers.unwrap_or(false),
    };
    check_notifications(&play)?;
    Ok(play)
}

/// Every `notify` must name a handler or a `listen` topic of the play
fn check_notifications(play: &Play) -> Result<()> {
    fn walk(tasks: &[Task], play: &Play) -> Result<()> {
        for task in tasks {
            match &task.body {
                TaskBody::Action(action) => {
                    for name in &action.notify {
                        if !play.handlers.iter().any(|h| h.answers_to(name)) {
                            return Err(Error::HandlerNotFound {
                                task: task.name.clone(),
                                handler: name.clone(),
                                play: play.name.clone(),
                            });
                        }
                    }
                }
                TaskBody::Block {
                    block,
                    rescue,
                    always,
                } => {
                    walk(block, play)?;
                    walk(rescue, play)?;
                    walk(always, play)?;
                }
            }
        }
        Ok(())
    }

    walk(&play.tasks, play)?;
    let handler_tasks: Vec<Task> = play.handlers.iter().map(|h| h.task.clone()).collect();
    walk(&handler_tasks, play)
}

fn compile_tasks(defs: Option<Vec<TaskDefinition>>, registry: &ModuleRegistry) -> Result<Vec<Task>> {
    defs.unwrap_or_default()
        .into_iter()
        .map(|t| compile_task(t, registry))
        .collect()
}

fn compile_task(def: TaskDefinition, registry: &ModuleRegistry) -> Result<Task> {
    let when = def.when.map(Conditional::into_conditions).unwrap_or_default();

    if def.block.is_some() {
        if !def.action.is_empty() {
            return Err(Error::PlaybookValidation(format!(
                "Block '{}' must not also name an action ({})",
                def.name.as_deref().unwrap_or("block"),
                def.action.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
        return Ok(Task {
            name: def.name.unwrap_or_else(|| "block".to_string()),
            when,
            ignore_errors: def.ignore_errors,
            r#become: def.become_,
            become_user: def.become_user,
            vars: def.vars,
            body: TaskBody::Block {
                block: compile_tasks(def.block, registry)?,
                rescue: compile_tasks(def.rescue, registry)?,
                always: compile_tasks(def.always, registry)?,
            },
        });
    }

    let mut action_keys = def.action.into_iter();
    let (action_name, raw_args) = match (action_keys.next(), action_keys.next()) {
        (Some(entry), None) => entry,
        (None, _) => {
            return Err(Error::PlaybookValidation(format!(
                "Task '{}' has no action",
                def.name.as_deref().unwrap_or("unnamed")
            )))
        }
        (Some((first, _)), Some((second, _))) => {
            return Err(Error::PlaybookValidation(format!(
                "Task '{}' has more than one action: {}, {}",
                def.name.as_deref().unwrap_or("unnamed"),
                first,
                second
            )))
        }
    };

    let name = def.name.unwrap_or_else(|| action_name.clone());
    let module = registry
        .get(&action_name)
        .ok_or_else(|| Error::UnknownAction {
            task: name.clone(),
            action: action_name.clone(),
        })?;

    let mut args = parse_action_args(&action_name, raw_args).map_err(|message| {
        Error::PlaybookValidation(format!("Task '{}': {}", name, message))
    })?;
    if let Some(extra) = def.args {
        for (key, value) in extra {
            args.entry(key).or_insert(value);
        }
    }

    let until_set = def.until.is_some();
    let action = Action {
        name: action_name,
        module,
        args: JsonValue::Object(args),
        loop_items: def.loop_items,
        loop_control: def.loop_control.unwrap_or_default(),
        register: def.register,
        notify: dedup(def.notify.map(OneOrMany::into_vec).unwrap_or_default()),
        changed_when: def.changed_when.map(Conditional::into_conditions),
        failed_when: def.failed_when.map(Conditional::into_conditions),
        until: def.until.map(Conditional::into_conditions),
        retries: def.retries.unwrap_or(if until_set { 3 } else { 0 }),
        delay: def.delay.unwrap_or(5),
        environment: def.environment,
    };

    Ok(Task {
        name,
        when,
        ignore_errors: def.ignore_errors,
        r#become: def.become_,
        become_user: def.become_user,
        vars: def.vars,
        body: TaskBody::Action(Box::new(action)),
    })
}

fn dedup(names: Vec<String>) -> Vec<String> {
    names.into_iter().collect::<IndexSet<_>>().into_iter().collect()
}

/// Turn an action's value into an argument map.
///
/// Accepts a mapping, nothing at all, a free-form command line for command
/// actions, or `key=value` pairs for everything else.
fn parse_action_args(
    action: &str,
    value: JsonValue,
) -> std::result::Result<serde_json::Map<String, JsonValue>, String> {
    match value {
        JsonValue::Object(map) => Ok(map),
        JsonValue::Null => Ok(serde_json::Map::new()),
        JsonValue::String(s) => {
            let short = action.trim_start_matches("ansible.builtin.");
            if FREE_FORM_ACTIONS.contains(&short) {
                Ok(parse_free_form(&s))
            } else {
                parse_key_values(&s)
            }
        }
        other => Err(format!(
            "arguments for '{}' must be a mapping or a string, got {}",
            action, other
        )),
    }
}

fn parse_free_form(line: &str) -> serde_json::Map<String, JsonValue> {
    let mut args = serde_json::Map::new();
    for caps in FREE_FORM_OPTION.captures_iter(line) {
        let value = caps[2].trim_matches(|c| c == '"' || c == '\'');
        args.insert(caps[1].to_string(), JsonValue::String(value.to_string()));
    }
    let raw = FREE_FORM_OPTION.replace_all(line, "").trim().to_string();
    args.insert("_raw_params".to_string(), JsonValue::String(raw));
    args
}

fn parse_key_values(line: &str) -> std::result::Result<serde_json::Map<String, JsonValue>, String> {
    let mut args = serde_json::Map::new();
    for word in split_key_values(line)? {
        let (key, value) = word
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", word))?;
        args.insert(key.to_string(), JsonValue::String(unquote(value).to_string()));
    }
    Ok(args)
}

/// Split `key=value` pairs on whitespace, keeping quoted values and
/// `{{ }}` / `{% %}` blocks whole.
fn split_key_values(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if quote.is_none() && matches!(chars.peek(), Some(&'{') | Some(&'%')) => {
                depth += 1;
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '}' | '%' if quote.is_none() && depth > 0 && chars.peek() == Some(&'}') => {
                depth -= 1;
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' | '\'' if depth == 0 => {
                match quote {
                    Some(q) if q == c => quote = None,
                    None => quote = Some(c),
                    Some(_) => {}
                }
                current.push(c);
            }
            c if c.is_whitespace() && quote.is_none() && depth == 0 => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if quote.is_some() {
        return Err(format!("cannot parse '{}': unterminated quote", line));
    }
    if depth > 0 {
        return Err(format!("cannot parse '{}': unterminated template", line));
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
