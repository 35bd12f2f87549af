//! Line-in-file module - Manage lines in text files
//!
//! Ensures a particular line is in a file, or replaces an existing line
//! matched by a regular expression. The file is read through the connection,
//! edited in memory and written back only when the edit changed it.

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;

use super::{
    Diff, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::{shell_quote, Connection};

/// Desired state for a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Present,
    Absent,
}

impl LineState {
    pub fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "present" => Ok(LineState::Present),
            "absent" => Ok(LineState::Absent),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: present, absent",
                s
            ))),
        }
    }
}

/// Where to insert a line that matched nothing
#[derive(Debug, Clone)]
enum Anchor {
    EndOfFile,
    BeginningOfFile,
    After(Regex),
    Before(Regex),
}

/// A single in-memory edit
#[derive(Debug)]
struct LineEdit {
    state: LineState,
    line: Option<String>,
    regexp: Option<Regex>,
    anchor: Anchor,
    backrefs: bool,
    firstmatch: bool,
}

impl LineEdit {
    fn from_params(params: &ModuleParams) -> ModuleResult<Self> {
        let state = LineState::from_str(
            &params
                .get_string("state")?
                .unwrap_or_else(|| "present".to_string()),
        )?;
        let line = params.get_string("line")?;
        let regexp = params
            .get_string("regexp")?
            .map(|r| {
                Regex::new(&r).map_err(|e| {
                    ModuleError::InvalidParameter(format!("Invalid regexp '{}': {}", r, e))
                })
            })
            .transpose()?;

        let anchor = match (
            params.get_string("insertafter")?,
            params.get_string("insertbefore")?,
        ) {
            (Some(p), _) if p == "EOF" => Anchor::EndOfFile,
            (Some(p), _) => Anchor::After(compile_anchor(&p, "insertafter")?),
            (None, Some(p)) if p == "BOF" => Anchor::BeginningOfFile,
            (None, Some(p)) => Anchor::Before(compile_anchor(&p, "insertbefore")?),
            (None, None) => Anchor::EndOfFile,
        };

        let backrefs = params.get_bool_or("backrefs", false);

        if state == LineState::Present && line.is_none() {
            return Err(ModuleError::MissingParameter(
                "line (required with state=present)".to_string(),
            ));
        }
        if state == LineState::Absent && line.is_none() && regexp.is_none() {
            return Err(ModuleError::MissingParameter(
                "regexp or line (required with state=absent)".to_string(),
            ));
        }
        if backrefs && regexp.is_none() {
            return Err(ModuleError::InvalidParameter(
                "backrefs requires regexp".to_string(),
            ));
        }

        Ok(Self {
            state,
            line,
            regexp,
            anchor,
            backrefs,
            firstmatch: params.get_bool_or("firstmatch", false),
        })
    }

    /// Apply the edit; returns whether the lines changed
    fn apply(&self, lines: &mut Vec<String>) -> bool {
        match self.state {
            LineState::Present => self.ensure_present(lines),
            LineState::Absent => self.ensure_absent(lines),
        }
    }

    fn ensure_present(&self, lines: &mut Vec<String>) -> bool {
        let line = self.line.as_deref().unwrap_or_default();

        if let Some(re) = &self.regexp {
            let matched = if self.firstmatch {
                lines.iter().position(|l| re.is_match(l))
            } else {
                lines.iter().rposition(|l| re.is_match(l))
            };
            if let Some(idx) = matched {
                let replacement = if self.backrefs {
                    re.replace(&lines[idx], expand_backrefs(line).as_str())
                        .into_owned()
                } else {
                    line.to_string()
                };
                if lines[idx] == replacement {
                    return false;
                }
                lines[idx] = replacement;
                return true;
            }
            if self.backrefs {
                return false;
            }
        }

        if lines.iter().any(|l| l == line) {
            return false;
        }

        let position = match &self.anchor {
            Anchor::EndOfFile => lines.len(),
            Anchor::BeginningOfFile => 0,
            Anchor::After(re) => lines
                .iter()
                .rposition(|l| re.is_match(l))
                .map_or(lines.len(), |i| i + 1),
            Anchor::Before(re) => lines
                .iter()
                .position(|l| re.is_match(l))
                .unwrap_or(lines.len()),
        };
        lines.insert(position, line.to_string());
        true
    }

    fn ensure_absent(&self, lines: &mut Vec<String>) -> bool {
        let before = lines.len();
        lines.retain(|l| match (&self.regexp, &self.line) {
            (Some(re), _) => !re.is_match(l),
            (None, Some(line)) => l != line,
            (None, None) => true,
        });
        lines.len() != before
    }
}

fn compile_anchor(pattern: &str, param: &str) -> ModuleResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| ModuleError::InvalidParameter(format!("Invalid {} regex: {}", param, e)))
}

/// Translate `\1`-style references to the `${1}` syntax of `regex`
fn expand_backrefs(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('\\', Some(d)) if d.is_ascii_digit() => {
                out.push_str(&format!("${{{}}}", d));
                chars.next();
            }
            ('$', _) => out.push_str("$$"),
            _ => out.push(c),
        }
    }
    out
}

fn split_lines(content: &str) -> Vec<String> {
    content.lines().map(String::from).collect()
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    }
}

/// Module for managing lines in files
#[derive(Debug)]
pub struct LineinfileModule;

#[async_trait]
impl Module for LineinfileModule {
    fn name(&self) -> &'static str {
        "lineinfile"
    }

    fn description(&self) -> &'static str {
        "Ensure a particular line is in a file, or replace an existing line using regex"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        params.get_mode("mode")?;
        LineEdit::from_params(params).map(|_| ())
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path_str = params.get_string_required("path")?;
        let path = Path::new(&path_str);
        let edit = LineEdit::from_params(params)?;
        let create = params.get_bool_or("create", false);
        let mode = params.get_mode("mode")?;

        let stat = conn.stat(path).await?;
        let original = match stat {
            Some(s) if s.is_dir => {
                return Err(ModuleError::ExecutionFailed(format!(
                    "Path {} is a directory",
                    path_str
                )))
            }
            Some(_) => String::from_utf8_lossy(&conn.download_content(path).await?).into_owned(),
            None if edit.state == LineState::Absent => {
                return Ok(ModuleOutput::ok(format!("File {} does not exist", path_str)));
            }
            None if !create => {
                return Err(ModuleError::ExecutionFailed(format!(
                    "Destination {} does not exist",
                    path_str
                )));
            }
            None => String::new(),
        };

        let mut lines = split_lines(&original);
        let edited = edit.apply(&mut lines);
        let updated = join_lines(&lines);
        let content_changed = edited || (stat.is_none() && create);
        let mode_changed = match (mode, stat) {
            (Some(want), Some(s)) => s.mode != want,
            _ => false,
        };

        if !content_changed && !mode_changed {
            return Ok(ModuleOutput::ok(format!("{} already as desired", path_str)));
        }

        let diff = context
            .diff_mode
            .then(|| Diff::unified(&path_str, &original, &updated));
        let msg = match (content_changed, edit.state) {
            (true, LineState::Present) => "line added or replaced",
            (true, LineState::Absent) => "line removed",
            (false, _) => "mode changed",
        };

        if !context.check_mode {
            if params.get_bool_or("backup", false) && content_changed && stat.is_some() {
                let backup = format!("{}.bak", path_str);
                context
                    .run_checked(
                        conn,
                        &format!("cp -p {} {}", shell_quote(&path_str), shell_quote(&backup)),
                    )
                    .await?;
            }
            if content_changed {
                let mut options = context.transfer_options();
                options.mode = mode;
                options.create_dirs = create;
                conn.upload_content(updated.as_bytes(), path, Some(options))
                    .await?;
            } else if let Some(mode) = mode {
                context
                    .run_checked(conn, &format!("chmod {:o} {}", mode, shell_quote(&path_str)))
                    .await?;
            }
        }

        let mut output = ModuleOutput::changed(msg);
        if let Some(diff) = diff {
            output = output.with_diff(diff);
        }
        Ok(output)
    }
}
