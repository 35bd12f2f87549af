//! Command module - Execute arbitrary commands
//!
//! Runs a program with its arguments quoted, so nothing is interpreted by a
//! shell. For pipes, redirects and variable expansion use the shell module.
//!
//! Running a command is never considered a change on its own: the result is
//! `ok` with rc, stdout and stderr captured, and a task has to opt in with
//! `changed_when` to report otherwise. A non-zero rc fails the task unless
//! `failed_when` says differently.

use async_trait::async_trait;
use std::path::Path;
use std::time::Instant;

use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::{shell_quote, Connection, ExecuteOptions};

/// Shell syntax the command module refuses to pass through
const SHELL_OPERATORS: &[&str] = &["|", "||", "&&", ";", ">", ">>", "<", "&"];

/// Module for executing commands directly
#[derive(Debug)]
pub struct CommandModule;

/// The command text from `cmd` or the free-form `_raw_params`
pub(crate) fn command_text(params: &ModuleParams) -> ModuleResult<Option<String>> {
    match params.get_string("cmd")? {
        Some(cmd) => Ok(Some(cmd)),
        None => params.get_string("_raw_params"),
    }
}

/// Handle `creates`/`removes`; returns an output when the command must not run
pub(crate) async fn check_creates_removes(
    conn: &dyn Connection,
    params: &ModuleParams,
) -> ModuleResult<Option<ModuleOutput>> {
    if let Some(creates) = params.get_string("creates")? {
        if conn.path_exists(Path::new(&creates)).await? {
            return Ok(Some(
                ModuleOutput::ok(format!("skipped, since {} exists", creates))
                    .with_data("rc", serde_json::json!(0)),
            ));
        }
    }

    if let Some(removes) = params.get_string("removes")? {
        if !conn.path_exists(Path::new(&removes)).await? {
            return Ok(Some(
                ModuleOutput::ok(format!("skipped, since {} does not exist", removes))
                    .with_data("rc", serde_json::json!(0)),
            ));
        }
    }

    Ok(None)
}

/// Execute a prepared command line and turn the outcome into module output
pub(crate) async fn run_command_line(
    conn: &dyn Connection,
    params: &ModuleParams,
    context: &ModuleContext,
    command: &str,
) -> ModuleResult<ModuleOutput> {
    if let Some(output) = check_creates_removes(conn, params).await? {
        return Ok(output);
    }

    if context.check_mode {
        return Ok(ModuleOutput::skipped(format!(
            "Would run: {} (commands are not run in check mode)",
            command
        )));
    }

    let mut options: ExecuteOptions = context.exec_options();
    if let Some(chdir) = params.get_string("chdir")? {
        options = options.with_cwd(chdir);
    }
    if let Some(serde_json::Value::Object(env)) = params.get("environment") {
        for (key, value) in env {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            options = options.with_env(key.clone(), value);
        }
    }

    let started = Instant::now();
    let result = conn.execute(command, Some(options)).await?;
    let delta = started.elapsed();

    let output = if result.success {
        ModuleOutput::ok(String::new())
    } else {
        ModuleOutput::failed("non-zero return code")
    };

    Ok(output
        .with_command_result(&result)
        .with_data("cmd", serde_json::json!(command))
        .with_data("delta", serde_json::json!(format!("{:.6}s", delta.as_secs_f64()))))
}

impl CommandModule {
    fn build_command(params: &ModuleParams) -> ModuleResult<String> {
        let argv = match params.get_vec_string("argv")? {
            Some(argv) => argv,
            None => {
                let text = command_text(params)?.ok_or_else(|| {
                    ModuleError::MissingParameter("cmd (or free-form command)".to_string())
                })?;
                shell_words::split(&text).map_err(|e| {
                    ModuleError::InvalidParameter(format!("Cannot parse command '{}': {}", text, e))
                })?
            }
        };

        if argv.is_empty() {
            return Err(ModuleError::InvalidParameter(
                "command cannot be empty".to_string(),
            ));
        }
        if let Some(op) = argv.iter().find(|a| SHELL_OPERATORS.contains(&a.as_str())) {
            return Err(ModuleError::InvalidParameter(format!(
                "shell operator '{}' is not supported by command, use shell instead",
                op
            )));
        }

        Ok(argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" "))
    }
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Execute a command without a shell"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        Self::build_command(params).map(|_| ())
    }

    async fn apply(
        &self,
        conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let command = Self::build_command(params)?;
        run_command_line(conn, params, context, &command).await
    }
}
