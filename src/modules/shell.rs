//! Shell module - Execute shell commands
//!
//! Runs the command line through `sh -c` on the target, so pipes, redirects
//! and expansion work. Like `command`, it never reports a change by itself.

use async_trait::async_trait;

use super::command::{command_text, run_command_line};
use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::{shell_quote, Connection};

/// Module for executing shell commands
#[derive(Debug)]
pub struct ShellModule;

impl ShellModule {
    fn build_command(params: &ModuleParams) -> ModuleResult<String> {
        let text = command_text(params)?
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ModuleError::MissingParameter("cmd (or free-form command)".to_string()))?;

        Ok(match params.get_string("executable")? {
            Some(shell) => format!("{} -c {}", shell_quote(&shell), shell_quote(&text)),
            None => text,
        })
    }
}

#[async_trait]
impl Module for ShellModule {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn description(&self) -> &'static str {
        "Execute shell commands"
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
