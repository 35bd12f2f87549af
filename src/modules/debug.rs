//! Debug module - Print debug messages and variable values
//!
//! Runs entirely on the control node. `msg` is rendered like any other
//! argument; `var` names a variable (a dotted path is allowed) that is looked
//! up in the task's variables.

use async_trait::async_trait;
use serde_json::Value;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::Connection;
use crate::template::TemplateVars;

/// Module for printing debug messages and variable values
#[derive(Debug)]
pub struct DebugModule;

impl DebugModule {
    /// Format a variable value for display
    fn format_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            _ => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        }
    }

    /// Resolve `a.b[0].c` against the variables
    fn lookup<'a>(vars: &'a TemplateVars, path: &str) -> Option<&'a Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let (name, indexes) = split_indexes(first);
        let mut current = vars.get(name)?;
        for index in indexes {
            current = current.get(index)?;
        }
        for segment in segments {
            let (key, indexes) = split_indexes(segment);
            current = current.get(key)?;
            for index in indexes {
                current = current.get(index)?;
            }
        }
        Some(current)
    }
}

fn split_indexes(segment: &str) -> (&str, Vec<usize>) {
    match segment.find('[') {
        Some(pos) => {
            let indexes = segment[pos..]
                .split(|c| c == '[' || c == ']')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            (&segment[..pos], indexes)
        }
        None => (segment, Vec::new()),
    }
}

#[async_trait]
impl Module for DebugModule {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn description(&self) -> &'static str {
        "Print a message or the value of a variable"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if params.contains_key("msg") && params.contains_key("var") {
            return Err(ModuleError::InvalidParameter(
                "msg and var are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    async fn apply(
        &self,
        _conn: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        if let Some(var) = params.get_string("var")? {
            let value = Self::lookup(&context.vars, var.trim())
                .cloned()
                .unwrap_or_else(|| Value::String("VARIABLE IS NOT DEFINED!".to_string()));
            return Ok(ModuleOutput::ok(format!("{}: {}", var, Self::format_value(&value)))
                .with_data(var, value));
        }

        let msg = match params.get("msg") {
            Some(value) => Self::format_value(value),
            None => "Hello world!".to_string(),
        };
        Ok(ModuleOutput::ok(msg))
    }
}
