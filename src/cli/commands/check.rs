//! Check command - Validate a playbook
//!
//! Parses the playbook, resolves every action and handler reference, and
//! lists what each play would target. Nothing is run.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use super::{ensure_playbook, CommandContext};
use converge::modules::ModuleRegistry;
use converge::playbook::Playbook;

/// Arguments for the check command
#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    /// Path to the playbook file
    #[arg(required = true)]
    pub playbook: PathBuf,
}

impl CheckArgs {
    /// Execute the check command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        ensure_playbook(&self.playbook)?;

        let registry = ModuleRegistry::with_builtins();
        let playbook = match Playbook::load(&self.playbook, &registry).await {
            Ok(playbook) => playbook,
            Err(e) => {
                ctx.output.error(&e.to_string());
                return Ok(e.exit_code());
            }
        };
        let inventory = ctx.load_inventory()?;

        for play in &playbook.plays {
            let hosts = match inventory.hosts_for_pattern(&play.hosts) {
                Ok(hosts) => hosts.iter().map(|h| h.name.clone()).collect::<Vec<_>>(),
                Err(e) => {
                    ctx.output.error(&e.to_string());
                    return Ok(converge::Error::from(e).exit_code());
                }
            };
            ctx.output.play_header(&play.name);
            ctx.output.info(&format!(
                "  hosts ({}): {}",
                hosts.len(),
                if hosts.is_empty() {
                    "none".to_string()
                } else {
                    hosts.join(", ")
                }
            ));
            ctx.output.info(&format!(
                "  tasks: {}  handlers: {}",
                play.tasks.len(),
                play.handlers.len()
            ));
            for task in &play.tasks {
                ctx.output.info(&format!("    - {}", task.name));
            }
        }

        ctx.output.info(&format!(
            "\nplaybook: {} ({} plays, {} tasks) is valid",
            self.playbook.display(),
            playbook.plays.len(),
            playbook.task_count()
        ));
        Ok(0)
    }
}
