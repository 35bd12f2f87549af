//! Inventory commands - List hosts
//!
//! `list-hosts` accepts either a host pattern or a playbook path; for a
//! playbook it lists the hosts of every play.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;

use super::CommandContext;
use converge::modules::ModuleRegistry;
use converge::playbook::Playbook;

/// Arguments for list-hosts command
#[derive(Parser, Debug, Clone)]
pub struct ListHostsArgs {
    /// Host pattern or playbook file
    #[arg(default_value = "all")]
    pub pattern: String,

    /// Show host variables
    #[arg(long)]
    pub vars: bool,
}

impl ListHostsArgs {
    /// Execute the list-hosts command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let inventory = ctx.load_inventory()?;

        let path = Path::new(&self.pattern);
        let is_playbook = path.is_file()
            && path
                .extension()
                .map_or(false, |ext| ext == "yml" || ext == "yaml");

        let targets: Vec<(String, String)> = if is_playbook {
            let playbook = Playbook::load(path, &ModuleRegistry::with_builtins())
                .await
                .with_context(|| format!("Failed to load playbook: {}", path.display()))?;
            playbook
                .plays
                .iter()
                .map(|p| (p.name.clone(), p.hosts.clone()))
                .collect()
        } else {
            vec![(self.pattern.clone(), self.pattern.clone())]
        };

        for (title, pattern) in targets {
            let mut hosts = inventory.hosts_for_pattern(&pattern)?;
            if let Some(limit) = &ctx.limit {
                let allowed = inventory.hosts_for_pattern(limit)?;
                hosts.retain(|h| allowed.iter().any(|a| a.name == h.name));
            }

            if is_playbook {
                ctx.output.info(&format!("play: {} ({})", title, pattern));
            }
            ctx.output.info(&format!("  hosts ({}):", hosts.len()));
            for host in hosts {
                ctx.output.info(&format!("    {}", host.name));
                if self.vars {
                    for (key, value) in inventory.host_vars(host) {
                        ctx.output.info(&format!("      {}: {}", key, value));
                    }
                }
            }
        }
        Ok(0)
    }
}
