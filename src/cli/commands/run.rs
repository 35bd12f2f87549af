//! Run command - Execute a playbook
//!
//! Loads the inventory and playbook, then converges every play. Ctrl-C stops
//! issuing new tasks; tasks already running finish and are reported.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{ensure_playbook, CommandContext};
use crate::cli::output::{ConsoleCallback, OutputFormatter};
use converge::connection::DefaultConnectionFactory;
use converge::executor::Executor;
use converge::modules::ModuleRegistry;
use converge::playbook::Playbook;

/// Arguments for the run command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the playbook file
    #[arg(required = true)]
    pub playbook: PathBuf,

    /// Halt the whole run on the first host failure
    #[arg(long)]
    pub any_errors_fatal: bool,

    /// Stop issuing tasks after this many seconds
    #[arg(long, value_name = "SECS")]
    pub run_timeout: Option<u64>,
}

impl RunArgs {
    /// Execute the run command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        ensure_playbook(&self.playbook)?;

        let registry = ModuleRegistry::with_builtins();
        let playbook = Playbook::load(&self.playbook, &registry)
            .await
            .with_context(|| format!("Failed to load playbook: {}", self.playbook.display()))?;
        let inventory = ctx.load_inventory()?;

        let mut config = ctx.executor_config()?;
        if self.any_errors_fatal {
            config.any_errors_fatal = true;
        }
        if let Some(secs) = self.run_timeout {
            config.run_timeout = Some(Duration::from_secs(secs));
        }
        if config.check_mode {
            ctx.output
                .warning("Running in check mode, no changes will be made");
        }

        let connections = DefaultConnectionFactory::new(ctx.config.ssh.clone())
            .with_timeout(ctx.config.ssh.connect_timeout);
        let callback = ConsoleCallback::new(OutputFormatter::new(
            ctx.config.output.color,
            ctx.verbosity,
        ));
        let executor = Executor::new(config, Arc::new(inventory), Arc::new(connections))
            .with_callback(Arc::new(callback));

        let token = executor.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing running tasks");
                token.cancel();
            }
        });

        let report = executor.run(&playbook).await;
        interrupt.abort();
        let report = report?;

        if let Some(err) = report.error() {
            ctx.output.error(&err.to_string());
        }
        Ok(report.exit_code())
    }
}
