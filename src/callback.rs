//! Execution events.
//!
//! The executor reports progress through an [`ExecutionCallback`]. Every
//! method has a no-op default so an implementation only overrides the events
//! it cares about. Callbacks are invoked from the host tasks concurrently, so
//! implementations synchronize their own state.

use async_trait::async_trait;

use crate::executor::task::TaskResult;
use crate::executor::PlaybookReport;

/// Receiver of execution events
#[async_trait]
pub trait ExecutionCallback: Send + Sync {
    /// Called when a playbook starts.
    async fn on_playbook_start(&self, name: &str) {
        let _ = name;
    }

    /// Called once the run is over, with the final report.
    async fn on_playbook_end(&self, report: &PlaybookReport) {
        let _ = report;
    }

    /// Called when a play starts, with the hosts it will run on.
    async fn on_play_start(&self, name: &str, hosts: &[String]) {
        let _ = (name, hosts);
    }

    /// Called when every host of a play is done.
    async fn on_play_end(&self, name: &str) {
        let _ = name;
    }

    /// Called before a task is applied to a host.
    async fn on_task_start(&self, name: &str, host: &str) {
        let _ = (name, host);
    }

    /// Called with the outcome of a task on one host.
    async fn on_task_complete(&self, result: &TaskResult) {
        let _ = result;
    }

    /// Called when a notified handler is about to run on a host.
    async fn on_handler_triggered(&self, name: &str, host: &str) {
        let _ = (name, host);
    }
}

/// Callback that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

impl ExecutionCallback for NoopCallback {}
