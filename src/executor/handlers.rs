//! Handler dispatch
//!
//! Tasks that changed add handler names to the host's pending set. Once the
//! play's tasks are done the set is drained: each notification resolves to
//! the handlers whose name or `listen` topic matches it, and every handler
//! runs at most once, in the order it was first notified. A handler that
//! changes may notify further handlers, which join the same flush.

use std::collections::HashSet;

use indexmap::IndexSet;
use tracing::{debug, info};

use crate::executor::runtime::HostContext;
use crate::executor::task::{Flow, Inherited, TaskExecutor, TaskResult};
use crate::playbook::Handler;

/// Handler indices for a batch of notifications, in notification order
pub fn resolve(handlers: &[Handler], notified: &IndexSet<String>) -> Vec<usize> {
    let mut order: IndexSet<usize> = IndexSet::new();
    for name in notified {
        for (idx, handler) in handlers.iter().enumerate() {
            if handler.answers_to(name) {
                order.insert(idx);
            }
        }
    }
    order.into_iter().collect()
}

/// Run the host's pending handlers
pub async fn flush(
    executor: &TaskExecutor<'_>,
    handlers: &[Handler],
    ctx: &mut HostContext,
    results: &mut Vec<TaskResult>,
) -> Flow {
    let mut ran: HashSet<usize> = HashSet::new();

    while ctx.has_pending_handlers() {
        let notified = ctx.take_pending_handlers();
        for idx in resolve(handlers, &notified) {
            if !ran.insert(idx) {
                debug!(host = %ctx.name(), handler = %handlers[idx].name, "Handler already ran");
                continue;
            }
            if executor.stop.is_cancelled() {
                ctx.cancelled = true;
                return Flow::Stopped;
            }

            let handler = &handlers[idx];
            info!(host = %ctx.name(), handler = %handler.name, "Running handler");
            executor
                .callback
                .on_handler_triggered(&handler.name, ctx.name())
                .await;
            let flow = executor
                .run_task(&handler.task, ctx, &Inherited::default(), results)
                .await;
            if flow != Flow::Continue {
                return flow;
            }
        }
    }

    Flow::Continue
}
