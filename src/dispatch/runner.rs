//! One-shot execution of a single task on a pool worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::context::{ContextScope, ExecutionContext};
use super::dispatcher::Core;
use super::queue::{Advance, Claim, ContextQueue, Dispatch};
use crate::error::Result;
use crate::model::{TaskOutcome, WorkerId};
use crate::telemetry::dispatch::{record_outcome, start_task_span};

/// Runs one task, then advances its queue.
///
/// Whatever the body does (return, fail, panic) the queue is signalled
/// exactly once, unless a hang report already released it, in which case
/// the signal is suppressed. A runner dropped without running abandons its
/// task and advances the queue.
pub struct TaskRunner {
    core: Arc<Core>,
    queue: Arc<ContextQueue>,
    dispatch: Option<Dispatch>,
}

impl TaskRunner {
    pub(crate) fn new(core: Arc<Core>, queue: Arc<ContextQueue>, dispatch: Dispatch) -> Self {
        Self {
            core,
            queue,
            dispatch: Some(dispatch),
        }
    }

    /// Execute on the calling thread.
    ///
    /// Errors only for a broken queue invariant; task failures are reported
    /// through the returned outcome.
    pub fn run(mut self) -> Result<TaskOutcome> {
        let Some(Dispatch { task, ticket }) = self.dispatch.take() else {
            return Ok(TaskOutcome::Skipped);
        };
        let queue_wait = task.created().elapsed();
        let (info, body) = task.into_body();
        let worker = WorkerId::current();

        let span = start_task_span(&info, self.queue.index(), &worker);
        let _entered = span.enter();

        let claim = match self.queue.record_worker(ticket, worker.clone()) {
            Ok(claim) => claim,
            Err(e) => {
                // The body never runs; free the ticket so the context moves on.
                record_outcome(&span, &TaskOutcome::Skipped);
                self.core
                    .abandon_unrun(&self.queue, &info, ticket, "illegal queue state");
                return Err(e);
            }
        };
        match claim {
            Claim::Granted => {}
            Claim::Stale => {
                // Already counted as abandoned by whoever released the queue.
                debug!("queue was released before the task started; skipping it");
                record_outcome(&span, &TaskOutcome::Skipped);
                self.core
                    .observer()
                    .task_finished(&info, &TaskOutcome::Skipped, Duration::ZERO);
                return Ok(TaskOutcome::Skipped);
            }
        }

        let ctx = ExecutionContext {
            task: info.clone(),
            queue_index: self.queue.index(),
            worker,
            queue_wait,
        };
        let started = Instant::now();
        let outcome = {
            let _scope = ContextScope::enter(ctx.clone());
            match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(e)) => {
                    warn!(error = %e, "task failed");
                    TaskOutcome::Failed(e.to_string())
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(panic = %message, "task panicked");
                    TaskOutcome::Panicked(message)
                }
            }
        };
        let elapsed = started.elapsed();
        record_outcome(&span, &outcome);
        self.core.observer().task_finished(&info, &outcome, elapsed);

        if !self.queue.clear_worker(ticket) {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "task returned after its queue was force-released; ignoring completion"
            );
            self.core.stale_completion();
            return Ok(outcome);
        }

        match self.queue.on_task_finished(ticket) {
            Advance::Next(next) => {
                self.core.task_settled(&outcome);
                if let Err(e) = self.core.launch(&self.queue, next) {
                    error!(error = %e, "could not submit next task for context");
                }
            }
            Advance::Idle => {
                // Evict first so an idle dispatcher never reports stale queues.
                self.core.evict_if_idle(&self.queue);
                self.core.task_settled(&outcome);
            }
            Advance::Stale => {
                // Released between clear_worker and here.
                self.core.stale_completion();
            }
        }
        Ok(outcome)
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        let Some(Dispatch { task, ticket }) = self.dispatch.take() else {
            return;
        };
        warn!(
            queue = self.queue.index(),
            task = %task.info(),
            "worker pool dropped task without running it; abandoning it"
        );
        self.core
            .abandon_unrun(&self.queue, task.info(), ticket, "worker pool dropped job");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
