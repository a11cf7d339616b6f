//! Span helpers for task execution.

use tracing::Span;

use crate::model::{TaskInfo, TaskOutcome, WorkerId};

/// Start the span a task runner executes under.
///
/// `task.outcome` is declared empty and filled in by [`record_outcome`].
pub fn start_task_span(task: &TaskInfo, queue_index: usize, worker: &WorkerId) -> Span {
    tracing::info_span!(
        "dispatch.task",
        "task.id" = %task.id,
        "task.key" = %task.key,
        "task.label" = task.label.as_deref().unwrap_or(""),
        "queue.index" = queue_index,
        "worker" = %worker,
        "task.outcome" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &TaskOutcome) {
    span.record("task.outcome", outcome.as_str());
}
