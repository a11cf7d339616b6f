//! Measurement hooks around dispatch.
//!
//! Observers see every task leave its queue, finish, get rejected, or get
//! abandoned. They are side channels only; nothing they do affects ordering.
//! Implementations must be cheap and must not block: hooks run on producer
//! threads and pool workers.

use std::time::Duration;

use crate::model::{TaskInfo, TaskOutcome};

pub trait DispatchObserver: Send + Sync {
    /// A task was handed to a runner. `queue_wait` is measured from task
    /// construction; `depth` is what remained buffered behind it.
    fn task_dequeued(&self, _task: &TaskInfo, _queue_wait: Duration, _depth: usize) {}

    /// A runner finished with a task, however it ended.
    fn task_finished(&self, _task: &TaskInfo, _outcome: &TaskOutcome, _elapsed: Duration) {}

    /// A task was refused because its queue was full.
    fn task_rejected(&self, _task: &TaskInfo) {}

    /// A task was given up on: force-released as hung, dropped on a pool
    /// failure, or drained at shutdown.
    fn task_abandoned(&self, _task: &TaskInfo, _reason: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {}
