//! Contract with an external thread-liveness watchdog.
//!
//! The watchdog decides when a worker has stopped making progress; this
//! crate only reacts. A hung worker's queue is force-released: the stuck
//! task is abandoned (never retried, its completion never observed) and the
//! next buffered task for that context is submitted on another worker.

use serde::Serialize;

use crate::model::{TaskInfo, WorkerId};

/// Notifications from a liveness watchdog.
pub trait HangListener: Send + Sync {
    /// `worker` has not progressed within the watchdog's threshold.
    fn thread_hung(&self, worker: &WorkerId);

    /// A worker previously reported hung is making progress again.
    fn thread_cleared(&self, _worker: &WorkerId) {}
}

/// What a hang report released.
#[derive(Debug, Clone, Serialize)]
pub struct HangReport {
    pub worker: WorkerId,
    pub queue_index: usize,
    pub abandoned: Option<TaskInfo>,
    /// Whether a buffered task was handed to the pool in its place.
    pub resubmitted: bool,
}
