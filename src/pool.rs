//! Worker pool seam.
//!
//! The dispatcher never owns or sizes the pool it runs on. All it needs is
//! `submit`: run this job on some worker thread, some time later, with no
//! ordering promise relative to other jobs.

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;

/// A job handed to the pool: one task runner, ready to execute.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The pool refused a job.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PoolError(pub String);

/// A plain unordered executor.
///
/// A job that is refused, or accepted and later discarded without running
/// (for example at runtime shutdown), must be dropped. The dispatcher treats
/// a dropped job as abandoned and moves its context on to the next task.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Job) -> Result<(), PoolError>;
}

impl<P: WorkerPool + ?Sized> WorkerPool for Arc<P> {
    fn submit(&self, job: Job) -> Result<(), PoolError> {
        (**self).submit(job)
    }
}

/// Runs jobs on a Tokio runtime's blocking thread pool.
///
/// Task bodies are synchronous and may block indefinitely, so they go to
/// `spawn_blocking`, never to the async workers. Once the runtime shuts
/// down, Tokio cancels queued and newly spawned blocking jobs; each one is
/// dropped unrun and its task abandoned.
#[derive(Debug, Clone)]
pub struct TokioBlockingPool {
    handle: Handle,
}

impl TokioBlockingPool {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime the caller is running inside.
    pub fn current() -> Result<Self, PoolError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| PoolError(format!("no tokio runtime available: {e}")))
    }
}

impl WorkerPool for TokioBlockingPool {
    fn submit(&self, job: Job) -> Result<(), PoolError> {
        // Completion is reported by the runner itself.
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}
