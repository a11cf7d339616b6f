//! Routes tasks to their context queues and owns the worker pool handle.
//!
//! The dispatcher is the only component that submits to the pool. A task is
//! submitted when its queue reports `DispatchNow` (producer side) or when the
//! previous task of the same context finishes and hands it off (runner
//! side). Nothing else ever starts a task, which is what keeps each context
//! single-flight without a thread per context.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::queue::{Advance, ContextQueue, Dispatch, Enqueued, QueueSnapshot, Ticket};
use super::runner::TaskRunner;
use super::table::QueueTable;
use crate::config::{DispatcherConfig, QueueMode};
use crate::error::{Error, Result};
use crate::hang::{HangListener, HangReport};
use crate::model::{ContextKey, Task, TaskInfo, TaskOutcome, WorkerId};
use crate::observer::{DispatchObserver, NoopObserver};
use crate::pool::WorkerPool;

/// What became of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// The context was idle; the task went straight to the pool.
    Started,
    /// Queued behind the context's in-flight task.
    Buffered,
    /// The context's buffer was full (and stayed full for the whole wait,
    /// if one was requested).
    Rejected,
}

impl DispatchStatus {
    pub fn is_accepted(self) -> bool {
        !matches!(self, DispatchStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Started => "started",
            DispatchStatus::Buffered => "buffered",
            DispatchStatus::Rejected => "rejected",
        }
    }
}

/// Running totals since the dispatcher was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub started: u64,
    pub buffered: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub abandoned: u64,
    pub stale_completions: u64,
}

/// Introspection of the whole dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub mode: QueueMode,
    pub queues: usize,
    pub outstanding: usize,
    pub shut_down: bool,
    pub stats: DispatchStats,
    /// Queues with a task in flight or buffered.
    pub active: Vec<QueueSnapshot>,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    buffered: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    abandoned: AtomicU64,
    stale_completions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            started: self.started.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the dispatcher handle and every task runner.
pub(crate) struct Core {
    pool: Arc<dyn WorkerPool>,
    table: QueueTable,
    observer: Arc<dyn DispatchObserver>,
    shut_down: AtomicBool,
    /// Accepted tasks not yet finished, abandoned or drained.
    outstanding: Mutex<usize>,
    drained: Condvar,
    counters: Counters,
}

impl Core {
    pub(crate) fn observer(&self) -> &dyn DispatchObserver {
        self.observer.as_ref()
    }

    /// Submit `dispatch` to the pool.
    ///
    /// A job the pool refuses (or later drops unrun) abandons its task and
    /// advances the queue, so the context never stays busy on a job that
    /// will not run. Hand-offs produced while this thread is already inside
    /// `launch` are queued and submitted by the outermost call.
    pub(crate) fn launch(self: &Arc<Self>, queue: &Arc<ContextQueue>, dispatch: Dispatch) -> Result<()> {
        let pending = Deferred {
            core: Arc::clone(self),
            queue: Arc::clone(queue),
            dispatch,
        };
        let Some((scope, Deferred { dispatch, .. })) = LaunchScope::enter(pending) else {
            return Ok(());
        };
        let result = self.submit(queue, dispatch);
        while let Some(Deferred { core, queue, dispatch }) = scope.next() {
            if let Err(e) = core.submit(&queue, dispatch) {
                error!(error = %e, "could not submit next task for context");
            }
        }
        result
    }

    fn submit(self: &Arc<Self>, queue: &Arc<ContextQueue>, dispatch: Dispatch) -> Result<()> {
        let info = dispatch.task.info().clone();
        self.observer
            .task_dequeued(&info, dispatch.task.created().elapsed(), queue.depth());

        let runner = TaskRunner::new(Arc::clone(self), Arc::clone(queue), dispatch);
        let job = Box::new(move || {
            if let Err(e) = runner.run() {
                error!(error = %e, "task runner hit a broken queue invariant");
            }
        });
        // A refused job has already been dropped, which abandoned its task.
        self.pool.submit(job).map_err(|e| {
            error!(
                queue = queue.index(),
                task = %info,
                error = %e,
                "worker pool refused task"
            );
            Error::Pool(e)
        })
    }

    /// Give up on a dispatch whose body never ran, then advance its queue.
    /// No-op if a hang release already moved the queue past `ticket`.
    pub(crate) fn abandon_unrun(
        self: &Arc<Self>,
        queue: &Arc<ContextQueue>,
        info: &TaskInfo,
        ticket: Ticket,
        reason: &str,
    ) {
        match queue.on_task_finished(ticket) {
            Advance::Next(next) => {
                self.abandon(info, reason);
                if let Err(e) = self.launch(queue, next) {
                    error!(error = %e, "could not submit next task for context");
                }
            }
            Advance::Idle => {
                self.evict_if_idle(queue);
                self.abandon(info, reason);
            }
            Advance::Stale => {}
        }
    }

    pub(crate) fn evict_if_idle(&self, queue: &Arc<ContextQueue>) {
        self.table.evict_if_idle(queue);
    }

    /// Account for a task that ran to the end and advanced its queue.
    pub(crate) fn task_settled(&self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => Counters::bump(&self.counters.completed),
            TaskOutcome::Failed(_) => Counters::bump(&self.counters.failed),
            TaskOutcome::Panicked(_) => Counters::bump(&self.counters.panicked),
            TaskOutcome::Skipped => {}
        }
        self.end_task();
    }

    pub(crate) fn stale_completion(&self) {
        Counters::bump(&self.counters.stale_completions);
    }

    fn abandon(&self, info: &TaskInfo, reason: &str) {
        Counters::bump(&self.counters.abandoned);
        self.observer.task_abandoned(info, reason);
        self.end_task();
    }

    fn begin_task(&self) {
        *self.outstanding.lock() += 1;
    }

    fn end_task(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }
}

thread_local! {
    static DEFERRED: RefCell<Option<VecDeque<Deferred>>> = const { RefCell::new(None) };
}

struct Deferred {
    core: Arc<Core>,
    queue: Arc<ContextQueue>,
    dispatch: Dispatch,
}

/// Held by the outermost `launch` on a thread. Nested launches park their
/// dispatch in `DEFERRED` instead of recursing through the pool.
struct LaunchScope;

impl LaunchScope {
    /// Returns the scope and `pending` back if this is the outermost launch;
    /// otherwise queues `pending` for the outer one.
    fn enter(pending: Deferred) -> Option<(LaunchScope, Deferred)> {
        DEFERRED.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_mut() {
                Some(queued) => {
                    queued.push_back(pending);
                    None
                }
                None => {
                    *slot = Some(VecDeque::new());
                    Some((LaunchScope, pending))
                }
            }
        })
    }

    fn next(&self) -> Option<Deferred> {
        DEFERRED.with(|slot| slot.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    }
}

impl Drop for LaunchScope {
    fn drop(&mut self) {
        let leftover = DEFERRED.with(|slot| slot.borrow_mut().take());
        drop(leftover);
    }
}

/// Ordered per-context dispatcher. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<Core>,
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    pool: Arc<dyn WorkerPool>,
    config: DispatcherConfig,
    observer: Arc<dyn DispatchObserver>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        self.config.validate()?;
        info!(
            mode = ?self.config.mode,
            shards = self.config.shards,
            queue_capacity = self.config.queue_capacity,
            "dispatcher created"
        );
        Ok(Dispatcher {
            core: Arc::new(Core {
                pool: self.pool,
                table: QueueTable::new(&self.config),
                observer: self.observer,
                shut_down: AtomicBool::new(false),
                outstanding: Mutex::new(0),
                drained: Condvar::new(),
                counters: Counters::default(),
            }),
        })
    }
}

impl Dispatcher {
    pub fn builder(pool: Arc<dyn WorkerPool>) -> DispatcherBuilder {
        DispatcherBuilder {
            pool,
            config: DispatcherConfig::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn new(pool: Arc<dyn WorkerPool>, config: DispatcherConfig) -> Result<Self> {
        Self::builder(pool).config(config).build()
    }

    /// Route `task` to the queue for its context key.
    ///
    /// With `blocking_timeout` of `None` or zero a full queue rejects at
    /// once; otherwise the caller waits up to the timeout for a slot. The
    /// timeout covers the whole call, including retries after the queue
    /// was evicted under the caller.
    pub fn dispatch(&self, task: Task, blocking_timeout: Option<Duration>) -> Result<DispatchStatus> {
        if self.is_shutdown() {
            return Err(Error::ShutDown);
        }
        let blocking_timeout = blocking_timeout.filter(|timeout| !timeout.is_zero());
        let started = Instant::now();

        self.core.begin_task();
        let mut task = task;
        loop {
            let queue = self.route(task.key());
            let result = match blocking_timeout {
                Some(timeout) => {
                    queue.enqueue_blocking(task, timeout.saturating_sub(started.elapsed()))
                }
                None => queue.enqueue(task),
            };
            match result {
                Enqueued::DispatchNow(dispatch) => {
                    Counters::bump(&self.core.counters.started);
                    debug!(task = %dispatch.task.info(), queue = queue.index(), "dispatching to idle context");
                    self.core.launch(&queue, dispatch)?;
                    return Ok(DispatchStatus::Started);
                }
                Enqueued::Buffered => {
                    Counters::bump(&self.core.counters.buffered);
                    return Ok(DispatchStatus::Buffered);
                }
                Enqueued::Rejected(task) => {
                    Counters::bump(&self.core.counters.rejected);
                    debug!(task = %task.info(), queue = queue.index(), "context queue full; task rejected");
                    self.core.observer.task_rejected(task.info());
                    self.core.end_task();
                    return Ok(DispatchStatus::Rejected);
                }
                Enqueued::Closed(_) => {
                    self.core.end_task();
                    return Err(Error::ShutDown);
                }
                Enqueued::Retired(returned) => task = returned,
            }
        }
    }

    /// The queue for `key`. The shutdown flag is read after the lookup, so
    /// a per-key queue created while `shutdown` runs is closed here if the
    /// shutdown loop missed it.
    fn route(&self, key: &ContextKey) -> Arc<ContextQueue> {
        let queue = self.core.table.lookup(key);
        if self.is_shutdown() {
            queue.close();
        }
        queue
    }

    /// [`dispatch`](Self::dispatch) without waiting for space.
    pub fn try_dispatch(&self, task: Task) -> Result<DispatchStatus> {
        self.dispatch(task, None)
    }

    /// Force-release the queue `worker` is serving, if any.
    ///
    /// The task it was running is abandoned: never retried, and its
    /// eventual completion is ignored. The next buffered task for that
    /// context is submitted in its place.
    pub fn report_hung_worker(&self, worker: &WorkerId) -> Option<HangReport> {
        for queue in self.core.table.queues() {
            let Some(released) = queue.release_hung_worker(worker) else {
                continue;
            };

            match &released.abandoned {
                Some(abandoned) => {
                    warn!(
                        worker = %worker,
                        queue = queue.index(),
                        task = %abandoned,
                        "worker hung; abandoning its task and releasing the context"
                    );
                    self.core.abandon(abandoned, "worker hung");
                }
                None => warn!(worker = %worker, queue = queue.index(), "worker hung; releasing context"),
            }

            let resubmitted = released.next.is_some();
            match released.next {
                Some(next) => {
                    if let Err(e) = self.core.launch(&queue, next) {
                        error!(error = %e, "could not submit next task after hang release");
                    }
                }
                None => self.core.evict_if_idle(&queue),
            }

            return Some(HangReport {
                worker: worker.clone(),
                queue_index: queue.index(),
                abandoned: released.abandoned,
                resubmitted,
            });
        }
        debug!(worker = %worker, "hung worker is not serving any context");
        None
    }

    /// Stop accepting tasks. Work already queued keeps draining.
    pub fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for queue in self.core.table.queues() {
            queue.close();
        }
        info!(outstanding = self.outstanding(), "dispatcher shutting down");
    }

    /// Stop accepting tasks and drop everything still buffered. In-flight
    /// tasks run to completion. Returns the tasks that never started.
    pub fn shutdown_now(&self) -> Vec<Task> {
        self.shutdown();
        let mut dropped = Vec::new();
        for queue in self.core.table.queues() {
            for task in queue.drain() {
                self.core.abandon(task.info(), "dispatcher shut down");
                dropped.push(task);
            }
        }
        if !dropped.is_empty() {
            warn!(dropped = dropped.len(), "dropped buffered tasks at shutdown");
        }
        dropped
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.shut_down.load(Ordering::SeqCst)
    }

    /// Block until no accepted task is pending or running, or `timeout`
    /// elapses. Returns whether the dispatcher went idle.
    pub fn await_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.core.outstanding.lock();
        while *outstanding > 0 {
            if self.core.drained.wait_until(&mut outstanding, deadline).timed_out() {
                return *outstanding == 0;
            }
        }
        true
    }

    /// Accepted tasks not yet finished, abandoned or drained.
    pub fn outstanding(&self) -> usize {
        *self.core.outstanding.lock()
    }

    pub fn stats(&self) -> DispatchStats {
        self.core.counters.snapshot()
    }

    /// Number of queues in the table (live keys in per-key mode).
    pub fn queue_count(&self) -> usize {
        self.core.table.len()
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let active = self
            .core
            .table
            .queues()
            .iter()
            .map(|queue| queue.snapshot())
            .filter(|snapshot| snapshot.busy || snapshot.depth > 0)
            .collect();
        DispatcherSnapshot {
            mode: self.core.table.mode(),
            queues: self.core.table.len(),
            outstanding: self.outstanding(),
            shut_down: self.is_shutdown(),
            stats: self.stats(),
            active,
        }
    }
}

impl HangListener for Dispatcher {
    fn thread_hung(&self, worker: &WorkerId) {
        self.report_hung_worker(worker);
    }

    fn thread_cleared(&self, worker: &WorkerId) {
        // A released context is not re-bound to its old worker.
        debug!(worker = %worker, "worker no longer hung");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.core.table.mode())
            .field("queues", &self.core.table.len())
            .field("outstanding", &self.outstanding())
            .field("shut_down", &self.is_shutdown())
            .finish()
    }
}
