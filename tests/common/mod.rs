//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ctx_dispatch::config::DispatcherConfig;
use ctx_dispatch::dispatch::Dispatcher;
use ctx_dispatch::model::{TaskInfo, TaskOutcome};
use ctx_dispatch::observer::DispatchObserver;
use ctx_dispatch::pool::{Job, PoolError, TokioBlockingPool, WorkerPool};
use parking_lot::Mutex;

/// Runtime whose blocking pool serves as the worker pool.
pub fn runtime(max_workers: usize) -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(max_workers)
        .thread_name("dispatch-worker")
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

pub fn tokio_dispatcher(rt: &tokio::runtime::Runtime, config: DispatcherConfig) -> Dispatcher {
    let pool = Arc::new(TokioBlockingPool::new(rt.handle().clone()));
    Dispatcher::new(pool, config).expect("failed to build dispatcher")
}

/// Pool that holds jobs until the test runs them, on the test's thread.
#[derive(Default)]
pub struct ManualPool {
    jobs: Mutex<VecDeque<Job>>,
    submitted: Mutex<usize>,
    closed: AtomicBool,
}

impl ManualPool {
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn submitted(&self) -> usize {
        *self.submitted.lock()
    }

    /// Run the oldest pending job. Returns false if there was none.
    pub fn run_next(&self) -> bool {
        // Pop before running: the job may submit its successor.
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Drop every pending job without running it, including jobs submitted
    /// while discarding. Returns how many were dropped.
    pub fn discard_all(&self) -> usize {
        let mut dropped = 0;
        loop {
            // Release the lock first: dropping a job may submit another.
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    drop(job);
                    dropped += 1;
                }
                None => return dropped,
            }
        }
    }

    /// From now on accept jobs but drop them unrun, like a runtime that is
    /// shutting down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl WorkerPool for ManualPool {
    fn submit(&self, job: Job) -> Result<(), PoolError> {
        *self.submitted.lock() += 1;
        if self.closed.load(Ordering::SeqCst) {
            drop(job);
            return Ok(());
        }
        self.jobs.lock().push_back(job);
        Ok(())
    }
}

pub fn manual_dispatcher(config: DispatcherConfig) -> (Arc<ManualPool>, Dispatcher) {
    let pool = Arc::new(ManualPool::default());
    let dispatcher = Dispatcher::new(pool.clone(), config).expect("failed to build dispatcher");
    (pool, dispatcher)
}

/// Pool that refuses everything.
pub struct RefusingPool;

impl WorkerPool for RefusingPool {
    fn submit(&self, _job: Job) -> Result<(), PoolError> {
        Err(PoolError("pool is closed".to_string()))
    }
}

/// Observer that records every hook call.
#[derive(Default)]
pub struct RecordingObserver {
    pub dequeued: Mutex<Vec<TaskInfo>>,
    pub finished: Mutex<Vec<(TaskInfo, TaskOutcome)>>,
    pub rejected: Mutex<Vec<TaskInfo>>,
    pub abandoned: Mutex<Vec<(TaskInfo, String)>>,
}

impl DispatchObserver for RecordingObserver {
    fn task_dequeued(&self, task: &TaskInfo, _queue_wait: Duration, _depth: usize) {
        self.dequeued.lock().push(task.clone());
    }

    fn task_finished(&self, task: &TaskInfo, outcome: &TaskOutcome, _elapsed: Duration) {
        self.finished.lock().push((task.clone(), outcome.clone()));
    }

    fn task_rejected(&self, task: &TaskInfo) {
        self.rejected.lock().push(task.clone());
    }

    fn task_abandoned(&self, task: &TaskInfo, reason: &str) {
        self.abandoned.lock().push((task.clone(), reason.to_string()));
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Shared append-only log tasks write into.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}
