//! Per-context FIFO buffer with a single in-flight slot.
//!
//! A `ContextQueue` arbitrates one executor at a time for its context. Every
//! state change happens under one mutex, so "append to the buffer" and
//! "the in-flight task just finished" can never interleave: either the
//! finishing runner sees the new task and hands it off, or the producer sees
//! an idle queue and dispatches it itself.
//!
//! Each hand-off issues a [`Ticket`]. Runners present their ticket on every
//! call back into the queue; after a force release the generation moves on
//! and the abandoned runner's ticket goes stale, so its late completion
//! cannot advance the queue a second time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{ContextKey, Task, TaskInfo, WorkerId};

/// Generation token for one hand-off of one task to one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// A task released from a queue, with the ticket its runner must present.
#[derive(Debug)]
pub struct Dispatch {
    pub task: Task,
    pub ticket: Ticket,
}

/// Result of offering a task to a queue.
#[derive(Debug)]
pub enum Enqueued {
    /// The queue was idle. The caller must submit this task to the pool.
    DispatchNow(Dispatch),
    /// A task is in flight; the runner will pick this one up.
    Buffered,
    /// The buffer is full.
    Rejected(Task),
    /// The queue no longer accepts work (dispatcher shut down).
    Closed(Task),
    /// The queue was evicted from its table; look it up again.
    Retired(Task),
}

/// Result of a runner reporting completion.
#[derive(Debug)]
pub enum Advance {
    /// Buffer empty; the queue is idle.
    Idle,
    /// Next task to submit; the queue stays busy.
    Next(Dispatch),
    /// The ticket is not current or the queue is idle. Nothing changed.
    Stale,
}

/// Result of a runner claiming the queue for its worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Granted,
    /// The queue was force-released before this runner got a thread.
    Stale,
}

/// What a force release took away and what it freed up.
#[derive(Debug)]
pub struct ForceRelease {
    pub abandoned: Option<TaskInfo>,
    pub worker: Option<WorkerId>,
    pub next: Option<Dispatch>,
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub index: usize,
    pub key: Option<ContextKey>,
    pub busy: bool,
    pub depth: usize,
    pub worker: Option<WorkerId>,
    pub last_task: Option<TaskInfo>,
    pub running_for_ms: Option<u64>,
}

struct QueueState {
    buffer: VecDeque<Task>,
    busy: bool,
    generation: u64,
    worker: Option<WorkerId>,
    running_since: Option<Instant>,
    last_task: Option<TaskInfo>,
    closed: bool,
    retired: bool,
}

/// Buffer and single-flight arbiter for one context (or one shard).
pub struct ContextQueue {
    index: usize,
    key: Option<ContextKey>,
    capacity: usize,
    state: Mutex<QueueState>,
    space: Condvar,
}

impl ContextQueue {
    /// `capacity` bounds the pending buffer; the in-flight task does not
    /// count against it. `key` is set for queues owned by a single context.
    pub fn new(index: usize, key: Option<ContextKey>, capacity: usize) -> Self {
        Self {
            index,
            key,
            capacity,
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                busy: false,
                generation: 0,
                worker: None,
                running_since: None,
                last_task: None,
                closed: false,
                retired: false,
            }),
            space: Condvar::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key(&self) -> Option<&ContextKey> {
        self.key.as_ref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offer a task without blocking.
    pub fn enqueue(&self, task: Task) -> Enqueued {
        let mut state = self.state.lock();
        self.offer(&mut state, task)
    }

    /// Offer a task, waiting up to `timeout` for buffer space.
    pub fn enqueue_blocking(&self, task: Task, timeout: Duration) -> Enqueued {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let mut task = task;
        loop {
            match self.offer(&mut state, task) {
                Enqueued::Rejected(returned) => task = returned,
                other => return other,
            }
            match deadline {
                Some(deadline) => {
                    if self.space.wait_until(&mut state, deadline).timed_out() {
                        return self.offer(&mut state, task);
                    }
                }
                None => self.space.wait(&mut state),
            }
        }
    }

    fn offer(&self, state: &mut QueueState, task: Task) -> Enqueued {
        if state.retired {
            return Enqueued::Retired(task);
        }
        if state.closed {
            return Enqueued::Closed(task);
        }
        if !state.busy {
            // Idle implies an empty buffer, but keep FIFO even if it were not.
            state.buffer.push_back(task);
            return match state.buffer.pop_front() {
                Some(head) => Enqueued::DispatchNow(hand_off(state, head)),
                None => Enqueued::Buffered,
            };
        }
        if state.buffer.len() >= self.capacity {
            return Enqueued::Rejected(task);
        }
        state.buffer.push_back(task);
        Enqueued::Buffered
    }

    /// Called by the runner holding `ticket` once its task has returned.
    pub fn on_task_finished(&self, ticket: Ticket) -> Advance {
        let mut state = self.state.lock();
        if !state.busy || state.generation != ticket.0 {
            return Advance::Stale;
        }
        state.busy = false;
        state.worker = None;
        state.running_since = None;
        let advance = match state.buffer.pop_front() {
            Some(next) => Advance::Next(hand_off(&mut state, next)),
            None => Advance::Idle,
        };
        // Either a buffer slot or the idle queue itself is now free.
        self.space.notify_one();
        advance
    }

    /// Mark `worker` as the thread now running the task behind `ticket`.
    pub fn record_worker(&self, ticket: Ticket, worker: WorkerId) -> Result<Claim> {
        let mut state = self.state.lock();
        if !state.busy || state.generation != ticket.0 {
            return Ok(Claim::Stale);
        }
        if let Some(existing) = &state.worker {
            return Err(Error::IllegalState(format!(
                "queue {} is already served by worker {existing}; {worker} tried to claim it",
                self.index
            )));
        }
        state.worker = Some(worker);
        state.running_since = Some(Instant::now());
        Ok(Claim::Granted)
    }

    /// Clear the worker marker set by [`record_worker`](Self::record_worker).
    ///
    /// Returns `false` when the marker no longer belongs to `ticket`, which
    /// means the queue was force-released while the body ran.
    pub fn clear_worker(&self, ticket: Ticket) -> bool {
        let mut state = self.state.lock();
        if state.busy && state.generation == ticket.0 && state.worker.is_some() {
            state.worker = None;
            state.running_since = None;
            true
        } else {
            false
        }
    }

    pub fn matches_hung_worker(&self, worker: &WorkerId) -> bool {
        self.state.lock().worker.as_ref() == Some(worker)
    }

    pub fn last_task(&self) -> Option<TaskInfo> {
        self.state.lock().last_task.clone()
    }

    /// Abandon the in-flight task and hand off the next buffered one.
    ///
    /// The abandoned task is never retried and its runner's completion is
    /// ignored. Returns `None` if nothing was in flight.
    pub fn force_release(&self) -> Option<ForceRelease> {
        let mut state = self.state.lock();
        self.release_locked(&mut state)
    }

    /// [`force_release`](Self::force_release), but only if `worker` is still
    /// the thread serving this queue.
    pub fn release_hung_worker(&self, worker: &WorkerId) -> Option<ForceRelease> {
        let mut state = self.state.lock();
        if state.worker.as_ref() != Some(worker) {
            return None;
        }
        self.release_locked(&mut state)
    }

    fn release_locked(&self, state: &mut QueueState) -> Option<ForceRelease> {
        if !state.busy {
            return None;
        }
        let abandoned = state.last_task.clone();
        let worker = state.worker.take();
        state.busy = false;
        state.running_since = None;
        state.generation += 1;
        let next = state.buffer.pop_front().map(|task| hand_off(state, task));
        self.space.notify_one();
        Some(ForceRelease {
            abandoned,
            worker,
            next,
        })
    }

    /// Stop accepting work. Buffered tasks still drain; blocked producers
    /// wake up and get `Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.space.notify_all();
    }

    /// Remove and return every buffered task. The in-flight task, if any,
    /// is unaffected.
    pub fn drain(&self) -> Vec<Task> {
        let drained: Vec<Task> = self.state.lock().buffer.drain(..).collect();
        self.space.notify_all();
        drained
    }

    /// Retire an idle, empty queue so it can be dropped from a per-key
    /// table. Fails if anything is buffered or in flight. Producers still
    /// parked on this queue wake up and get `Retired`.
    pub fn try_retire(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.busy || !state.buffer.is_empty() {
                return false;
            }
            state.retired = true;
        }
        self.space.notify_all();
        true
    }

    pub fn depth(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            index: self.index,
            key: self.key.clone(),
            busy: state.busy,
            depth: state.buffer.len(),
            worker: state.worker.clone(),
            last_task: state.last_task.clone(),
            running_for_ms: state
                .running_since
                .map(|since| since.elapsed().as_millis() as u64),
        }
    }
}

fn hand_off(state: &mut QueueState, task: Task) -> Dispatch {
    state.generation += 1;
    state.busy = true;
    state.last_task = Some(task.info().clone());
    Dispatch {
        task,
        ticket: Ticket(state.generation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn task(key: &str) -> Task {
        Task::new(key, || {})
    }

    fn dispatched(result: Enqueued) -> Dispatch {
        match result {
            Enqueued::DispatchNow(d) => d,
            other => panic!("expected DispatchNow, got {other:?}"),
        }
    }

    #[test]
    fn idle_queue_dispatches_then_goes_idle() {
        let queue = ContextQueue::new(0, None, 4);
        let first = dispatched(queue.enqueue(task("sess-1")));
        assert!(queue.is_busy());

        assert!(matches!(queue.on_task_finished(first.ticket), Advance::Idle));
        assert!(!queue.is_busy());
    }

    #[test]
    fn busy_queue_buffers_and_advances_in_order() {
        let queue = ContextQueue::new(0, None, 4);
        let first = dispatched(queue.enqueue(task("sess-1").label("t1")));
        assert!(matches!(queue.enqueue(task("sess-1").label("t2")), Enqueued::Buffered));
        assert!(matches!(queue.enqueue(task("sess-1").label("t3")), Enqueued::Buffered));

        let Advance::Next(second) = queue.on_task_finished(first.ticket) else {
            panic!("expected next task");
        };
        assert_eq!(second.task.info().label.as_deref(), Some("t2"));
        let Advance::Next(third) = queue.on_task_finished(second.ticket) else {
            panic!("expected next task");
        };
        assert_eq!(third.task.info().label.as_deref(), Some("t3"));
        assert!(matches!(queue.on_task_finished(third.ticket), Advance::Idle));
    }

    #[test]
    fn full_buffer_rejects_and_returns_task() {
        let queue = ContextQueue::new(0, None, 1);
        let _running = dispatched(queue.enqueue(task("k")));
        assert!(matches!(queue.enqueue(task("k")), Enqueued::Buffered));

        let overflow = task("k").label("overflow");
        match queue.enqueue(overflow) {
            Enqueued::Rejected(t) => assert_eq!(t.info().label.as_deref(), Some("overflow")),
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn zero_capacity_only_accepts_when_idle() {
        let queue = ContextQueue::new(0, None, 0);
        let running = dispatched(queue.enqueue(task("k")));
        assert!(matches!(queue.enqueue(task("k")), Enqueued::Rejected(_)));
        assert!(matches!(queue.on_task_finished(running.ticket), Advance::Idle));
        assert!(matches!(queue.enqueue(task("k")), Enqueued::DispatchNow(_)));
    }

    #[test]
    fn finishing_an_idle_queue_is_a_no_op() {
        let queue = ContextQueue::new(0, None, 4);
        let first = dispatched(queue.enqueue(task("k")));
        assert!(matches!(queue.on_task_finished(first.ticket), Advance::Idle));

        for _ in 0..5 {
            assert!(matches!(queue.on_task_finished(first.ticket), Advance::Stale));
        }
        assert!(!queue.is_busy());
        assert!(matches!(queue.enqueue(task("k")), Enqueued::DispatchNow(_)));
    }

    #[test]
    fn double_record_is_illegal() {
        let queue = ContextQueue::new(3, None, 4);
        let running = dispatched(queue.enqueue(task("k")));
        assert_eq!(
            queue.record_worker(running.ticket, WorkerId::current()).unwrap(),
            Claim::Granted
        );
        let err = queue
            .record_worker(running.ticket, WorkerId::current())
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn force_release_ignores_stale_completion() {
        let queue = ContextQueue::new(0, None, 4);
        let stuck = dispatched(queue.enqueue(task("sess-2").label("stuck")));
        queue.record_worker(stuck.ticket, WorkerId::current()).unwrap();
        assert!(matches!(queue.enqueue(task("sess-2").label("t2")), Enqueued::Buffered));

        let released = queue
            .release_hung_worker(&WorkerId::current())
            .expect("worker should match");
        assert_eq!(
            released.abandoned.and_then(|info| info.label).as_deref(),
            Some("stuck")
        );
        let next = released.next.expect("buffered task should be handed off");
        assert_eq!(next.task.info().label.as_deref(), Some("t2"));

        // The stuck runner finally returns.
        assert!(!queue.clear_worker(stuck.ticket));
        assert!(matches!(queue.on_task_finished(stuck.ticket), Advance::Stale));
        assert!(queue.is_busy());

        assert!(matches!(queue.on_task_finished(next.ticket), Advance::Idle));
    }

    #[test]
    fn force_release_of_idle_queue_returns_none() {
        let queue = ContextQueue::new(0, None, 4);
        assert!(queue.force_release().is_none());
    }

    #[test]
    fn stale_runner_cannot_claim() {
        let queue = ContextQueue::new(0, None, 4);
        let running = dispatched(queue.enqueue(task("k")));
        let released = queue.force_release().unwrap();
        assert!(released.next.is_none());
        assert_eq!(
            queue.record_worker(running.ticket, WorkerId::current()).unwrap(),
            Claim::Stale
        );
    }

    #[test]
    fn blocking_enqueue_waits_for_space() {
        let queue = Arc::new(ContextQueue::new(0, None, 1));
        let running = dispatched(queue.enqueue(task("k")));
        assert!(matches!(queue.enqueue(task("k")), Enqueued::Buffered));

        let finisher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                queue.on_task_finished(running.ticket)
            })
        };

        let start = Instant::now();
        let result = queue.enqueue_blocking(task("k"), Duration::from_millis(2_000));
        assert!(matches!(result, Enqueued::Buffered));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(finisher.join().unwrap(), Advance::Next(_)));
    }

    #[test]
    fn blocking_enqueue_times_out() {
        let queue = ContextQueue::new(0, None, 0);
        let _running = dispatched(queue.enqueue(task("k")));
        let start = Instant::now();
        let result = queue.enqueue_blocking(task("k"), Duration::from_millis(50));
        assert!(matches!(result, Enqueued::Rejected(_)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn close_wakes_blocked_producers() {
        let queue = Arc::new(ContextQueue::new(0, None, 0));
        let _running = dispatched(queue.enqueue(task("k")));
        let closer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.close();
            })
        };
        let result = queue.enqueue_blocking(task("k"), Duration::from_secs(10));
        assert!(matches!(result, Enqueued::Closed(_)));
        closer.join().unwrap();
    }

    #[test]
    fn try_retire_notifies_parked_producers() {
        let queue = Arc::new(ContextQueue::new(0, None, 0));
        let running = dispatched(queue.enqueue(task("k")));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue_blocking(task("k"), Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(50));

        // Mark idle without the wakeup a normal finish sends, leaving only
        // try_retire to wake the producer.
        {
            let mut state = queue.state.lock();
            assert_eq!(state.generation, running.ticket.0);
            state.busy = false;
        }
        assert!(queue.try_retire());

        let start = Instant::now();
        let result = producer.join().unwrap();
        assert!(matches!(result, Enqueued::Retired(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn retire_only_when_idle_and_empty() {
        let queue = ContextQueue::new(0, None, 4);
        let running = dispatched(queue.enqueue(task("k")));
        assert!(!queue.try_retire());
        queue.on_task_finished(running.ticket);
        assert!(queue.try_retire());
        assert!(matches!(queue.enqueue(task("k")), Enqueued::Retired(_)));
    }
}
