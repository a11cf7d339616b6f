//! Metric instrument factories and the OTel-backed dispatch observer.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"ctx-dispatch"` meter.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::model::{TaskInfo, TaskOutcome};
use crate::observer::DispatchObserver;

fn meter() -> Meter {
    opentelemetry::global::meter("ctx-dispatch")
}

/// Counter: tasks handed to a runner.
pub fn tasks_dequeued() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.tasks.dequeued")
        .with_description("Tasks handed from a context queue to a runner")
        .build()
}

/// Counter: tasks that finished running.
/// Labels: `outcome` ("completed" | "failed" | "panicked" | "skipped").
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.tasks.finished")
        .with_description("Tasks whose runner finished")
        .build()
}

/// Counter: tasks refused because their queue was full.
pub fn tasks_rejected() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.tasks.rejected")
        .with_description("Tasks rejected by a full context queue")
        .build()
}

/// Counter: tasks given up on.
/// Labels: `reason`.
pub fn tasks_abandoned() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.tasks.abandoned")
        .with_description("Tasks abandoned by hang recovery, pool refusal or shutdown")
        .build()
}

/// Histogram: time from task creation to dequeue, in milliseconds.
pub fn queue_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatch.queue.wait_ms")
        .with_description("Time a task spent queued before a runner took it")
        .with_unit("ms")
        .build()
}

/// Histogram: buffered tasks left behind each dequeued task.
pub fn queue_depth() -> Histogram<u64> {
    meter()
        .u64_histogram("dispatch.queue.depth")
        .with_description("Pending tasks remaining in a context queue at dequeue")
        .build()
}

/// Histogram: task body run time in milliseconds.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatch.task.duration_ms")
        .with_description("Task body run time")
        .with_unit("ms")
        .build()
}

/// [`DispatchObserver`] that records into the instruments above.
pub struct MetricsObserver {
    dequeued: Counter<u64>,
    finished: Counter<u64>,
    rejected: Counter<u64>,
    abandoned: Counter<u64>,
    queue_wait: Histogram<f64>,
    depth: Histogram<u64>,
    duration: Histogram<f64>,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self {
            dequeued: tasks_dequeued(),
            finished: tasks_finished(),
            rejected: tasks_rejected(),
            abandoned: tasks_abandoned(),
            queue_wait: queue_wait_ms(),
            depth: queue_depth(),
            duration: task_duration_ms(),
        }
    }
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

impl DispatchObserver for MetricsObserver {
    fn task_dequeued(&self, _task: &TaskInfo, queue_wait: Duration, depth: usize) {
        self.dequeued.add(1, &[]);
        self.queue_wait.record(millis(queue_wait), &[]);
        self.depth.record(depth as u64, &[]);
    }

    fn task_finished(&self, _task: &TaskInfo, outcome: &TaskOutcome, elapsed: Duration) {
        let labels = [KeyValue::new("outcome", outcome.as_str())];
        self.finished.add(1, &labels);
        self.duration.record(millis(elapsed), &labels);
    }

    fn task_rejected(&self, _task: &TaskInfo) {
        self.rejected.add(1, &[]);
    }

    fn task_abandoned(&self, _task: &TaskInfo, reason: &str) {
        self.abandoned
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }
}
