//! Core data model.
//!
//! A task is a unit of work bound to a context key. Tasks that share a key
//! run one at a time, in the order they were dispatched.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::dispatch::ExecutionContext;

// ---------------------------------------------------------------------------
// Context key
// ---------------------------------------------------------------------------

/// Identifier of a logical session. All tasks carrying the same key execute
/// strictly in submission order relative to each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(Arc<str>);

impl ContextKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContextKey {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl Serialize for ContextKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Task identity
// ---------------------------------------------------------------------------

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Diagnostic identity of a task. Cheap to clone, safe to keep after the
/// task itself has been consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub key: ContextKey,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({label}) for {}", self.id, self.key),
            None => write!(f, "{} for {}", self.id, self.key),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Error type a task body may return.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

type TaskBody = Box<dyn FnOnce(&ExecutionContext) -> Result<(), TaskError> + Send + 'static>;

/// A unit of work plus the context key that orders it.
pub struct Task {
    info: TaskInfo,
    created: Instant,
    body: TaskBody,
}

impl Task {
    /// Wrap a plain closure.
    pub fn new<F>(key: impl Into<ContextKey>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::fallible(key, move |_| {
            f();
            Ok(())
        })
    }

    /// Wrap a closure that receives its execution context and may fail.
    pub fn fallible<F>(key: impl Into<ContextKey>, f: F) -> Self
    where
        F: FnOnce(&ExecutionContext) -> Result<(), TaskError> + Send + 'static,
    {
        Self {
            info: TaskInfo {
                id: TaskId::new(),
                key: key.into(),
                label: None,
                created_at: Utc::now(),
            },
            created: Instant::now(),
            body: Box::new(f),
        }
    }

    /// Attach a human-readable label, reported in logs and hang reports.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.info.label = Some(label.into());
        self
    }

    pub fn id(&self) -> TaskId {
        self.info.id
    }

    pub fn key(&self) -> &ContextKey {
        &self.info.key
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// When the task was constructed; queue wait is measured from here.
    pub fn created(&self) -> Instant {
        self.created
    }

    pub(crate) fn into_body(self) -> (TaskInfo, TaskBody) {
        (self.info, self.body)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.info.id)
            .field("key", &self.info.key)
            .field("label", &self.info.label)
            .finish_non_exhaustive()
    }
}

/// How a task's execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    /// The queue was force-released before the body started; it never ran.
    Skipped,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::Panicked(_) => "panicked",
            TaskOutcome::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Identity of a pool worker thread. Two ids are equal when they name the
/// same OS thread; the thread name is carried for logging only.
#[derive(Debug, Clone)]
pub struct WorkerId {
    thread: ThreadId,
    name: Option<Arc<str>>,
}

impl WorkerId {
    /// The calling thread.
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            thread: current.id(),
            name: current.name().map(Arc::from),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl PartialEq for WorkerId {
    fn eq(&self, other: &Self) -> bool {
        self.thread == other.thread
    }
}

impl Eq for WorkerId {}

impl std::hash::Hash for WorkerId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.thread.hash(state);
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} [{:?}]", self.thread),
            None => write!(f, "{:?}", self.thread),
        }
    }
}

impl Serialize for WorkerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
