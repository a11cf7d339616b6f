//! Execution context handed to a running task.
//!
//! The context is passed to the task body explicitly. For code deep in a
//! call stack that cannot take a parameter, the runner also installs it in a
//! thread-local slot for exactly the duration of the body; [`ContextScope`]
//! restores whatever was there before on every exit path, panics included.

use std::cell::RefCell;
use std::time::Duration;

use crate::model::{ContextKey, TaskId, TaskInfo, WorkerId};

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// Who is running what, for how long it waited.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task: TaskInfo,
    /// Index of the queue serving the task (shard index, or 0 in per-key mode).
    pub queue_index: usize,
    pub worker: WorkerId,
    /// Time between task construction and the body starting.
    pub queue_wait: Duration,
}

impl ExecutionContext {
    pub fn key(&self) -> &ContextKey {
        &self.task.key
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// The context of the task running on this thread, if any.
    pub fn current() -> Option<ExecutionContext> {
        CURRENT.with(|slot| slot.borrow().clone())
    }
}

/// Installs an [`ExecutionContext`] as the thread's current context until
/// dropped.
pub(crate) struct ContextScope {
    previous: Option<ExecutionContext>,
}

impl ContextScope {
    pub(crate) fn enter(ctx: ExecutionContext) -> Self {
        let previous = CURRENT.with(|slot| slot.borrow_mut().replace(ctx));
        Self { previous }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    fn ctx(key: &str) -> ExecutionContext {
        ExecutionContext {
            task: Task::new(key, || {}).info().clone(),
            queue_index: 0,
            worker: WorkerId::current(),
            queue_wait: Duration::ZERO,
        }
    }

    #[test]
    fn scope_installs_and_restores() {
        assert!(ExecutionContext::current().is_none());
        {
            let _outer = ContextScope::enter(ctx("outer"));
            assert_eq!(ExecutionContext::current().unwrap().key().as_str(), "outer");
            {
                let _inner = ContextScope::enter(ctx("inner"));
                assert_eq!(ExecutionContext::current().unwrap().key().as_str(), "inner");
            }
            assert_eq!(ExecutionContext::current().unwrap().key().as_str(), "outer");
        }
        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn scope_restores_after_panic() {
        let result = std::panic::catch_unwind(|| {
            let _scope = ContextScope::enter(ctx("doomed"));
            panic!("body blew up");
        });
        assert!(result.is_err());
        assert!(ExecutionContext::current().is_none());
    }
}
