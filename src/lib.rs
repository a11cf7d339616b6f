//! # ctx-dispatch
//!
//! Ordered per-context task dispatch over a shared worker pool.
//!
//! Tasks carry a context key. Tasks with the same key run one at a time, in
//! submission order; tasks with different keys run in parallel, bounded only
//! by the pool. No thread is dedicated to any context. Workers reported hung
//! by an external watchdog have their context force-released so the rest of
//! that context's work can proceed.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod hang;
pub mod model;
pub mod observer;
pub mod pool;
pub mod telemetry;

pub use dispatch::{DispatchStatus, Dispatcher, ExecutionContext};
pub use error::{Error, Result};
pub use model::{ContextKey, Task, TaskId, TaskInfo, TaskOutcome, WorkerId};
