//! Ordered per-context dispatch: queues, runners, and the router between them.

pub mod context;
pub mod dispatcher;
pub mod queue;
pub mod runner;
mod table;

pub use context::ExecutionContext;
pub use dispatcher::{
    DispatchStats, DispatchStatus, Dispatcher, DispatcherBuilder, DispatcherSnapshot,
};
pub use queue::{Advance, Claim, ContextQueue, Dispatch, Enqueued, ForceRelease, QueueSnapshot, Ticket};
pub use runner::TaskRunner;
pub use table::shard_index;
