//! Error types for ctx-dispatch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A broken queue invariant, e.g. a second worker claiming a queue
    /// that already has one recorded.
    #[error("illegal queue state: {0}")]
    IllegalState(String),

    #[error("dispatcher is shut down")]
    ShutDown,

    #[error("worker pool rejected job: {0}")]
    Pool(#[from] crate::pool::PoolError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
