//! Queue error type.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The pool is shutting down and no longer accepts jobs.
    #[error("queue closed")]
    Closed,

    /// `try_submit` found every slot taken.
    #[error("queue full")]
    Full,
}
