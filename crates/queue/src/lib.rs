//! `queue` crate — bounded in-process worker pool used to run executions
//! off the ingress path.

pub mod error;
pub mod pool;

pub use error::QueueError;
pub use pool::{JobHandler, PoolConfig, QueueHandle, WorkerPool};
