//! `engine` crate — automation models, trigger matching, idempotent
//! admission, the execution engine and its run ledger.
//!
//! [`Engine`] is the entry point: it owns the trigger registry, the
//! listeners and the worker pool that executes runs.

pub mod models;
pub mod error;
pub mod config;
pub mod context;
pub mod condition;
pub mod schedule;
pub mod verify;
pub mod registry;
pub mod idempotency;
pub mod ledger;
pub mod retry;
pub mod dispatcher;
pub mod executor;
pub mod branch;
pub mod matcher;
pub mod listener;
pub mod source;
pub mod service;

pub use config::EngineConfig;
pub use dispatcher::{ActionDispatcher, DispatcherBuilder};
pub use error::{EngineError, LedgerError, RegistryError, VerifyError};
pub use executor::{ExecutionResult, ExecutorConfig, WorkflowExecutor};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, PgIdempotencyStore};
pub use ledger::{InMemoryRunLedger, PgRunLedger, RunLedger};
pub use matcher::GetOutcome;
pub use models::{
    ActionKind, ActionNode, Automation, ExecutionRun, RunStatus, RunSummary, Transport, Trigger,
    TriggerEvent,
};
pub use registry::TriggerRegistry;
pub use service::{Admission, Engine, EngineParts};
pub use source::{AutomationSource, FileSource, PgSource, StaticSource};
pub use verify::{Handshake, VerifierSet};
