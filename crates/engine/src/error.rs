//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::models::RunStatus;

/// Errors produced by the engine outside of individual action failures.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Definition errors ------

    /// An automation definition is structurally unusable.
    #[error("invalid automation '{automation_id}': {message}")]
    InvalidAutomation {
        automation_id: String,
        message: String,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    // ------ Ingress errors ------

    #[error("no automation matches this trigger")]
    NoMatch,

    #[error(transparent)]
    Verification(#[from] VerifyError),

    /// The request body does not decode as the trigger expects.
    #[error("malformed payload: {0}")]
    BadPayload(String),

    /// The engine stopped accepting events.
    #[error("engine is shutting down")]
    ShuttingDown,

    // ------ Execution errors ------

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("automation source error: {0}")]
    Source(String),
}

/// Failures of the run ledger or the idempotency store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    /// A status change that would move a run backwards.
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// Problems building a trigger registry from a set of automations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("automations '{first}' and '{second}' both listen on {method} {path}")]
    DuplicateRoute {
        method: String,
        path: String,
        first: String,
        second: String,
    },

    #[error("duplicate automation id '{0}'")]
    DuplicateId(String),

    #[error("automation '{automation_id}' has invalid cron trigger: {message}")]
    InvalidCron {
        automation_id: String,
        message: String,
    },

    #[error("automation '{automation_id}': {message}")]
    InvalidDefinition {
        automation_id: String,
        message: String,
    },

    #[error("automation '{automation_id}' uses unknown webhook provider '{provider}'")]
    UnknownProvider {
        automation_id: String,
        provider: String,
    },
}

/// Reasons a delivery or handshake is rejected before any run exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("missing signature header '{0}'")]
    MissingSignature(String),

    #[error("signature does not match payload")]
    BadSignature,

    #[error("verify token mismatch")]
    TokenMismatch,

    /// The handshake mode is not one this endpoint answers.
    #[error("unsupported handshake")]
    UnsupportedHandshake,

    #[error("provider is not configured with a secret")]
    MissingSecret,
}
