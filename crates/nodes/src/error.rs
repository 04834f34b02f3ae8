//! Handler- and collaborator-level error types.

use thiserror::Error;

/// Errors returned by an action handler's `execute` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Transient` — retried with exponential back-off until the budget is spent.
/// - `Permanent` — recorded as a failed step immediately, no retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Timeout, 5xx, connection reset, ... — worth another attempt.
    #[error("transient action error: {0}")]
    Transient(String),

    /// 4xx, auth failure, parameter shape mismatch.
    #[error("permanent action error: {0}")]
    Permanent(String),
}

impl ActionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Parameters that don't deserialize into the handler's expected shape.
    pub fn invalid_params(err: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid action parameters: {err}"))
    }
}

/// Errors surfaced by the Record Store and Connection Store collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// Backend unreachable or overloaded.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => ActionError::Transient(err.to_string()),
            StoreError::NotFound(_) | StoreError::Invalid(_) => {
                ActionError::Permanent(err.to_string())
            }
        }
    }
}
