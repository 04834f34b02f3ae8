//! The `ActionHandler` trait — the contract every action handler must fulfil.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ActionError;

/// Live credentials for a third-party connection, resolved per call.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Provider-specific extras (account id, region, ...).
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            extra: HashMap::new(),
        }
    }

    /// Value for an `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

// Tokens must never end up in logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token_type", &self.token_type)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Per-invocation context handed to every handler.
///
/// Defined here (in the nodes crate) so both the engine and individual handler
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// ID of the automation being executed.
    pub automation_id: String,
    /// ID of the current execution run.
    pub run_id: Uuid,
    /// Idempotency key of the run; handlers forward it downstream where the
    /// provider supports request idempotency.
    pub idempotency_key: String,
    /// Path-qualified position of the action (`0`, `2.A.1`, ...).
    pub action_path: String,
    /// Resolved credentials, present only for connector actions.
    pub credentials: Option<Credentials>,
}

/// The core handler trait.
///
/// Handlers should be idempotent where the downstream API allows it; the
/// dispatcher does not enforce it.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute the action with its already-substituted parameters and return
    /// the action's JSON output.
    async fn execute(&self, params: Value, ctx: &ActionContext) -> Result<Value, ActionError>;
}
