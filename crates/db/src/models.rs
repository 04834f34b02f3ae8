//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Domain types live in the `engine` crate; statuses are stored as their
//! kebab-case string form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// automations
// ---------------------------------------------------------------------------

/// A persisted automation definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutomationRow {
    pub id: String,
    pub name: String,
    /// Full JSON automation definition (trigger, actions, ...).
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// execution_runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRunRow {
    pub id: Uuid,
    pub automation_id: String,
    pub idempotency_key: String,
    pub trigger_event: serde_json::Value,
    pub status: String,
    pub step_count: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Insert payload for a new run.
#[derive(Debug, Clone)]
pub struct NewExecutionRun<'a> {
    pub id: Uuid,
    pub automation_id: &'a str,
    pub idempotency_key: &'a str,
    pub trigger_event: serde_json::Value,
    pub status: &'a str,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// action_step_results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActionStepRow {
    pub run_id: Uuid,
    pub sequence: i64,
    pub action_path: String,
    pub action_type: String,
    pub status: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Insert payload for a step; the sequence is assigned by the repository.
#[derive(Debug, Clone)]
pub struct NewActionStep<'a> {
    pub action_path: &'a str,
    pub action_type: &'a str,
    pub status: &'a str,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<&'a str>,
    pub retry_count: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// idempotency_keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct IdempotencyRow {
    pub key: String,
    pub run_id: Uuid,
    pub automation_id: String,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecordRow {
    pub id: Uuid,
    pub table_name: String,
    pub fields: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
