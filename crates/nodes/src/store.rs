//! Collaborator contracts: the Record Store and the Connection Store.
//!
//! The engine never talks to a database or a secrets vault directly — record
//! handlers and the database-change listener go through [`RecordStore`],
//! connector handlers receive credentials resolved via [`ConnectionStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Credentials, StoreError};

/// A single table record as seen by automations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub table: String,
    pub fields: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stream of records inserted into one table.
pub type RecordStream = BoxStream<'static, Record>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_record(&self, table: &str, fields: Value) -> Result<Record, StoreError>;

    /// Merge `fields` into the existing record.
    async fn update_record(&self, table: &str, id: &str, fields: Value)
        -> Result<Record, StoreError>;

    async fn delete_record(&self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Subscribe to row-insert notifications for `table`.
    async fn on_record_created(&self, table: &str) -> Result<RecordStream, StoreError>;
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_credentials(&self, connection_id: &str) -> Result<Credentials, StoreError>;
}

/// Shallow-merge two JSON objects; non-object patches replace the target.
pub fn merge_fields(target: &mut Value, patch: Value) {
    match (target.as_object_mut(), patch) {
        (Some(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key, value);
            }
        }
        (_, patch) => *target = patch,
    }
}
