//! In-memory collaborators for tests and single-node deployments.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

use crate::store::{merge_fields, ConnectionStore, Record, RecordStore, RecordStream};
use crate::{Credentials, StoreError};

/// Record store keeping every table in a `DashMap` and fanning inserts out
/// over a broadcast channel.
pub struct InMemoryRecordStore {
    records: DashMap<(String, String), Record>,
    created: broadcast::Sender<Record>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        let (created, _) = broadcast::channel(1024);
        Self {
            records: DashMap::new(),
            created,
        }
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.records
            .get(&(table.to_string(), id.to_string()))
            .map(|r| r.clone())
    }

    pub fn count(&self, table: &str) -> usize {
        self.records.iter().filter(|r| r.key().0 == table).count()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_record(&self, table: &str, fields: Value) -> Result<Record, StoreError> {
        if !fields.is_object() {
            return Err(StoreError::Invalid("record fields must be a JSON object".into()));
        }
        let now = Utc::now();
        let record = Record {
            id: Uuid::new_v4().to_string(),
            table: table.to_string(),
            fields,
            created_at: now,
            updated_at: now,
        };
        self.records
            .insert((table.to_string(), record.id.clone()), record.clone());
        // No subscribers is fine.
        let _ = self.created.send(record.clone());
        Ok(record)
    }

    async fn update_record(
        &self,
        table: &str,
        id: &str,
        fields: Value,
    ) -> Result<Record, StoreError> {
        let mut entry = self
            .records
            .get_mut(&(table.to_string(), id.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("{table}/{id}")))?;
        merge_fields(&mut entry.fields, fields);
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<(), StoreError> {
        self.records
            .remove(&(table.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{table}/{id}")))
    }

    async fn on_record_created(&self, table: &str) -> Result<RecordStream, StoreError> {
        let table = table.to_string();
        let stream = BroadcastStream::new(self.created.subscribe()).filter_map(move |item| {
            let table = table.clone();
            async move {
                match item {
                    Ok(record) if record.table == table => Some(record),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(%table, error = %err, "record subscription lagged");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Connection store backed by a map of connection id → credentials.
#[derive(Default)]
pub struct InMemoryConnectionStore {
    connections: DashMap<String, Credentials>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection_id: impl Into<String>, credentials: Credentials) {
        self.connections.insert(connection_id.into(), credentials);
    }

    /// Load a `{ "<connection id>": { "access_token": ... } }` JSON file.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        let parsed: HashMap<String, Credentials> = serde_json::from_str(&content)
            .map_err(|e| StoreError::Invalid(format!("{}: {e}", path.display())))?;
        let store = Self::new();
        for (id, credentials) in parsed {
            store.insert(id, credentials);
        }
        Ok(store)
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn get_credentials(&self, connection_id: &str) -> Result<Credentials, StoreError> {
        self.connections
            .get(connection_id)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::NotFound(format!("connection '{connection_id}'")))
    }
}
