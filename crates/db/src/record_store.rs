//! Postgres-backed Record Store.
//!
//! Inserts fire the `record_created` NOTIFY channel (see the migration); each
//! subscription holds its own `PgListener` and re-reads the row by id.

use async_trait::async_trait;
use futures::StreamExt;
use nodes::{Record, RecordStore, RecordStream, StoreError};
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::PgListener;
use tracing::warn;
use uuid::Uuid;

use crate::models::RecordRow;
use crate::repository::records;
use crate::{DbError, DbPool};

const CHANNEL: &str = "record_created";

#[derive(Debug, Deserialize)]
struct Notification {
    id: Uuid,
    table: String,
}

pub struct PgRecordStore {
    pool: DbPool,
}

impl PgRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            id: row.id.to_string(),
            table: row.table_name,
            fields: row.fields,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn store_error(err: DbError, what: String) -> StoreError {
    match err {
        DbError::NotFound => StoreError::NotFound(what),
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn parse_id(id: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(id).map_err(|_| StoreError::Invalid(format!("record id '{id}' is not a uuid")))
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_record(&self, table: &str, fields: Value) -> Result<Record, StoreError> {
        if !fields.is_object() {
            return Err(StoreError::Invalid("record fields must be a JSON object".into()));
        }
        records::insert_record(&self.pool, table, fields)
            .await
            .map(Record::from)
            .map_err(|e| store_error(e, table.to_string()))
    }

    async fn update_record(
        &self,
        table: &str,
        id: &str,
        fields: Value,
    ) -> Result<Record, StoreError> {
        let uuid = parse_id(id)?;
        records::update_record(&self.pool, table, uuid, fields)
            .await
            .map(Record::from)
            .map_err(|e| store_error(e, format!("{table}/{id}")))
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let uuid = parse_id(id)?;
        records::delete_record(&self.pool, table, uuid)
            .await
            .map_err(|e| store_error(e, format!("{table}/{id}")))
    }

    async fn on_record_created(&self, table: &str) -> Result<RecordStream, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        listener
            .listen(CHANNEL)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let table = table.to_string();
        let pool = self.pool.clone();
        let stream = listener.into_stream().filter_map(move |notification| {
            let table = table.clone();
            let pool = pool.clone();
            async move {
                let notification = match notification {
                    Ok(n) => n,
                    Err(err) => {
                        warn!(%table, error = %err, "record listener error");
                        return None;
                    }
                };
                let parsed: Notification = match serde_json::from_str(notification.payload()) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(%table, error = %err, "malformed record notification");
                        return None;
                    }
                };
                if parsed.table != table {
                    return None;
                }
                match records::get_record(&pool, parsed.id).await {
                    Ok(row) => Some(Record::from(row)),
                    Err(err) => {
                        warn!(%table, id = %parsed.id, error = %err, "created record vanished");
                        None
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
