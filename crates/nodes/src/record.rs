//! Database record CRUD against the Record Store collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::store::RecordStore;
use crate::{ActionContext, ActionError, ActionHandler};

#[derive(Debug, Deserialize)]
struct CreateParams {
    table: String,
    fields: Value,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    table: String,
    record_id: String,
    fields: Value,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    table: String,
    record_id: String,
}

fn record_output(record: crate::store::Record) -> Result<Value, ActionError> {
    serde_json::to_value(record).map_err(|e| ActionError::Permanent(e.to_string()))
}

pub struct CreateRecordHandler {
    store: Arc<dyn RecordStore>,
}

impl CreateRecordHandler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for CreateRecordHandler {
    async fn execute(&self, params: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        let params: CreateParams =
            serde_json::from_value(params).map_err(ActionError::invalid_params)?;
        let record = self.store.create_record(&params.table, params.fields).await?;
        record_output(record)
    }
}

pub struct UpdateRecordHandler {
    store: Arc<dyn RecordStore>,
}

impl UpdateRecordHandler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for UpdateRecordHandler {
    async fn execute(&self, params: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        let params: UpdateParams =
            serde_json::from_value(params).map_err(ActionError::invalid_params)?;
        let record = self
            .store
            .update_record(&params.table, &params.record_id, params.fields)
            .await?;
        record_output(record)
    }
}

pub struct DeleteRecordHandler {
    store: Arc<dyn RecordStore>,
}

impl DeleteRecordHandler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for DeleteRecordHandler {
    async fn execute(&self, params: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        let params: DeleteParams =
            serde_json::from_value(params).map_err(ActionError::invalid_params)?;
        self.store
            .delete_record(&params.table, &params.record_id)
            .await?;
        Ok(json!({ "id": params.record_id, "deleted": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::ctx;
    use crate::memory::InMemoryRecordStore;

    #[tokio::test]
    async fn create_then_update_then_delete() {
        let store = Arc::new(InMemoryRecordStore::new());
        let create = CreateRecordHandler::new(store.clone());
        let update = UpdateRecordHandler::new(store.clone());
        let delete = DeleteRecordHandler::new(store.clone());

        let created = create
            .execute(json!({ "table": "leads", "fields": { "email": "a@b.c" } }), &ctx())
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let updated = update
            .execute(
                json!({ "table": "leads", "record_id": id, "fields": { "score": 9 } }),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(updated["fields"]["email"], "a@b.c");
        assert_eq!(updated["fields"]["score"], 9);

        delete
            .execute(json!({ "table": "leads", "record_id": id }), &ctx())
            .await
            .unwrap();
        assert_eq!(store.count("leads"), 0);
    }

    #[tokio::test]
    async fn updating_missing_record_is_permanent() {
        let store = Arc::new(InMemoryRecordStore::new());
        let err = UpdateRecordHandler::new(store)
            .execute(
                json!({ "table": "leads", "record_id": "ghost", "fields": {} }),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Permanent(_)));
    }
}
