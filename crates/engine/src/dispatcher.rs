//! Action dispatcher: action kind → handler.
//!
//! The dispatch table is built once at startup. Preparing an action renders
//! its parameters against the execution context and binds the handler;
//! connector actions additionally look up credentials from the Connection
//! Store on every attempt, so a rotated token is picked up by the next retry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use nodes::connector::RestConnector;
use nodes::http::HttpRequestHandler;
use nodes::record::{CreateRecordHandler, DeleteRecordHandler, UpdateRecordHandler};
use nodes::{ActionContext, ActionError, ActionHandler, ConnectionStore, RecordStore};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::models::ActionKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Http,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
    Connector(String),
}

impl HandlerKey {
    /// `None` for control-flow actions that have no handler.
    pub fn for_action(kind: &ActionKind) -> Option<Self> {
        match kind {
            ActionKind::HttpRequest { .. } => Some(Self::Http),
            ActionKind::CreateRecord { .. } => Some(Self::CreateRecord),
            ActionKind::UpdateRecord { .. } => Some(Self::UpdateRecord),
            ActionKind::DeleteRecord { .. } => Some(Self::DeleteRecord),
            ActionKind::Connector { connector, .. } => Some(Self::Connector(connector.clone())),
            ActionKind::SplitIntoPaths { .. } => None,
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http-request"),
            Self::CreateRecord => f.write_str("create-record"),
            Self::UpdateRecord => f.write_str("update-record"),
            Self::DeleteRecord => f.write_str("delete-record"),
            Self::Connector(name) => f.write_str(name),
        }
    }
}

/// Template parameters of an action, before substitution.
pub fn raw_params(kind: &ActionKind) -> Value {
    match kind {
        ActionKind::Connector { params, .. } => params.clone(),
        other => {
            let mut value = serde_json::to_value(other).unwrap_or(Value::Null);
            if let Some(map) = value.as_object_mut() {
                map.remove("type");
            }
            value
        }
    }
}

/// An action ready to be attempted.
pub struct PreparedAction {
    pub key: HandlerKey,
    /// Parameters after variable substitution.
    pub params: Value,
    pub handler: Arc<dyn ActionHandler>,
}

pub struct ActionDispatcher {
    handlers: HashMap<HandlerKey, Arc<dyn ActionHandler>>,
    connections: Option<Arc<dyn ConnectionStore>>,
}

impl ActionDispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn has_handler(&self, key: &HandlerKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Render `kind`'s parameters and bind its handler. Every failure here
    /// is permanent: retrying cannot fix a missing handler or a bad path.
    pub fn prepare(
        &self,
        kind: &ActionKind,
        ctx: &ExecutionContext,
    ) -> Result<PreparedAction, ActionError> {
        let key = HandlerKey::for_action(kind).ok_or_else(|| {
            ActionError::Permanent("split-into-paths is not dispatchable".to_string())
        })?;
        let handler = self
            .handlers
            .get(&key)
            .cloned()
            .ok_or_else(|| ActionError::Permanent(format!("no handler registered for '{key}'")))?;
        let params = ctx
            .render(&raw_params(kind))
            .map_err(|e| ActionError::Permanent(e.to_string()))?;

        let handler = match kind {
            ActionKind::Connector { connection_id, .. } => Arc::new(WithCredentials {
                inner: handler,
                connections: self.connections.clone(),
                connection_id: connection_id.clone(),
            }) as Arc<dyn ActionHandler>,
            _ => handler,
        };

        Ok(PreparedAction {
            key,
            params,
            handler,
        })
    }
}

/// Resolves credentials before delegating to a connector handler.
struct WithCredentials {
    inner: Arc<dyn ActionHandler>,
    connections: Option<Arc<dyn ConnectionStore>>,
    connection_id: Option<String>,
}

#[async_trait]
impl ActionHandler for WithCredentials {
    async fn execute(&self, params: Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let credentials = match (&self.connection_id, &self.connections) {
            (Some(id), Some(store)) => Some(store.get_credentials(id).await?),
            (Some(id), None) => {
                return Err(ActionError::Permanent(format!(
                    "connection '{id}' requested but no connection store is configured"
                )))
            }
            (None, _) => None,
        };

        let ctx = ActionContext {
            credentials,
            ..ctx.clone()
        };
        self.inner.execute(params, &ctx).await
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<HandlerKey, Arc<dyn ActionHandler>>,
    connections: Option<Arc<dyn ConnectionStore>>,
}

impl DispatcherBuilder {
    /// HTTP, record and the bundled REST connector handlers.
    pub fn with_builtins(self, client: reqwest::Client, records: Arc<dyn RecordStore>) -> Self {
        self.register(HandlerKey::Http, Arc::new(HttpRequestHandler::new(client.clone())))
            .register(
                HandlerKey::CreateRecord,
                Arc::new(CreateRecordHandler::new(records.clone())),
            )
            .register(
                HandlerKey::UpdateRecord,
                Arc::new(UpdateRecordHandler::new(records.clone())),
            )
            .register(HandlerKey::DeleteRecord, Arc::new(DeleteRecordHandler::new(records)))
            .connector(
                "calendly.get-event-type",
                Arc::new(RestConnector::calendly_get_event_type(client.clone())),
            )
            .connector(
                "google-sheets.append-values",
                Arc::new(RestConnector::google_sheets_append_values(client)),
            )
    }

    pub fn register(mut self, key: HandlerKey, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(key, handler);
        self
    }

    pub fn connector(self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(HandlerKey::Connector(name.into()), handler)
    }

    pub fn connections(mut self, store: Arc<dyn ConnectionStore>) -> Self {
        self.connections = Some(store);
        self
    }

    pub fn build(self) -> ActionDispatcher {
        ActionDispatcher {
            handlers: self.handlers,
            connections: self.connections,
        }
    }
}
