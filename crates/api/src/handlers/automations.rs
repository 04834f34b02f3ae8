use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct AutomationSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub trigger: &'static str,
    pub actions: usize,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<AutomationSummary>> {
    let mut automations: Vec<AutomationSummary> = state
        .engine
        .automations()
        .iter()
        .map(|a| AutomationSummary {
            id: a.id.clone(),
            name: a.name.clone(),
            description: a.description.clone(),
            trigger: a.trigger.kind(),
            actions: a.actions.len(),
        })
        .collect();
    automations.sort_by(|a, b| a.id.cmp(&b.id));
    Json(automations)
}

/// Re-read the automation source; the old registry stays on failure.
pub async fn reload(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let count = state.engine.reload().await?;
    info!(automations = count, "automations reloaded");
    Ok(Json(json!({ "automations": count })))
}
