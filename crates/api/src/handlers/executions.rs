use axum::extract::{Path, Query, State};
use axum::Json;
use engine::ExecutionRun;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{ApiError, AppState};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// A run with its full step ledger.
pub async fn get(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<ExecutionRun>, ApiError> {
    Ok(Json(state.engine.get_run(run_id).await?))
}

/// Most recent runs of one automation, without steps.
pub async fn list_for_automation(
    Path(id): Path<String>,
    Query(params): Query<ListParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExecutionRun>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.engine.list_runs(&id, limit).await?))
}

pub async fn cancel(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.engine.cancel(run_id).await?;
    Ok(Json(json!({ "run_id": run_id, "cancelled": cancelled })))
}
