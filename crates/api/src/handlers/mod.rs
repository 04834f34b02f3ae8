pub mod automations;
pub mod executions;
pub mod webhooks;

use axum::extract::State;
use axum::http::StatusCode;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.engine.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ok")
    }
}
