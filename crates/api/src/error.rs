//! Mapping of engine failures onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine::{EngineError, VerifyError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => match e {
                EngineError::NoMatch
                | EngineError::RunNotFound(_)
                | EngineError::Verification(VerifyError::UnsupportedHandshake) => {
                    StatusCode::NOT_FOUND
                }
                EngineError::Verification(_) => StatusCode::UNAUTHORIZED,
                EngineError::BadPayload(_) => StatusCode::BAD_REQUEST,
                EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::InvalidAutomation { .. } | EngineError::Registry(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                EngineError::Ledger(_) | EngineError::Source(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match status {
            StatusCode::UNAUTHORIZED => warn!(error = %self, "request rejected"),
            s if s.is_server_error() => error!(error = %self, "request failed"),
            _ => info!(error = %self, status = status.as_u16(), "request rejected"),
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_status_codes() {
        let status = |e: EngineError| ApiError::from(e).status();
        assert_eq!(status(EngineError::NoMatch), StatusCode::NOT_FOUND);
        assert_eq!(
            status(EngineError::Verification(VerifyError::TokenMismatch)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(EngineError::Verification(VerifyError::UnsupportedHandshake)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(EngineError::BadPayload("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(EngineError::ShuttingDown), StatusCode::SERVICE_UNAVAILABLE);
    }
}
