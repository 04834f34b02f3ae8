//! Automation trigger paths.
//!
//! GET answers provider handshakes or delivers an `http-get` event; any
//! other method is published as an event and answered with `{ run_id,
//! status }` once the run is admitted (or finished, when the trigger does
//! not respond immediately).

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine::{Admission, EngineError, GetOutcome, Handshake, Transport, TriggerEvent};
use serde_json::json;
use tracing::debug;

use crate::{ApiError, AppState};

pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = uri.path().to_string();

    if method == Method::GET {
        match state.engine.handle_get(&path, &query)? {
            GetOutcome::Handshake(Handshake::Echo(challenge)) => {
                debug!(path = %path, "handshake answered");
                return Ok((
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/plain")],
                    challenge,
                )
                    .into_response());
            }
            GetOutcome::Handshake(Handshake::Json(reply)) => {
                debug!(path = %path, "handshake answered");
                return Ok((StatusCode::OK, Json(reply)).into_response());
            }
            GetOutcome::Deliver => {}
        }
    }

    let transport = Transport {
        headers: lowercase_headers(&headers),
        query: query.clone(),
        raw_body: body.to_vec(),
    };
    // GET deliveries carry their query as the payload; POST bodies are
    // decoded by the matcher.
    let payload = if method == Method::GET {
        json!(query)
    } else {
        serde_json::Value::Null
    };
    let event = TriggerEvent::http(method.as_str(), path, payload, transport);

    let admission = state
        .engine
        .submit(event)
        .await?
        .into_iter()
        .next()
        .ok_or(EngineError::NoMatch)?;
    Ok(respond(admission).await)
}

async fn respond(admission: Admission) -> Response {
    if admission.duplicate {
        return (StatusCode::OK, Json(run_body(&admission.run))).into_response();
    }
    if admission.respond_immediately {
        return (StatusCode::ACCEPTED, Json(run_body(&admission.run))).into_response();
    }
    let finished = admission.wait().await;
    (StatusCode::OK, Json(run_body(&finished))).into_response()
}

fn run_body(run: &engine::RunSummary) -> serde_json::Value {
    json!({ "run_id": run.run_id, "status": run.status })
}

fn lowercase_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}
