//! `api` crate — axum HTTP surface of the automation engine.
//!
//! Routes:
//!   GET    /healthz
//!   GET    /api/v1/automations
//!   POST   /api/v1/automations/reload
//!   GET    /api/v1/automations/:id/runs
//!   GET    /api/v1/runs/:run_id
//!   POST   /api/v1/runs/:run_id/cancel
//!   GET|POST <any other path>   automation trigger paths

pub mod error;
pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use engine::Engine;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/v1/automations", get(handlers::automations::list))
        .route("/api/v1/automations/reload", post(handlers::automations::reload))
        .route("/api/v1/automations/:id/runs", get(handlers::executions::list_for_automation))
        .route("/api/v1/runs/:run_id", get(handlers::executions::get))
        .route("/api/v1/runs/:run_id/cancel", post(handlers::executions::cancel))
        // Everything else is an automation path.
        .fallback(handlers::webhooks::dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http listener bound");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use engine::models::ActionKind;
    use engine::verify::sign_hex;
    use engine::{
        ActionDispatcher, ActionNode, Automation, EngineConfig, EngineParts,
        InMemoryIdempotencyStore, InMemoryRunLedger, StaticSource, Trigger, VerifierSet,
    };
    use nodes::mock::MockHandler;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> (Router, Engine) {
        let automations = vec![
            Automation::new(
                "fb-verify",
                Trigger::HttpGet {
                    path: "/hooks/fb".into(),
                    verify_token: Some("s3cr3t".into()),
                },
                vec![],
            ),
            Automation::new(
                "lead",
                Trigger::HttpPost {
                    path: "/hooks/lead".into(),
                    respond_immediately: false,
                    body_shape: None,
                    secret: Some("k".into()),
                    signature_header: None,
                    delivery_id_header: None,
                },
                vec![ActionNode::new(ActionKind::Connector {
                    connector: "crm.sync".into(),
                    connection_id: None,
                    params: json!({ "email": "{{trigger.body.email}}" }),
                })],
            ),
        ];
        let engine = Engine::start(EngineParts {
            config: EngineConfig::default(),
            source: Arc::new(StaticSource(automations)),
            dispatcher: ActionDispatcher::builder()
                .connector("crm.sync", Arc::new(MockHandler::returning("crm", json!({}))))
                .build(),
            ledger: Arc::new(InMemoryRunLedger::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            records: None,
            verifiers: VerifierSet::default(),
        })
        .await
        .unwrap();
        (
            router(AppState {
                engine: engine.clone(),
            }),
            engine,
        )
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn hub_challenge_is_echoed() {
        let (app, engine) = app().await;
        let response = app
            .oneshot(
                Request::get(
                    "/hooks/fb?hub.mode=subscribe&hub.verify_token=s3cr3t&hub.challenge=abc123",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"abc123");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn wrong_verify_token_is_unauthorized() {
        let (app, engine) = app().await;
        let response = app
            .oneshot(
                Request::get(
                    "/hooks/fb?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=abc123",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!body_bytes(response).await.windows(6).any(|w| w == b"abc123"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (app, engine) = app().await;
        let response = app
            .oneshot(Request::post("/hooks/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn signed_post_returns_the_finished_run() {
        let (app, engine) = app().await;
        let body = br#"{"email":"ada@example.com"}"#;
        let request = || {
            Request::post("/hooks/lead")
                .header("content-type", "application/json")
                .header("x-signature", sign_hex("k", body))
                .body(Body::from(body.to_vec()))
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(reply["status"], json!("succeeded"));

        // Same payload again: duplicate, same run.
        let again = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        let replay: Value = serde_json::from_slice(&body_bytes(again).await).unwrap();
        assert_eq!(replay["run_id"], reply["run_id"]);

        let run_id = reply["run_id"].as_str().unwrap();
        let ledger = app
            .oneshot(
                Request::get(format!("/api/v1/runs/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ledger.status(), StatusCode::OK);
        let run: Value = serde_json::from_slice(&body_bytes(ledger).await).unwrap();
        assert_eq!(run["steps"].as_array().unwrap().len(), 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unsigned_post_is_unauthorized() {
        let (app, engine) = app().await;
        let response = app
            .oneshot(
                Request::post("/hooks/lead")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn admin_routes() {
        let (app, engine) = app().await;

        let list = app
            .clone()
            .oneshot(Request::get("/api/v1/automations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let automations: Value = serde_json::from_slice(&body_bytes(list).await).unwrap();
        assert_eq!(automations.as_array().unwrap().len(), 2);
        assert_eq!(automations[0]["id"], json!("fb-verify"));

        let missing = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/runs/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let reload = app
            .clone()
            .oneshot(
                Request::post("/api/v1/automations/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(reload.status(), StatusCode::OK);

        engine.shutdown().await;
        let health = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
