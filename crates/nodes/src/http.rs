//! Generic outbound HTTP call.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{ActionContext, ActionError, ActionHandler};

/// Header carrying the run's idempotency key to downstream providers.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
struct HttpRequestParams {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    query: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Map an HTTP status to an error, `None` for success.
///
/// 408, 429 and 5xx are transient; every other 4xx is permanent.
pub fn classify_status(status: StatusCode) -> Option<ActionError> {
    if status.is_success() || status.is_redirection() || status.is_informational() {
        return None;
    }
    let message = format!("downstream responded {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Some(ActionError::Transient(message))
    } else {
        Some(ActionError::Permanent(message))
    }
}

/// Map a transport error: request construction is permanent, everything on
/// the wire (timeouts, resets, refused connections) is transient.
pub fn classify_transport(err: reqwest::Error) -> ActionError {
    if err.is_builder() {
        ActionError::Permanent(format!("invalid request: {err}"))
    } else {
        ActionError::Transient(format!("request failed: {err}"))
    }
}

pub(crate) fn parse_method(method: &str) -> Result<Method, ActionError> {
    Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| ActionError::Permanent(format!("invalid HTTP method '{method}'")))
}

/// Send a request and turn the response into the action output
/// `{ "status": <u16>, "body": <json or text> }`.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<Value, ActionError> {
    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();
    if let Some(err) = classify_status(status) {
        return Err(err);
    }
    let text = response.text().await.map_err(classify_transport)?;
    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    Ok(json!({ "status": status.as_u16(), "body": body }))
}

/// Built-in handler for `http-request` actions.
pub struct HttpRequestHandler {
    client: Client,
}

impl HttpRequestHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRequestHandler {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl ActionHandler for HttpRequestHandler {
    async fn execute(&self, params: Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let params: HttpRequestParams =
            serde_json::from_value(params).map_err(ActionError::invalid_params)?;
        let method = parse_method(&params.method)?;

        debug!(method = %method, url = %params.url, action = %ctx.action_path, "outbound http call");

        let mut request = self
            .client
            .request(method, &params.url)
            .header(IDEMPOTENCY_HEADER, &ctx.idempotency_key)
            .query(&params.query);
        for (name, value) in &params.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &params.body {
            request = request.json(body);
        }

        send(request).await
    }
}
