//! Third-party connector actions.
//!
//! Most SaaS connector calls are "authenticated REST request with a few path
//! parameters", so [`RestConnector`] covers them from a method + path
//! template. Path parameters are written `{name}` and filled from the action
//! parameters; the remaining parameters become the query string (GET/DELETE)
//! or the JSON body (everything else).

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Map, Value};

use crate::http::{parse_method, send, IDEMPOTENCY_HEADER};
use crate::{ActionContext, ActionError, ActionHandler};

pub struct RestConnector {
    client: Client,
    base_url: String,
    method: Method,
    path: String,
    fixed_query: Vec<(String, String)>,
}

impl RestConnector {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        method: &str,
        path: impl Into<String>,
    ) -> Result<Self, ActionError> {
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            method: parse_method(method)?,
            path: path.into(),
            fixed_query: Vec::new(),
        })
    }

    /// Query parameter sent on every call.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fixed_query.push((name.into(), value.into()));
        self
    }

    /// `calendly.get-event-type` — `{ "uuid": "..." }`.
    pub fn calendly_get_event_type(client: Client) -> Self {
        Self {
            client,
            base_url: "https://api.calendly.com".into(),
            method: Method::GET,
            path: "/event_types/{uuid}".into(),
            fixed_query: Vec::new(),
        }
    }

    /// `google-sheets.append-values` — `{ "spreadsheet_id", "range", "values": [[...]] }`.
    pub fn google_sheets_append_values(client: Client) -> Self {
        Self {
            client,
            base_url: "https://sheets.googleapis.com/v4".into(),
            method: Method::POST,
            path: "/spreadsheets/{spreadsheet_id}/values/{range}:append".into(),
            fixed_query: vec![("valueInputOption".into(), "USER_ENTERED".into())],
        }
    }

    /// Fill `{name}` segments from `params`, consuming the used keys.
    fn render_path(&self, params: &mut Map<String, Value>) -> Result<String, ActionError> {
        let mut rendered = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let close = rest[open..].find('}').ok_or_else(|| {
                ActionError::Permanent(format!("unterminated placeholder in '{}'", self.path))
            })? + open;
            let name = &rest[open + 1..close];
            let value = params.remove(name).ok_or_else(|| {
                ActionError::Permanent(format!("missing path parameter '{name}'"))
            })?;
            let segment = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            rendered.push_str(&segment);
            rest = &rest[close + 1..];
        }
        rendered.push_str(rest);
        Ok(rendered)
    }
}

fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

#[async_trait]
impl ActionHandler for RestConnector {
    async fn execute(&self, params: Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let credentials = ctx.credentials.as_ref().ok_or_else(|| {
            ActionError::Permanent("connector action requires a connection".into())
        })?;
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ActionError::Permanent(format!(
                    "connector parameters must be an object, got {other}"
                )))
            }
        };

        let url = format!("{}{}", self.base_url, self.render_path(&mut params)?);
        let mut request = self
            .client
            .request(self.method.clone(), url)
            .header(reqwest::header::AUTHORIZATION, credentials.authorization())
            .header(IDEMPOTENCY_HEADER, &ctx.idempotency_key)
            .query(&self.fixed_query);

        request = if self.method == Method::GET || self.method == Method::DELETE {
            request.query(&query_pairs(&params))
        } else {
            request.json(&Value::Object(params))
        };

        send(request).await
    }
}
