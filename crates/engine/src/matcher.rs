//! Trigger matcher: inbound event → automation(s).
//!
//! Looks the event up in the current registry snapshot, runs the trigger's
//! verification strategy and decodes the payload. Verification happens
//! here, before the context builder reserves an idempotency key.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{EngineError, VerifyError};
use crate::models::{Automation, BodyShape, EventTarget, Trigger, TriggerEvent, TriggerSource};
use crate::registry::RegistryHandle;
use crate::verify::{Handshake, VerifierParams, VerifierSet};

/// An event paired with the automation it starts.
#[derive(Debug, Clone)]
pub struct MatchedEvent {
    pub automation: Arc<Automation>,
    pub event: TriggerEvent,
}

/// What a GET on an automation path turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Handshake(Handshake),
    /// Plain event delivery for an `http-get` automation.
    Deliver,
}

#[derive(Clone)]
pub struct TriggerMatcher {
    registry: RegistryHandle,
    verifiers: VerifierSet,
}

impl TriggerMatcher {
    pub fn new(registry: RegistryHandle, verifiers: VerifierSet) -> Self {
        Self {
            registry,
            verifiers,
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn verifiers(&self) -> &VerifierSet {
        &self.verifiers
    }

    /// Classify a GET: handshake reply, event delivery, or rejection.
    pub fn handle_get(
        &self,
        path: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<GetOutcome, EngineError> {
        let automation = self
            .registry
            .load()
            .by_route("GET", path)
            .ok_or(EngineError::NoMatch)?;
        let verifier = self
            .verifiers
            .for_trigger(&automation.trigger)
            .ok_or(EngineError::NoMatch)?;
        let params = VerifierParams::for_trigger(&automation.trigger);

        match verifier.handshake(query, &params) {
            Some(Ok(reply)) => Ok(GetOutcome::Handshake(reply)),
            Some(Err(e)) => Err(e.into()),
            None if matches!(automation.trigger, Trigger::HttpGet { .. }) => Ok(GetOutcome::Deliver),
            None => Err(VerifyError::UnsupportedHandshake.into()),
        }
    }

    /// Resolve the automations `event` starts.
    ///
    /// HTTP events that match nothing are an error (the caller answers 404);
    /// cron and database events that match nothing are dropped.
    pub fn match_event(&self, mut event: TriggerEvent) -> Result<Vec<MatchedEvent>, EngineError> {
        let registry = self.registry.load();

        match &event.target {
            EventTarget::Http { method, path } => {
                let automation = registry
                    .by_route(method, path)
                    .ok_or(EngineError::NoMatch)?;
                let verifier = self
                    .verifiers
                    .for_trigger(&automation.trigger)
                    .ok_or(EngineError::NoMatch)?;
                let params = VerifierParams::for_trigger(&automation.trigger);

                verifier.verify(&event.transport, &params)?;
                event.delivery_id = verifier.delivery_id(&event.transport, &params);

                if method == "POST" {
                    event.payload = decode_body(&automation.trigger, &event)?;
                }
                if matches!(automation.trigger, Trigger::Webhook { .. }) {
                    event.source = TriggerSource::Webhook;
                }
                Ok(vec![MatchedEvent { automation, event }])
            }

            EventTarget::Cron { automation_id, .. } => match registry.get(automation_id) {
                Some(automation) if matches!(automation.trigger, Trigger::Cron { .. }) => {
                    Ok(vec![MatchedEvent { automation, event }])
                }
                _ => {
                    debug!(automation_id = %automation_id, "cron tick for unknown automation dropped");
                    Ok(Vec::new())
                }
            },

            EventTarget::Record { table, .. } => {
                let automations = registry.by_table(table);
                if automations.is_empty() {
                    debug!(table = %table, "record event without automations dropped");
                }
                Ok(automations
                    .into_iter()
                    .map(|automation| MatchedEvent {
                        automation,
                        event: event.clone(),
                    })
                    .collect())
            }
        }
    }
}

/// Decode a POST body per the trigger's hint, falling back on the
/// `content-type` header.
fn decode_body(trigger: &Trigger, event: &TriggerEvent) -> Result<Value, EngineError> {
    let raw = &event.transport.raw_body;
    let hinted = match trigger {
        Trigger::HttpPost { body_shape, .. } => *body_shape,
        _ => None,
    };
    let shape = hinted.unwrap_or_else(|| {
        match event.transport.header("content-type") {
            Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => BodyShape::Form,
            Some(ct) if ct.starts_with("text/") => BodyShape::Text,
            _ => BodyShape::Json,
        }
    });

    if raw.is_empty() {
        return Ok(Value::Null);
    }

    match shape {
        BodyShape::Json => {
            serde_json::from_slice(raw).map_err(|e| EngineError::BadPayload(e.to_string()))
        }
        BodyShape::Text => Ok(Value::String(String::from_utf8_lossy(raw).into_owned())),
        BodyShape::Form => {
            let body = std::str::from_utf8(raw).map_err(|e| EngineError::BadPayload(e.to_string()))?;
            Ok(Value::Object(parse_form(body)))
        }
    }
}

/// `a=1&b=two+words` → `{"a": "1", "b": "two words"}`.
fn parse_form(body: &str) -> Map<String, Value> {
    reqwest::Url::parse(&format!("http://form.invalid/?{body}"))
        .map(|url| {
            url.query_pairs()
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Transport;
    use crate::registry::TriggerRegistry;
    use crate::verify::sign_hex;
    use serde_json::json;

    fn post_trigger(secret: Option<&str>, body_shape: Option<BodyShape>) -> Trigger {
        Trigger::HttpPost {
            path: "/hooks/lead".into(),
            respond_immediately: false,
            body_shape,
            secret: secret.map(str::to_string),
            signature_header: None,
            delivery_id_header: Some("x-delivery-id".into()),
        }
    }

    fn matcher(automations: Vec<Automation>) -> TriggerMatcher {
        let verifiers = VerifierSet::default();
        let registry = TriggerRegistry::build(automations, &verifiers).unwrap();
        TriggerMatcher::new(RegistryHandle::new(registry), verifiers)
    }

    fn post(body: &[u8], headers: &[(&str, &str)]) -> TriggerEvent {
        let mut transport = Transport {
            raw_body: body.to_vec(),
            ..Transport::default()
        };
        for (k, v) in headers {
            transport.headers.insert(k.to_string(), v.to_string());
        }
        TriggerEvent::http("POST", "/hooks/lead", Value::Null, transport)
    }

    #[test]
    fn signed_post_matches_and_decodes() {
        let m = matcher(vec![Automation::new("lead", post_trigger(Some("k"), None), vec![])]);
        let body = br#"{"email":"a@b.c"}"#;
        let sig = sign_hex("k", body);
        let matched = m
            .match_event(post(body, &[("x-signature", &sig), ("x-delivery-id", "d-9")]))
            .unwrap();

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].event.payload, json!({ "email": "a@b.c" }));
        assert_eq!(matched[0].event.delivery_id.as_deref(), Some("d-9"));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let m = matcher(vec![Automation::new("lead", post_trigger(Some("k"), None), vec![])]);
        let err = m
            .match_event(post(b"{}", &[("x-signature", "00ff")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Verification(VerifyError::BadSignature)));
    }

    #[test]
    fn unknown_path_is_no_match() {
        let m = matcher(vec![]);
        assert!(matches!(m.match_event(post(b"{}", &[])), Err(EngineError::NoMatch)));
    }

    #[test]
    fn form_and_text_bodies() {
        let m = matcher(vec![Automation::new("lead", post_trigger(None, None), vec![])]);
        let matched = m
            .match_event(post(
                b"name=Ada+Lovelace&plan=pro%2B",
                &[("content-type", "application/x-www-form-urlencoded")],
            ))
            .unwrap();
        assert_eq!(
            matched[0].event.payload,
            json!({ "name": "Ada Lovelace", "plan": "pro+" })
        );

        let m = matcher(vec![Automation::new(
            "lead",
            post_trigger(None, Some(BodyShape::Text)),
            vec![],
        )]);
        let matched = m.match_event(post(b"{not json", &[])).unwrap();
        assert_eq!(matched[0].event.payload, json!("{not json"));
    }

    #[test]
    fn malformed_json_is_bad_payload() {
        let m = matcher(vec![Automation::new("lead", post_trigger(None, None), vec![])]);
        assert!(matches!(
            m.match_event(post(b"{not json", &[])),
            Err(EngineError::BadPayload(_))
        ));
    }

    #[test]
    fn get_handshake_and_delivery() {
        let get = Automation::new(
            "verify",
            Trigger::HttpGet {
                path: "/hooks/fb".into(),
                verify_token: Some("s3cr3t".into()),
            },
            vec![],
        );
        let m = matcher(vec![get]);
        let query = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };

        assert_eq!(
            m.handle_get(
                "/hooks/fb",
                &query(&[
                    ("hub.mode", "subscribe"),
                    ("hub.verify_token", "s3cr3t"),
                    ("hub.challenge", "abc123")
                ])
            )
            .unwrap(),
            GetOutcome::Handshake(Handshake::Echo("abc123".into()))
        );
        assert!(matches!(
            m.handle_get(
                "/hooks/fb",
                &query(&[("hub.mode", "subscribe"), ("hub.verify_token", "nope")])
            ),
            Err(EngineError::Verification(VerifyError::TokenMismatch))
        ));
        assert_eq!(
            m.handle_get("/hooks/fb", &query(&[("page", "2")])).unwrap(),
            GetOutcome::Deliver
        );
        assert!(matches!(
            m.handle_get("/elsewhere", &query(&[("hub.mode", "subscribe")])),
            Err(EngineError::NoMatch)
        ));
    }

    #[test]
    fn record_events_fan_out_to_every_table_subscriber() {
        let on = |id: &str| {
            Automation::new(id, Trigger::DatabaseRecordCreated { table: "orders".into() }, vec![])
        };
        let m = matcher(vec![on("a"), on("b")]);
        let record = nodes::Record {
            id: "r1".into(),
            table: "orders".into(),
            fields: json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let matched = m.match_event(TriggerEvent::record(&record)).unwrap();
        assert_eq!(matched.len(), 2);

        let other = nodes::Record {
            table: "invoices".into(),
            ..record
        };
        assert!(m.match_event(TriggerEvent::record(&other)).unwrap().is_empty());
    }
}
