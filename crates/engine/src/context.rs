//! Per-run execution context and `{{ path }}` placeholder substitution.
//!
//! The context is a JSON document with three scopes:
//!
//! - `trigger`: `{ id, source, received_at, body, query, headers, delivery_id }`
//! - `run`: `{ id, automation_id, idempotency_key }`
//! - `steps`: outputs of named actions executed so far on this path
//!
//! Branches work on clones, so a path's outputs never reach its siblings or
//! its parent.

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::models::{ExecutionRun, TriggerEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder path '{0}'")]
    UnknownPath(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    root: Value,
}

impl ExecutionContext {
    pub fn new(run: &ExecutionRun, event: &TriggerEvent) -> Self {
        let root = json!({
            "trigger": {
                "id": event.id,
                "source": event.source,
                "received_at": event.received_at,
                "body": event.payload,
                "query": event.transport.query,
                "headers": event.transport.headers,
                "delivery_id": event.delivery_id,
            },
            "run": {
                "id": run.run_id,
                "automation_id": run.automation_id,
                "idempotency_key": run.idempotency_key,
            },
            "steps": {},
        });
        Self { root }
    }

    /// Context over an arbitrary document, for condition tests and previews.
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Expose a named action's output as `steps.<name>`.
    pub fn set_step_output(&mut self, name: &str, output: Value) {
        if let Some(steps) = self.root.get_mut("steps").and_then(Value::as_object_mut) {
            steps.insert(name.to_string(), output);
        } else if let Some(root) = self.root.as_object_mut() {
            let mut steps = Map::new();
            steps.insert(name.to_string(), output);
            root.insert("steps".into(), Value::Object(steps));
        }
    }

    /// Resolve a dotted path; numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .map(str::trim)
            .try_fold(&self.root, |current, segment| match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    /// Substitute every placeholder in `template`, recursing into arrays and
    /// objects. A string that is exactly one placeholder takes the JSON type
    /// of the resolved value; placeholders embedded in text are stringified.
    pub fn render(&self, template: &Value) -> Result<Value, TemplateError> {
        match template {
            Value::String(s) => self.render_str(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.render(v)?)))
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn render_str(&self, s: &str) -> Result<Value, TemplateError> {
        let segments = split_placeholders(s);

        if let [Segment::Placeholder(path)] = segments.as_slice() {
            return self.resolve(path).cloned();
        }

        let mut out = String::with_capacity(s.len());
        for segment in segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(path) => match self.resolve(path)? {
                    Value::String(value) => out.push_str(value),
                    Value::Null => {}
                    value => out.push_str(&value.to_string()),
                },
            }
        }
        Ok(Value::String(out))
    }

    fn resolve(&self, path: &str) -> Result<&Value, TemplateError> {
        self.lookup(path)
            .ok_or_else(|| TemplateError::UnknownPath(path.to_string()))
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }
}

enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split on `{{ ... }}`. An unterminated `{{` is kept as text.
fn split_placeholders(s: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = s;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        segments.push(Segment::Placeholder(rest[open + 2..open + 2 + close].trim()));
        rest = &rest[open + 2 + close + 2..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::from_value(json!({
            "trigger": { "body": { "email": "a@b.c", "amount": 120, "tags": ["x", "y"] } },
            "steps": { "lead": { "id": "rec-1", "score": 0.5 } }
        }))
    }

    #[test]
    fn whole_placeholder_keeps_json_type() {
        let rendered = ctx()
            .render(&json!({ "amount": "{{ trigger.body.amount }}", "tags": "{{trigger.body.tags}}" }))
            .unwrap();
        assert_eq!(rendered, json!({ "amount": 120, "tags": ["x", "y"] }));
    }

    #[test]
    fn embedded_placeholders_are_stringified() {
        let rendered = ctx()
            .render(&json!("lead {{steps.lead.id}} scored {{ steps.lead.score }}"))
            .unwrap();
        assert_eq!(rendered, json!("lead rec-1 scored 0.5"));
    }

    #[test]
    fn array_indexing_and_nesting() {
        let rendered = ctx()
            .render(&json!([{ "first": "{{trigger.body.tags.0}}" }, 7, null]))
            .unwrap();
        assert_eq!(rendered, json!([{ "first": "x" }, 7, null]));
    }

    #[test]
    fn unknown_path_is_an_error() {
        let err = ctx().render(&json!("{{steps.missing.id}}")).unwrap_err();
        assert_eq!(err, TemplateError::UnknownPath("steps.missing.id".into()));
    }

    #[test]
    fn unterminated_braces_are_literal() {
        let rendered = ctx().render(&json!("{{ not closed")).unwrap();
        assert_eq!(rendered, json!("{{ not closed"));
    }

    #[test]
    fn step_outputs_are_visible_after_set() {
        let mut ctx = ctx();
        ctx.set_step_output("sheet", json!({ "row": 4 }));
        assert_eq!(ctx.lookup("steps.sheet.row"), Some(&json!(4)));

        let branch = ctx.clone();
        ctx.set_step_output("other", json!(1));
        assert!(branch.lookup("steps.other").is_none());
    }
}
