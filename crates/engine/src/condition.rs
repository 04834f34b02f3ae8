//! Branch filter conditions.
//!
//! A condition is a small boolean tree over the execution context:
//!
//! ```json
//! { "all": [
//!     { "field": "trigger.body.amount", "operator": "greater-than", "value": 100 },
//!     { "not": { "field": "steps.lead.email", "operator": "is-empty" } }
//! ] }
//! ```
//!
//! Evaluation is pure: it only reads the context and never fails. A field
//! that does not resolve behaves like JSON `null`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    All { all: Vec<Condition> },
    Any { any: Vec<Condition> },
    Not { not: Box<Condition> },
    Always { always: bool },
    Compare(Comparison),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Dotted context path, e.g. `trigger.body.amount`.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Exists,
    NotExists,
    IsEmpty,
    IsNotEmpty,
}

impl Condition {
    pub fn always() -> Self {
        Condition::Always { always: true }
    }

    pub fn compare(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Condition::Compare(Comparison {
            field: field.into(),
            operator,
            value: Some(value),
        })
    }

    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        match self {
            Condition::All { all } => all.iter().all(|c| c.evaluate(ctx)),
            Condition::Any { any } => any.iter().any(|c| c.evaluate(ctx)),
            Condition::Not { not } => !not.evaluate(ctx),
            Condition::Always { always } => *always,
            Condition::Compare(cmp) => cmp.evaluate(ctx),
        }
    }
}

impl Comparison {
    fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        let actual = ctx.lookup(&self.field).unwrap_or(&Value::Null);
        let expected = self.value.as_ref().unwrap_or(&Value::Null);

        match self.operator {
            Operator::Equals => loosely_equal(actual, expected),
            Operator::NotEquals => !loosely_equal(actual, expected),
            Operator::Contains => contains(actual, expected),
            Operator::NotContains => !contains(actual, expected),
            Operator::StartsWith => match (actual.as_str(), text(expected)) {
                (Some(a), Some(e)) => a.starts_with(e.as_str()),
                _ => false,
            },
            Operator::EndsWith => match (actual.as_str(), text(expected)) {
                (Some(a), Some(e)) => a.ends_with(e.as_str()),
                _ => false,
            },
            Operator::GreaterThan => order(actual, expected) == Some(Ordering::Greater),
            Operator::GreaterOrEqual => matches!(
                order(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::LessThan => order(actual, expected) == Some(Ordering::Less),
            Operator::LessOrEqual => {
                matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal))
            }
            Operator::Exists => !actual.is_null(),
            Operator::NotExists => actual.is_null(),
            Operator::IsEmpty => is_empty(actual),
            Operator::IsNotEmpty => !is_empty(actual),
        }
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}

/// Equality that lets `"42"` match `42` and `"true"` match `true`.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((number(a), number(b)), (Some(x), Some(y)) if x == y)
        }
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => {
            text(a) == text(b)
        }
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => text(needle).is_some_and(|n| s.contains(n.as_str())),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

/// Numbers compare numerically, strings lexically (which orders RFC 3339
/// timestamps correctly). Anything else is unordered.
fn order(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (number(a), number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::from_value(json!({
            "trigger": { "body": {
                "amount": 150,
                "currency": "EUR",
                "email": "ops@example.com",
                "tags": ["vip", "eu"],
                "note": "",
                "count": "7"
            } }
        }))
    }

    fn eval(condition: Value) -> bool {
        serde_json::from_value::<Condition>(condition)
            .unwrap()
            .evaluate(&ctx())
    }

    #[test]
    fn comparison_operators() {
        assert!(eval(json!({ "field": "trigger.body.amount", "operator": "greater-than", "value": 100 })));
        assert!(!eval(json!({ "field": "trigger.body.amount", "operator": "less-than", "value": 100 })));
        assert!(eval(json!({ "field": "trigger.body.amount", "operator": "greater-or-equal", "value": 150 })));
        assert!(eval(json!({ "field": "trigger.body.count", "operator": "equals", "value": 7 })));
        assert!(eval(json!({ "field": "trigger.body.currency", "operator": "not-equals", "value": "USD" })));
        assert!(eval(json!({ "field": "trigger.body.email", "operator": "ends-with", "value": "@example.com" })));
        assert!(eval(json!({ "field": "trigger.body.email", "operator": "starts-with", "value": "ops" })));
        assert!(eval(json!({ "field": "trigger.body.tags", "operator": "contains", "value": "vip" })));
        assert!(eval(json!({ "field": "trigger.body.email", "operator": "not-contains", "value": "gmail" })));
    }

    #[test]
    fn presence_operators() {
        assert!(eval(json!({ "field": "trigger.body.note", "operator": "is-empty" })));
        assert!(eval(json!({ "field": "trigger.body.missing", "operator": "not-exists" })));
        assert!(eval(json!({ "field": "trigger.body.tags", "operator": "is-not-empty" })));
        assert!(eval(json!({ "field": "trigger.body.amount", "operator": "exists" })));
    }

    #[test]
    fn missing_fields_never_order() {
        assert!(!eval(json!({ "field": "trigger.body.missing", "operator": "greater-than", "value": 1 })));
        assert!(!eval(json!({ "field": "trigger.body.missing", "operator": "less-than", "value": 1 })));
    }

    #[test]
    fn combinators() {
        assert!(eval(json!({ "all": [
            { "field": "trigger.body.amount", "operator": "greater-than", "value": 100 },
            { "any": [
                { "field": "trigger.body.currency", "operator": "equals", "value": "USD" },
                { "field": "trigger.body.currency", "operator": "equals", "value": "EUR" }
            ] }
        ] })));
        assert!(!eval(json!({ "not": { "always": true } })));
        assert!(eval(json!({ "all": [] })));
        assert!(!eval(json!({ "any": [] })));
    }
}
