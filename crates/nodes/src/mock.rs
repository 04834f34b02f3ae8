//! `MockHandler` — a test double for `ActionHandler`.
//!
//! Useful in unit and integration tests where a real handler is either
//! unavailable or irrelevant.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ActionContext, ActionError, ActionHandler};

/// Behaviour injected into `MockHandler` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Transient` error on every call.
    FailTransient(String),
    /// Fail with a `Permanent` error on every call.
    FailPermanent(String),
    /// Fail transiently for the first `n` calls, then return the value.
    Flaky(u32, Value),
    /// Sleep before returning the value.
    Slow(Duration, Value),
}

/// A mock handler that records every call it receives and returns a
/// programmer-specified result.
pub struct MockHandler {
    /// Label used in test assertions.
    pub name: String,
    pub behaviour: MockBehaviour,
    /// All `(action_path, params)` pairs seen by this handler, in call order.
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockHandler {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Permanent` error.
    pub fn failing_permanent(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailPermanent(msg.into()))
    }

    /// Create a mock that always fails with a `Transient` error.
    pub fn failing_transient(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailTransient(msg.into()))
    }

    pub fn flaky(name: impl Into<String>, failures: u32, value: Value) -> Self {
        Self::with(name, MockBehaviour::Flaky(failures, value))
    }

    pub fn slow(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::with(name, MockBehaviour::Slow(delay, value))
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Parameters of every call, in order.
    pub fn params(&self) -> Vec<Value> {
        self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Action paths of every call, in order.
    pub fn paths(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    fn output(&self, value: &Value) -> Value {
        // Tag the output with the handler name so tests can trace data flow.
        let mut out = json!({ "handler": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl ActionHandler for MockHandler {
    async fn execute(&self, params: Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((ctx.action_path.clone(), params));
            calls.len() as u32
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(v)),
            MockBehaviour::FailTransient(msg) => Err(ActionError::Transient(msg.clone())),
            MockBehaviour::FailPermanent(msg) => Err(ActionError::Permanent(msg.clone())),
            MockBehaviour::Flaky(failures, v) => {
                if call_number <= *failures {
                    Err(ActionError::Transient(format!("flaky call {call_number}")))
                } else {
                    Ok(self.output(v))
                }
            }
            MockBehaviour::Slow(delay, v) => {
                tokio::time::sleep(*delay).await;
                Ok(self.output(v))
            }
        }
    }
}
