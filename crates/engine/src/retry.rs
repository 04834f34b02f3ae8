//! Retry with capped exponential back-off and per-attempt timeouts.
//!
//! One logical action is attempted up to `max_retries + 1` times. Only
//! [`ActionError::Transient`] failures (including an attempt that ran past
//! its timeout) are retried; a permanent failure ends the action at once.

use std::time::Duration;

use nodes::{ActionContext, ActionError, ActionHandler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::millis;

/// Back-off schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    pub multiplier: u32,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Result of a retried action.
#[derive(Debug)]
pub struct Attempted {
    pub result: Result<Value, ActionError>,
    /// Retries performed; the first attempt is not a retry.
    pub retry_count: u32,
}

/// Run `handler` under `policy`. Each attempt is bounded by `timeout`; the
/// whole thing stops early when `cancel` fires.
pub async fn execute_with_retry(
    handler: &dyn ActionHandler,
    params: &Value,
    ctx: &ActionContext,
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Attempted {
    let mut retries = 0u32;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            outcome = tokio::time::timeout(timeout, handler.execute(params.clone(), ctx)) => {
                outcome.unwrap_or_else(|_| {
                    Err(ActionError::Transient(format!("timed out after {timeout:?}")))
                })
            }
        };

        let err = match attempt {
            Ok(output) => {
                return Attempted {
                    result: Ok(output),
                    retry_count: retries,
                }
            }
            Err(err) => err,
        };

        if !err.is_transient() || retries >= policy.max_retries || cancel.is_cancelled() {
            return Attempted {
                result: Err(err),
                retry_count: retries,
            };
        }

        retries += 1;
        let delay = policy.delay_for(retries);
        warn!(
            action_path = %ctx.action_path,
            retry = retries,
            max_retries = policy.max_retries,
            ?delay,
            error = %err,
            "transient action failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Attempted {
                    result: Err(cancelled()),
                    retry_count: retries,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn cancelled() -> ActionError {
    ActionError::Permanent("run cancelled".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodes::mock::MockHandler;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ActionContext {
        ActionContext {
            automation_id: "a".into(),
            run_id: Uuid::new_v4(),
            idempotency_key: "k".into(),
            action_path: "0".into(),
            credentials: None,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            multiplier: 2,
            max_delay: Duration::from_millis(50),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = fast_policy(10);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(50));
        assert_eq!(policy.delay_for(40), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_failures_report_every_retry() {
        let handler = MockHandler::failing_transient("flaky-api", "503 from upstream");
        let attempted = execute_with_retry(
            &handler,
            &json!({}),
            &ctx(),
            &fast_policy(3),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(attempted.result, Err(ActionError::Transient(_))));
        assert_eq!(attempted.retry_count, 3);
        assert_eq!(handler.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let handler = MockHandler::failing_permanent("bad-request", "400 from upstream");
        let attempted = execute_with_retry(
            &handler,
            &json!({}),
            &ctx(),
            &fast_policy(3),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(attempted.result, Err(ActionError::Permanent(_))));
        assert_eq!(attempted.retry_count, 0);
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_handler_recovers() {
        let handler = MockHandler::flaky("recovering", 2, json!({ "ok": true }));
        let attempted = execute_with_retry(
            &handler,
            &json!({}),
            &ctx(),
            &fast_policy(3),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(attempted.retry_count, 2);
        assert_eq!(attempted.result.unwrap()["ok"], json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_transient() {
        let handler = MockHandler::slow("sleepy", Duration::from_secs(5), json!(1));
        let attempted = execute_with_retry(
            &handler,
            &json!({}),
            &ctx(),
            &fast_policy(1),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(attempted.result, Err(ActionError::Transient(_))));
        assert_eq!(attempted.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let handler = MockHandler::slow("sleepy", Duration::from_secs(60), json!(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let attempted = execute_with_retry(
            &handler,
            &json!({}),
            &ctx(),
            &fast_policy(3),
            Duration::from_secs(120),
            &cancel,
        )
        .await;

        assert!(matches!(attempted.result, Err(ActionError::Permanent(_))));
        assert_eq!(attempted.retry_count, 0);
    }
}
