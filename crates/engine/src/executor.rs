//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the central orchestrator for one run:
//! 1. Moves the run from `pending` to `running`.
//! 2. Walks the action tree depth-first. Actions on one path run strictly in
//!    order; `split-into-paths` fans out through the branch evaluator.
//! 3. Dispatches each action with substituted parameters, under retry and
//!    a per-attempt timeout.
//! 4. Appends exactly one `ActionStepResult` per logical action.
//! 5. Moves the run to its terminal status.
//!
//! A non-tolerant failure halts the path it happened on. A tolerant failure
//! is recorded and the path carries on. Cancelling the run's token (admin
//! cancel or the run ceiling) stops every path before its next action.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use nodes::{ActionContext, ActionError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::branch;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::dispatcher::{raw_params, ActionDispatcher};
use crate::error::EngineError;
use crate::ledger::RunLedger;
use crate::models::{
    ActionKind, ActionNode, ActionPath, ActionStepResult, Automation, ExecutionRun, RunStatus,
    StepStatus,
};
use crate::retry::{execute_with_retry, RetryPolicy};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub action_timeout: Duration,
    pub run_timeout: Duration,
    pub max_fan_out: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            action_timeout: config.action_timeout,
            run_timeout: config.run_timeout,
            max_fan_out: config.max_fan_out.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Output of a completed execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// Identity of the run every action of it shares.
pub(crate) struct RunScope {
    pub run_id: Uuid,
    pub automation_id: String,
    pub idempotency_key: String,
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor {
    dispatcher: Arc<ActionDispatcher>,
    ledger: Arc<dyn RunLedger>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        dispatcher: Arc<ActionDispatcher>,
        ledger: Arc<dyn RunLedger>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            dispatcher,
            ledger,
            config,
        }
    }

    pub(crate) fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub(crate) fn ledger(&self) -> &dyn RunLedger {
        self.ledger.as_ref()
    }

    /// Execute a pending run to completion.
    ///
    /// # Errors
    /// Returns `EngineError` when the ledger fails; the run is then marked
    /// `failed` on a best-effort basis.
    #[instrument(skip_all, fields(automation_id = %automation.id, run_id = %run.run_id))]
    pub async fn run(
        &self,
        automation: &Automation,
        run: &ExecutionRun,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        self.ledger
            .update_status(run.run_id, RunStatus::Running)
            .await?;
        info!(actions = automation.actions.len(), "run started");

        // Run-level ceiling.
        let watchdog = {
            let cancel = cancel.clone();
            let ceiling = self.config.run_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(ceiling) => {
                        warn!(?ceiling, "run exceeded its time ceiling, cancelling");
                        cancel.cancel();
                    }
                }
            })
        };

        let scope = RunScope {
            run_id: run.run_id,
            automation_id: automation.id.clone(),
            idempotency_key: run.idempotency_key.clone(),
            cancel: cancel.clone(),
        };
        let ctx = ExecutionContext::new(run, &run.trigger_event);
        let outcome = self
            .run_path(&automation.actions, ActionPath::root(), ctx, &scope)
            .await;
        watchdog.abort();

        let status = match outcome {
            Ok(_) if cancel.is_cancelled() => RunStatus::Failed,
            Ok(status) => RunStatus::from(status),
            Err(e) => {
                error!(error = %e, "run aborted by engine failure");
                if let Err(mark) = self.ledger.update_status(run.run_id, RunStatus::Failed).await {
                    error!(error = %mark, "could not mark aborted run as failed");
                }
                return Err(e);
            }
        };

        self.ledger.update_status(run.run_id, status).await?;
        match status {
            RunStatus::Succeeded => info!("run succeeded"),
            other => warn!(status = %other, cancelled = cancel.is_cancelled(), "run finished"),
        }

        Ok(ExecutionResult {
            run_id: run.run_id,
            status,
        })
    }

    /// Run `actions` in order under `prefix`; returns the path's outcome.
    pub(crate) fn run_path<'a>(
        &'a self,
        actions: &'a [ActionNode],
        prefix: ActionPath,
        mut ctx: ExecutionContext,
        scope: &'a RunScope,
    ) -> BoxFuture<'a, Result<StepStatus, EngineError>> {
        async move {
            for (index, node) in actions.iter().enumerate() {
                if scope.cancel.is_cancelled() {
                    return Ok(StepStatus::Failed);
                }
                let path = prefix.index(index);

                let status = match &node.kind {
                    ActionKind::SplitIntoPaths { paths } => {
                        branch::run_split(self, paths, &path, &ctx, scope).await?
                    }
                    _ => {
                        let step = self.execute_action(node, &path, &ctx, scope).await;
                        let status = step.status;
                        if let (StepStatus::Succeeded, Some(name)) = (status, &node.name) {
                            ctx.set_step_output(name, step.output.clone().unwrap_or(Value::Null));
                        }
                        self.ledger.append_step(scope.run_id, step).await?;
                        status
                    }
                };

                if status != StepStatus::Succeeded && !node.tolerant {
                    return Ok(status);
                }
            }
            Ok(StepStatus::Succeeded)
        }
        .boxed()
    }

    /// Attempt one action and build its step; never fails itself.
    #[instrument(skip_all, fields(action_path = %path))]
    async fn execute_action(
        &self,
        node: &ActionNode,
        path: &ActionPath,
        ctx: &ExecutionContext,
        scope: &RunScope,
    ) -> ActionStepResult {
        let started_at = Utc::now();
        let action_type = node.kind.type_name();

        let prepared = match self.dispatcher.prepare(&node.kind, ctx) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(action_type = %action_type, error = %e, "action could not be prepared");
                return step_result(path, action_type, raw_params(&node.kind), Err(e), 0, started_at);
            }
        };

        let action_ctx = ActionContext {
            automation_id: scope.automation_id.clone(),
            run_id: scope.run_id,
            idempotency_key: scope.idempotency_key.clone(),
            action_path: path.to_string(),
            credentials: None,
        };
        let timeout = node
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.action_timeout);

        let attempted = execute_with_retry(
            prepared.handler.as_ref(),
            &prepared.params,
            &action_ctx,
            &self.config.retry,
            timeout,
            &scope.cancel,
        )
        .await;

        match &attempted.result {
            Ok(_) => info!(action_type = %action_type, retries = attempted.retry_count, "action succeeded"),
            Err(e) => warn!(
                action_type = %action_type,
                retries = attempted.retry_count,
                tolerant = node.tolerant,
                error = %e,
                "action failed"
            ),
        }

        step_result(
            path,
            action_type,
            prepared.params,
            attempted.result,
            attempted.retry_count,
            started_at,
        )
    }
}

fn step_result(
    path: &ActionPath,
    action_type: String,
    input: Value,
    result: Result<Value, ActionError>,
    retry_count: u32,
    started_at: chrono::DateTime<Utc>,
) -> ActionStepResult {
    let (status, output, error) = match result {
        Ok(output) => (StepStatus::Succeeded, Some(output), None),
        Err(e) => (StepStatus::Failed, None, Some(e.to_string())),
    };
    ActionStepResult {
        sequence: 0,
        action_path: path.clone(),
        action_type,
        status,
        input,
        output,
        error,
        retry_count,
        started_at,
        finished_at: Utc::now(),
    }
}
