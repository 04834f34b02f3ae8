//! Branch evaluator for `split-into-paths`.
//!
//! Every path's condition is evaluated against the same parent context, so
//! paths are not mutually exclusive. Matched paths run concurrently, at most
//! `max_fan_out` at a time, each on its own clone of the context. A failing
//! path never cancels its siblings. The split's own step is appended once
//! every matched path is terminal, carrying the aggregate status.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::executor::{RunScope, WorkflowExecutor};
use crate::models::{ActionPath, ActionStepResult, BranchPath, StepStatus};

/// Aggregate of matched path outcomes: none matched or all succeeded gives
/// `succeeded`, all failed gives `failed`, anything else is partial.
pub fn aggregate(outcomes: &[StepStatus]) -> StepStatus {
    let failed = outcomes
        .iter()
        .filter(|status| **status != StepStatus::Succeeded)
        .count();
    match failed {
        0 => StepStatus::Succeeded,
        n if n == outcomes.len() => StepStatus::Failed,
        _ => StepStatus::PartiallyFailed,
    }
}

pub(crate) async fn run_split(
    executor: &WorkflowExecutor,
    paths: &[BranchPath],
    split_path: &ActionPath,
    ctx: &ExecutionContext,
    scope: &RunScope,
) -> Result<StepStatus, EngineError> {
    let started_at = Utc::now();

    let matched: Vec<&BranchPath> = paths
        .iter()
        .filter(|path| path.condition.evaluate(ctx))
        .collect();
    info!(
        split = %split_path,
        evaluated = paths.len(),
        matched = matched.len(),
        "split evaluated"
    );

    // One boxed future per matched path, built up front.
    let branches: Vec<BoxFuture<'_, (usize, Result<StepStatus, EngineError>)>> = matched
        .iter()
        .enumerate()
        .map(|(position, &path)| {
            let prefix = split_path.branch(&path.name);
            let branch_ctx = ctx.clone();
            let actions = path.actions.as_slice();
            async move {
                debug!(path = %prefix, "path started");
                let outcome = executor.run_path(actions, prefix, branch_ctx, scope).await;
                (position, outcome)
            }
            .boxed()
        })
        .collect();

    let results: Vec<(usize, Result<StepStatus, EngineError>)> = stream::iter(branches)
        .buffer_unordered(executor.config().max_fan_out)
        .collect()
        .await;

    // Report in definition order regardless of completion order.
    let mut outcomes = vec![StepStatus::Failed; matched.len()];
    for (position, outcome) in results {
        outcomes[position] = outcome?;
    }
    let status = aggregate(&outcomes);

    let per_path: Map<String, Value> = matched
        .iter()
        .zip(&outcomes)
        .map(|(path, status)| (path.name.clone(), json!(status)))
        .collect();
    let failed = outcomes.iter().filter(|s| **s != StepStatus::Succeeded).count();

    let step = ActionStepResult {
        sequence: 0,
        action_path: split_path.clone(),
        action_type: "split-into-paths".to_string(),
        status,
        input: json!({
            "paths": paths.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        }),
        output: Some(json!({
            "matched": matched.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "outcomes": per_path,
        })),
        error: (failed > 0).then(|| format!("{failed} of {} matched paths failed", matched.len())),
        retry_count: 0,
        started_at,
        finished_at: Utc::now(),
    };
    executor.ledger().append_step(scope.run_id, step).await?;

    Ok(status)
}
