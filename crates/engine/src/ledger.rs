//! Run ledger: append-only record of execution runs and their steps.
//!
//! Steps are never updated once appended. The ledger assigns each step the
//! next per-run sequence number, so replaying a run's steps in sequence order
//! reproduces the order in which actions finished.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use db::models::{ActionStepRow, ExecutionRunRow, NewActionStep, NewExecutionRun};
use db::repository::executions as repo;
use db::{DbError, DbPool};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{ActionStepResult, ExecutionRun, RunStatus, TriggerEvent};

#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn create_run(&self, run: &ExecutionRun) -> Result<(), LedgerError>;

    /// Forward-only status change; terminal statuses stamp `completed_at`.
    async fn update_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), LedgerError>;

    /// Append a step and return the sequence number it was given.
    async fn append_step(&self, run_id: Uuid, step: ActionStepResult) -> Result<u64, LedgerError>;

    /// A run with all of its steps in sequence order.
    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRun, LedgerError>;

    /// Most recent runs of an automation first, without their steps.
    async fn list_runs(&self, automation_id: &str, limit: usize)
        -> Result<Vec<ExecutionRun>, LedgerError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryRunLedger {
    runs: DashMap<Uuid, ExecutionRun>,
}

impl InMemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

#[async_trait]
impl RunLedger for InMemoryRunLedger {
    async fn create_run(&self, run: &ExecutionRun) -> Result<(), LedgerError> {
        self.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn update_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), LedgerError> {
        let mut run = self
            .runs
            .get_mut(&run_id)
            .ok_or(LedgerError::RunNotFound(run_id))?;

        if !run.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                run_id,
                from: run.status,
                to: status,
            });
        }
        run.status = status;
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn append_step(
        &self,
        run_id: Uuid,
        mut step: ActionStepResult,
    ) -> Result<u64, LedgerError> {
        let mut run = self
            .runs
            .get_mut(&run_id)
            .ok_or(LedgerError::RunNotFound(run_id))?;
        let sequence = run.steps.len() as u64;
        step.sequence = sequence;
        run.steps.push(step);
        Ok(sequence)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRun, LedgerError> {
        self.runs
            .get(&run_id)
            .map(|run| run.clone())
            .ok_or(LedgerError::RunNotFound(run_id))
    }

    async fn list_runs(
        &self,
        automation_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRun>, LedgerError> {
        let mut runs: Vec<ExecutionRun> = self
            .runs
            .iter()
            .filter(|run| run.automation_id == automation_id)
            .map(|run| ExecutionRun {
                steps: Vec::new(),
                ..run.clone()
            })
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgRunLedger {
    pool: DbPool,
}

impl PgRunLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLedger for PgRunLedger {
    async fn create_run(&self, run: &ExecutionRun) -> Result<(), LedgerError> {
        let trigger_event = serde_json::to_value(&run.trigger_event)
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
        repo::create_execution(
            &self.pool,
            NewExecutionRun {
                id: run.run_id,
                automation_id: &run.automation_id,
                idempotency_key: &run.idempotency_key,
                trigger_event,
                status: run.status.as_str(),
                started_at: run.started_at,
            },
        )
        .await?;
        Ok(())
    }

    async fn update_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), LedgerError> {
        let allowed: Vec<&str> = status.predecessors().iter().map(|s| s.as_str()).collect();
        let completed_at = status.is_terminal().then(Utc::now);

        match repo::update_execution_status(&self.pool, run_id, status.as_str(), &allowed, completed_at)
            .await
        {
            Ok(()) => Ok(()),
            Err(DbError::Conflict(_)) => {
                let current = self.get_run(run_id).await?;
                Err(LedgerError::InvalidTransition {
                    run_id,
                    from: current.status,
                    to: status,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append_step(&self, run_id: Uuid, step: ActionStepResult) -> Result<u64, LedgerError> {
        let sequence = repo::append_step(
            &self.pool,
            run_id,
            NewActionStep {
                action_path: step.action_path.as_str(),
                action_type: &step.action_type,
                status: step.status.as_str(),
                input: step.input,
                output: step.output,
                error: step.error.as_deref(),
                retry_count: step.retry_count as i32,
                started_at: step.started_at,
                finished_at: step.finished_at,
            },
        )
        .await
        .map_err(|e| match e {
            DbError::NotFound => LedgerError::RunNotFound(run_id),
            other => other.into(),
        })?;
        Ok(sequence as u64)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRun, LedgerError> {
        let row = repo::get_execution(&self.pool, run_id)
            .await
            .map_err(|e| match e {
                DbError::NotFound => LedgerError::RunNotFound(run_id),
                other => other.into(),
            })?;
        let steps = repo::list_steps(&self.pool, run_id)
            .await?
            .into_iter()
            .map(step_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let mut run = run_from_row(row)?;
        run.steps = steps;
        Ok(run)
    }

    async fn list_runs(
        &self,
        automation_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRun>, LedgerError> {
        repo::list_executions_for_automation(&self.pool, automation_id, limit as i64)
            .await?
            .into_iter()
            .map(run_from_row)
            .collect()
    }
}

fn run_from_row(row: ExecutionRunRow) -> Result<ExecutionRun, LedgerError> {
    let trigger_event: TriggerEvent = serde_json::from_value(row.trigger_event)
        .map_err(|e| LedgerError::Corrupt(format!("trigger event of run {}: {e}", row.id)))?;
    Ok(ExecutionRun {
        run_id: row.id,
        automation_id: row.automation_id,
        trigger_event,
        idempotency_key: row.idempotency_key,
        status: row.status.parse().map_err(LedgerError::Corrupt)?,
        started_at: row.started_at,
        completed_at: row.completed_at,
        steps: Vec::new(),
    })
}

fn step_from_row(row: ActionStepRow) -> Result<ActionStepResult, LedgerError> {
    Ok(ActionStepResult {
        sequence: row.sequence as u64,
        action_path: row.action_path.as_str().into(),
        action_type: row.action_type,
        status: row.status.parse().map_err(LedgerError::Corrupt)?,
        input: row.input,
        output: row.output,
        error: row.error,
        retry_count: row.retry_count.max(0) as u32,
        started_at: row.started_at,
        finished_at: row.finished_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionPath, StepStatus, Transport};
    use serde_json::json;

    fn run(automation_id: &str) -> ExecutionRun {
        let event = TriggerEvent::http("POST", "/x", json!({}), Transport::default());
        ExecutionRun::pending(automation_id, &event, "key".into())
    }

    fn step(path: &str) -> ActionStepResult {
        let now = Utc::now();
        ActionStepResult {
            sequence: 0,
            action_path: ActionPath::from(path),
            action_type: "http-request".into(),
            status: StepStatus::Succeeded,
            input: json!({}),
            output: Some(json!({})),
            error: None,
            retry_count: 0,
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn append_assigns_increasing_sequences() {
        let ledger = InMemoryRunLedger::new();
        let run = run("a");
        ledger.create_run(&run).await.unwrap();

        assert_eq!(ledger.append_step(run.run_id, step("0")).await.unwrap(), 0);
        assert_eq!(ledger.append_step(run.run_id, step("1")).await.unwrap(), 1);

        let stored = ledger.get_run(run.run_id).await.unwrap();
        let paths: Vec<_> = stored.steps.iter().map(|s| s.action_path.as_str()).collect();
        assert_eq!(paths, vec!["0", "1"]);
        assert_eq!(stored.steps[1].sequence, 1);
    }

    #[tokio::test]
    async fn status_cannot_move_backwards() {
        let ledger = InMemoryRunLedger::new();
        let run = run("a");
        ledger.create_run(&run).await.unwrap();

        ledger.update_status(run.run_id, RunStatus::Running).await.unwrap();
        ledger.update_status(run.run_id, RunStatus::Succeeded).await.unwrap();
        let err = ledger
            .update_status(run.run_id, RunStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let stored = ledger.get_run(run.run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_run_is_reported() {
        let ledger = InMemoryRunLedger::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            ledger.append_step(missing, step("0")).await,
            Err(LedgerError::RunNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn list_runs_filters_by_automation() {
        let ledger = InMemoryRunLedger::new();
        for id in ["a", "a", "b"] {
            ledger.create_run(&run(id)).await.unwrap();
        }
        assert_eq!(ledger.list_runs("a", 10).await.unwrap().len(), 2);
        assert_eq!(ledger.list_runs("a", 1).await.unwrap().len(), 1);
        assert!(ledger.list_runs("c", 10).await.unwrap().is_empty());
    }
}
