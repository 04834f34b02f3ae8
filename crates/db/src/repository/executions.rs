//! Run ledger persistence: execution runs and their step results.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    models::{ActionStepRow, ExecutionRunRow, NewActionStep, NewExecutionRun},
    DbError,
};

// ---------------------------------------------------------------------------
// execution_runs
// ---------------------------------------------------------------------------

pub async fn create_execution(
    pool: &PgPool,
    run: NewExecutionRun<'_>,
) -> Result<ExecutionRunRow, DbError> {
    let row = sqlx::query_as::<_, ExecutionRunRow>(
        r#"
        INSERT INTO execution_runs
            (id, automation_id, idempotency_key, trigger_event, status, step_count, started_at)
        VALUES ($1, $2, $3, $4, $5, 0, $6)
        RETURNING id, automation_id, idempotency_key, trigger_event, status,
                  step_count, started_at, completed_at
        "#,
    )
    .bind(run.id)
    .bind(run.automation_id)
    .bind(run.idempotency_key)
    .bind(run.trigger_event)
    .bind(run.status)
    .bind(run.started_at)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Move a run to `status`, only if its current status is one of
/// `allowed_from`. Terminal transitions also stamp `completed_at`.
///
/// Returns `DbError::Conflict` when the guard rejects the change.
pub async fn update_execution_status(
    pool: &PgPool,
    execution_id: Uuid,
    status: &str,
    allowed_from: &[&str],
    completed_at: Option<DateTime<Utc>>,
) -> Result<(), DbError> {
    let allowed: Vec<String> = allowed_from.iter().map(|s| s.to_string()).collect();

    let result = sqlx::query(
        r#"
        UPDATE execution_runs
        SET status = $1, completed_at = COALESCE($2, completed_at)
        WHERE id = $3 AND status = ANY($4)
        "#,
    )
    .bind(status)
    .bind(completed_at)
    .bind(execution_id)
    .bind(&allowed)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::Conflict(format!(
            "run {execution_id} cannot move to '{status}'"
        )));
    }

    Ok(())
}

pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<ExecutionRunRow, DbError> {
    sqlx::query_as::<_, ExecutionRunRow>(
        r#"
        SELECT id, automation_id, idempotency_key, trigger_event, status,
               step_count, started_at, completed_at
        FROM execution_runs WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Newest first.
pub async fn list_executions_for_automation(
    pool: &PgPool,
    automation_id: &str,
    limit: i64,
) -> Result<Vec<ExecutionRunRow>, DbError> {
    let rows = sqlx::query_as::<_, ExecutionRunRow>(
        r#"
        SELECT id, automation_id, idempotency_key, trigger_event, status,
               step_count, started_at, completed_at
        FROM execution_runs
        WHERE automation_id = $1
        ORDER BY started_at DESC
        LIMIT $2
        "#,
    )
    .bind(automation_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// action_step_results
// ---------------------------------------------------------------------------

/// Append a step and assign it the run's next sequence number.
///
/// The counter bump takes a row lock on the run, so concurrent appends from
/// sibling branch paths are serialised and never share a sequence.
pub async fn append_step(
    pool: &PgPool,
    execution_id: Uuid,
    step: NewActionStep<'_>,
) -> Result<i64, DbError> {
    let mut tx = pool.begin().await?;

    let sequence: i64 = sqlx::query_scalar(
        r#"
        UPDATE execution_runs SET step_count = step_count + 1
        WHERE id = $1
        RETURNING step_count - 1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(DbError::NotFound)?;

    sqlx::query(
        r#"
        INSERT INTO action_step_results
            (run_id, sequence, action_path, action_type, status, input, output,
             error, retry_count, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(execution_id)
    .bind(sequence)
    .bind(step.action_path)
    .bind(step.action_type)
    .bind(step.status)
    .bind(step.input)
    .bind(step.output)
    .bind(step.error)
    .bind(step.retry_count)
    .bind(step.started_at)
    .bind(step.finished_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(sequence)
}

/// All steps of a run in append order.
pub async fn list_steps(pool: &PgPool, execution_id: Uuid) -> Result<Vec<ActionStepRow>, DbError> {
    let rows = sqlx::query_as::<_, ActionStepRow>(
        r#"
        SELECT run_id, sequence, action_path, action_type, status, input, output,
               error, retry_count, started_at, finished_at
        FROM action_step_results
        WHERE run_id = $1
        ORDER BY sequence ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
