//! Automation definition storage.

use chrono::Utc;
use sqlx::PgPool;

use crate::{models::AutomationRow, DbError};

/// Insert or replace an automation definition.
///
/// `definition` must be a JSON object produced by serialising the domain
/// `Automation` type from the `engine` crate.
pub async fn upsert_automation(
    pool: &PgPool,
    id: &str,
    name: &str,
    definition: serde_json::Value,
) -> Result<AutomationRow, DbError> {
    let now = Utc::now();

    let row = sqlx::query_as::<_, AutomationRow>(
        r#"
        INSERT INTO automations (id, name, definition, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $4)
        ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                definition = EXCLUDED.definition,
                updated_at = EXCLUDED.updated_at
        RETURNING id, name, definition, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(definition)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Return all automations ordered by id.
pub async fn list_automations(pool: &PgPool) -> Result<Vec<AutomationRow>, DbError> {
    let rows = sqlx::query_as::<_, AutomationRow>(
        r#"SELECT id, name, definition, created_at, updated_at FROM automations ORDER BY id"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Permanently delete an automation.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_automation(pool: &PgPool, id: &str) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM automations WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
