//! Generic table records.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::RecordRow, DbError};

pub async fn insert_record(
    pool: &PgPool,
    table_name: &str,
    fields: serde_json::Value,
) -> Result<RecordRow, DbError> {
    let row = sqlx::query_as::<_, RecordRow>(
        r#"
        INSERT INTO records (id, table_name, fields, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $4)
        RETURNING id, table_name, fields, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(table_name)
    .bind(fields)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Shallow-merge `fields` into the stored JSON object (`jsonb ||`).
pub async fn update_record(
    pool: &PgPool,
    table_name: &str,
    id: Uuid,
    fields: serde_json::Value,
) -> Result<RecordRow, DbError> {
    sqlx::query_as::<_, RecordRow>(
        r#"
        UPDATE records
        SET fields = fields || $3, updated_at = $4
        WHERE table_name = $1 AND id = $2
        RETURNING id, table_name, fields, created_at, updated_at
        "#,
    )
    .bind(table_name)
    .bind(id)
    .bind(fields)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

pub async fn delete_record(pool: &PgPool, table_name: &str, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM records WHERE table_name = $1 AND id = $2")
        .bind(table_name)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

pub async fn get_record(pool: &PgPool, id: Uuid) -> Result<RecordRow, DbError> {
    sqlx::query_as::<_, RecordRow>(
        r#"SELECT id, table_name, fields, created_at, updated_at FROM records WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}
