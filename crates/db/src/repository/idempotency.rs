//! Idempotency key reservation.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::IdempotencyRow, DbError};

/// Outcome of [`reserve_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReservation {
    /// The key was free (or expired) and now points at the new run.
    Reserved,
    /// A live record already exists.
    Existing(IdempotencyRow),
}

/// Atomically claim `key` for `run_id`.
///
/// A single conditional upsert: the insert wins on a fresh key, the update
/// branch only fires when the stored record has expired. When neither
/// happens the live record is returned unchanged.
pub async fn reserve_key(
    pool: &PgPool,
    key: &str,
    run_id: Uuid,
    automation_id: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<KeyReservation, DbError> {
    let claimed = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO idempotency_keys (key, run_id, automation_id, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (key) DO UPDATE
            SET run_id = EXCLUDED.run_id,
                automation_id = EXCLUDED.automation_id,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_keys.expires_at <= $5
        RETURNING run_id
        "#,
    )
    .bind(key)
    .bind(run_id)
    .bind(automation_id)
    .bind(expires_at)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    if claimed.is_some() {
        return Ok(KeyReservation::Reserved);
    }

    let existing = sqlx::query_as::<_, IdempotencyRow>(
        r#"SELECT key, run_id, automation_id, expires_at FROM idempotency_keys WHERE key = $1"#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(KeyReservation::Existing(existing))
}

/// Drop `key` if it still points at `run_id`; returns whether it did.
pub async fn release_key(pool: &PgPool, key: &str, run_id: Uuid) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND run_id = $2")
        .bind(key)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete expired records; returns how many were removed.
pub async fn purge_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_compare_by_stored_row() {
        let row = IdempotencyRow {
            key: "lead:d-1".into(),
            run_id: Uuid::new_v4(),
            automation_id: "lead".into(),
            expires_at: Utc::now(),
        };
        let existing = KeyReservation::Existing(row.clone());

        assert_eq!(existing, KeyReservation::Existing(row.clone()));
        assert_ne!(existing, KeyReservation::Reserved);
        let other = IdempotencyRow {
            run_id: Uuid::new_v4(),
            ..row
        };
        assert_ne!(existing, KeyReservation::Existing(other));
    }
}
