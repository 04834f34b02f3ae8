//! Delivery deduplication.
//!
//! Every admitted trigger event is reduced to a key before a run is created.
//! Reserving the key is a single conditional insert: the first delivery wins,
//! later deliveries within the TTL are pointed at the existing run. Expired
//! records are overwritten on the next reservation and purged by
//! [`spawn_sweeper`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use db::repository::idempotency::{self as repo, KeyReservation};
use db::DbPool;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{EventTarget, IdempotencyRecord, TriggerEvent};
use crate::schedule::truncate_to_minute;

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// SHA-256 hex of the material that identifies one logical delivery.
///
/// - provider delivery id when the verifier found one,
/// - the scheduled minute for cron,
/// - table and record id for database events,
/// - otherwise the canonical (sorted-key) JSON payload.
pub fn idempotency_key(automation_id: &str, event: &TriggerEvent) -> String {
    let material = match (&event.delivery_id, &event.target) {
        (Some(delivery_id), _) => format!("{automation_id}:delivery:{delivery_id}"),
        (None, EventTarget::Cron { scheduled_for, .. }) => format!(
            "cron:{automation_id}:{}",
            truncate_to_minute(*scheduled_for).timestamp()
        ),
        (None, EventTarget::Record { table, record_id }) => {
            format!("record:{automation_id}:{table}:{record_id}")
        }
        (None, EventTarget::Http { .. }) => {
            format!("{automation_id}:payload:{}", canonical_json(&event.payload))
        }
    };

    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Serialise with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        scalar => scalar.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The key is now bound to the candidate run.
    Reserved,
    /// A live record exists; no new run must be created.
    Duplicate(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically bind `record.key` to `record.run_id` unless a live record
    /// (one with `expires_at > now`) already holds it.
    async fn reserve(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError>;

    /// Undo a reservation whose run was never created. Only removes the
    /// record while it still points at `run_id`.
    async fn release(&self, key: &str, run_id: Uuid) -> Result<bool, LedgerError>;

    /// Remove expired records; returns how many went.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        // The shard lock held by `entry` makes check-and-insert atomic.
        match self.records.entry(record.key.clone()) {
            Entry::Occupied(existing) if existing.get().is_live(now) => {
                Ok(Reservation::Duplicate(existing.get().clone()))
            }
            Entry::Occupied(mut expired) => {
                expired.insert(record);
                Ok(Reservation::Reserved)
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(Reservation::Reserved)
            }
        }
    }

    async fn release(&self, key: &str, run_id: Uuid) -> Result<bool, LedgerError> {
        Ok(self
            .records
            .remove_if(key, |_, record| record.run_id == run_id)
            .is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgIdempotencyStore {
    pool: DbPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn reserve(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        let outcome = repo::reserve_key(
            &self.pool,
            &record.key,
            record.run_id,
            &record.automation_id,
            now,
            record.expires_at,
        )
        .await?;

        Ok(match outcome {
            KeyReservation::Reserved => Reservation::Reserved,
            KeyReservation::Existing(row) => Reservation::Duplicate(IdempotencyRecord {
                key: row.key,
                run_id: row.run_id,
                automation_id: row.automation_id,
                expires_at: row.expires_at,
            }),
        })
    }

    async fn release(&self, key: &str, run_id: Uuid) -> Result<bool, LedgerError> {
        Ok(repo::release_key(&self.pool, key, run_id).await?)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        Ok(repo::purge_expired(&self.pool, now).await?)
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// Periodically purge expired keys until `shutdown` fires.
pub fn spawn_sweeper(
    store: Arc<dyn IdempotencyStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match store.purge_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "purged expired idempotency keys"),
                        Err(e) => warn!(error = %e, "idempotency sweep failed"),
                    }
                }
            }
        }
    })
}
