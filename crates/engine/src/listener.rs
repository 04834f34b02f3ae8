//! Trigger listeners: adapters that turn cron ticks and record inserts into
//! [`TriggerEvent`]s on the engine's single inbound channel.
//!
//! Listeners never execute actions. The HTTP adapter lives in the `api`
//! crate and publishes through [`crate::Engine::submit`], which uses the same
//! channel with a reply slot attached.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use nodes::RecordStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::models::TriggerEvent;
use crate::registry::{RegistryHandle, TriggerRegistry};
use crate::schedule::truncate_to_minute;
use crate::service::Admission;

/// One item on the inbound channel. HTTP callers attach a reply slot to
/// learn the run they started; listeners fire and forget.
pub struct Inbound {
    pub event: TriggerEvent,
    pub reply: Option<oneshot::Sender<Result<Vec<Admission>, EngineError>>>,
}

impl Inbound {
    pub fn fire_and_forget(event: TriggerEvent) -> Self {
        Self { event, reply: None }
    }
}

pub type InboundSender = mpsc::Sender<Inbound>;

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

/// Decides which cron automations are due in a given minute. Remembers the
/// last minute each automation fired so a minute never fires twice, even if
/// the loop wakes more than once within it. Missed minutes are not replayed.
#[derive(Default)]
pub struct CronTicker {
    fired: HashMap<String, DateTime<Utc>>,
}

impl CronTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn due(&mut self, registry: &TriggerRegistry, at: DateTime<Utc>) -> Vec<TriggerEvent> {
        let minute = truncate_to_minute(at);
        let mut events = Vec::new();

        for entry in registry.cron_entries() {
            if self.fired.get(&entry.automation_id) == Some(&minute) {
                continue;
            }
            if entry.schedule.matches(minute) {
                self.fired.insert(entry.automation_id.clone(), minute);
                events.push(TriggerEvent::cron(entry.automation_id.clone(), minute));
            }
        }

        // Forget automations that were removed by a reload.
        self.fired
            .retain(|id, _| registry.cron_entries().iter().any(|e| &e.automation_id == id));
        events
    }
}

/// Time until the next multiple of `resolution` since the epoch.
pub fn until_next_tick(now: DateTime<Utc>, resolution: Duration) -> Duration {
    let step = resolution.as_millis().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let next = (now_ms.div_euclid(step) + 1) * step;
    Duration::from_millis((next - now_ms) as u64)
}

pub fn spawn_cron_listener(
    registry: RegistryHandle,
    inbound: InboundSender,
    resolution: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?resolution, "cron listener started");
        let mut ticker = CronTicker::new();

        loop {
            let wait = until_next_tick(Utc::now(), resolution);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let events = ticker.due(&registry.load(), Utc::now());
            for event in events {
                debug!(target_event = ?event.target, "cron trigger due");
                if inbound.send(Inbound::fire_and_forget(event)).await.is_err() {
                    info!("inbound channel closed, cron listener stopping");
                    return;
                }
            }
        }
        info!("cron listener stopped");
    })
}

// ---------------------------------------------------------------------------
// Database changes
// ---------------------------------------------------------------------------

/// Subscribe to `on_record_created` for every table the registry tracks,
/// re-syncing subscriptions whenever the registry is swapped.
pub fn spawn_record_listener(
    registry: RegistryHandle,
    store: Arc<dyn RecordStore>,
    inbound: InboundSender,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = registry.subscribe();
        let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            let wanted = registry.load().tables();
            sync_subscriptions(&mut subscriptions, &wanted, &store, &inbound, &shutdown).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        for (_, task) in subscriptions.drain() {
            task.abort();
        }
        info!("record listener stopped");
    })
}

async fn sync_subscriptions(
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    wanted: &HashSet<String>,
    store: &Arc<dyn RecordStore>,
    inbound: &InboundSender,
    shutdown: &CancellationToken,
) {
    subscriptions.retain(|table, task| {
        let keep = wanted.contains(table) && !task.is_finished();
        if !keep {
            debug!(table = %table, "dropping record subscription");
            task.abort();
        }
        keep
    });

    for table in wanted {
        if subscriptions.contains_key(table) {
            continue;
        }
        match store.on_record_created(table).await {
            Ok(mut stream) => {
                info!(table = %table, "subscribed to record inserts");
                let inbound = inbound.clone();
                let shutdown = shutdown.clone();
                let task = tokio::spawn(async move {
                    loop {
                        let record = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            next = stream.next() => match next {
                                Some(record) => record,
                                None => break,
                            },
                        };
                        let event = TriggerEvent::record(&record);
                        if inbound.send(Inbound::fire_and_forget(event)).await.is_err() {
                            break;
                        }
                    }
                });
                subscriptions.insert(table.clone(), task);
            }
            Err(e) => warn!(table = %table, error = %e, "record subscription failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Automation, EventTarget, Trigger};
    use crate::verify::VerifierSet;
    use chrono::TimeZone;
    use nodes::memory::InMemoryRecordStore;
    use serde_json::json;

    fn cron(id: &str, expression: &str) -> Automation {
        Automation::new(
            id,
            Trigger::Cron {
                expression: expression.into(),
                timezone: "UTC".into(),
            },
            vec![],
        )
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn ticker_fires_matching_minutes_once() {
        let registry =
            TriggerRegistry::build(vec![cron("five", "*/5 * * * *")], &VerifierSet::default())
                .unwrap();
        let mut ticker = CronTicker::new();

        assert_eq!(ticker.due(&registry, at(0, 0, 0)).len(), 1);
        assert!(ticker.due(&registry, at(0, 0, 30)).is_empty());
        assert!(ticker.due(&registry, at(0, 2, 0)).is_empty());
        assert_eq!(ticker.due(&registry, at(0, 5, 1)).len(), 1);
        assert!(ticker.due(&registry, at(0, 7, 0)).is_empty());

        let events = ticker.due(&registry, at(0, 10, 0));
        assert!(matches!(
            &events[0].target,
            EventTarget::Cron { automation_id, scheduled_for }
                if automation_id == "five" && *scheduled_for == at(0, 10, 0)
        ));
    }

    #[test]
    fn next_tick_aligns_to_resolution() {
        let minute = Duration::from_secs(60);
        assert_eq!(until_next_tick(at(0, 0, 15), minute), Duration::from_secs(45));
        assert_eq!(until_next_tick(at(0, 1, 0), minute), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn record_inserts_become_events() {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = RegistryHandle::new(
            TriggerRegistry::build(
                vec![Automation::new(
                    "on-order",
                    Trigger::DatabaseRecordCreated { table: "orders".into() },
                    vec![],
                )],
                &VerifierSet::default(),
            )
            .unwrap(),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let listener = spawn_record_listener(registry, store.clone(), tx, shutdown.clone());

        // Retry until the subscription is live.
        let mut received = None;
        for _ in 0..50 {
            store.create_record("orders", json!({ "total": 5 })).await.unwrap();
            if let Ok(Some(inbound)) =
                tokio::time::timeout(Duration::from_millis(20), rx.recv()).await
            {
                received = Some(inbound);
                break;
            }
        }

        let inbound = received.expect("no record event delivered");
        assert!(matches!(
            inbound.event.target,
            EventTarget::Record { ref table, .. } if table == "orders"
        ));
        assert_eq!(inbound.event.payload["fields"]["total"], json!(5));

        shutdown.cancel();
        listener.await.unwrap();
    }
}
