//! The engine composition root.
//!
//! [`Engine::start`] wires registry, matcher, idempotency store, ledger,
//! executor and worker pool together and spawns the background tasks:
//!
//! - the ingress loop draining the inbound channel,
//! - the cron and record listeners,
//! - the idempotency sweeper.
//!
//! Admission (match → key → pending run → enqueue) happens on the ingress
//! loop; execution happens on the worker pool. Ingress never waits for a run
//! unless the HTTP caller asked to (`respond_immediately = false`), in which
//! case it awaits the run's completion signal.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use nodes::RecordStore;
use queue::{JobHandler, QueueHandle, WorkerPool};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatcher::ActionDispatcher;
use crate::error::{EngineError, LedgerError};
use crate::executor::{ExecutorConfig, WorkflowExecutor};
use crate::idempotency::{idempotency_key, spawn_sweeper, IdempotencyStore, Reservation};
use crate::ledger::RunLedger;
use crate::listener::{spawn_cron_listener, spawn_record_listener, Inbound};
use crate::matcher::{GetOutcome, MatchedEvent, TriggerMatcher};
use crate::models::{Automation, ExecutionRun, IdempotencyRecord, RunStatus, RunSummary, TriggerEvent};
use crate::registry::{RegistryHandle, TriggerRegistry};
use crate::source::AutomationSource;
use crate::verify::VerifierSet;

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Result of admitting one matched event.
#[derive(Debug)]
pub struct Admission {
    pub run: RunSummary,
    /// The delivery was a duplicate; `run` is the existing run.
    pub duplicate: bool,
    pub respond_immediately: bool,
    completion: Option<oneshot::Receiver<RunStatus>>,
}

impl Admission {
    /// Wait for the run to finish, if it was started by this admission.
    pub async fn wait(mut self) -> RunSummary {
        if let Some(done) = self.completion.take() {
            match done.await {
                Ok(status) => self.run.status = status,
                // The worker dropped the signal; report the run as failed.
                Err(_) => self.run.status = RunStatus::Failed,
            }
        }
        self.run
    }
}

/// A run waiting for a worker.
struct RunJob {
    automation: Arc<Automation>,
    run: ExecutionRun,
    cancel: CancellationToken,
    done: oneshot::Sender<RunStatus>,
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Collaborators handed to [`Engine::start`].
pub struct EngineParts {
    pub config: EngineConfig,
    pub source: Arc<dyn AutomationSource>,
    pub dispatcher: ActionDispatcher,
    pub ledger: Arc<dyn RunLedger>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    /// Enables `database-record-created` triggers.
    pub records: Option<Arc<dyn RecordStore>>,
    pub verifiers: VerifierSet,
}

struct EngineCore {
    config: EngineConfig,
    source: Arc<dyn AutomationSource>,
    matcher: TriggerMatcher,
    idempotency: Arc<dyn IdempotencyStore>,
    ledger: Arc<dyn RunLedger>,
    queue: QueueHandle<RunJob>,
    /// Cancel tokens of runs that are queued or executing.
    active: Arc<DashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
    inbound: mpsc::Sender<Inbound>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    pool: Arc<Mutex<Option<WorkerPool<RunJob>>>>,
}

impl Engine {
    /// Load automations, build the registry and spawn every background task.
    pub async fn start(parts: EngineParts) -> Result<Self, EngineError> {
        let automations = parts.source.load().await?;
        let registry = TriggerRegistry::build(automations, &parts.verifiers)?;
        info!(automations = registry.len(), "trigger registry built");
        let registry = RegistryHandle::new(registry);

        let shutdown = CancellationToken::new();
        let active = Arc::new(DashMap::new());
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(parts.dispatcher),
            parts.ledger.clone(),
            ExecutorConfig::from(&parts.config),
        ));

        let pool = WorkerPool::start(
            parts.config.pool.clone(),
            Arc::new(RunWorker {
                executor,
                ledger: parts.ledger.clone(),
                active: active.clone(),
            }),
            shutdown.clone(),
        );

        let core = Arc::new(EngineCore {
            matcher: TriggerMatcher::new(registry.clone(), parts.verifiers),
            source: parts.source,
            idempotency: parts.idempotency.clone(),
            ledger: parts.ledger,
            queue: pool.handle(),
            active,
            shutdown: shutdown.clone(),
            config: parts.config,
        });

        let (inbound, inbound_rx) = mpsc::channel(core.config.inbound_capacity.max(1));
        let mut tasks = vec![
            spawn_ingress(core.clone(), inbound_rx),
            spawn_cron_listener(
                registry.clone(),
                inbound.clone(),
                core.config.cron_resolution,
                shutdown.clone(),
            ),
            spawn_sweeper(parts.idempotency, core.config.sweep_interval, shutdown.clone()),
        ];
        if let Some(records) = parts.records {
            tasks.push(spawn_record_listener(
                registry,
                records,
                inbound.clone(),
                shutdown.clone(),
            ));
        }

        Ok(Self {
            core,
            inbound,
            tasks: Arc::new(Mutex::new(tasks)),
            pool: Arc::new(Mutex::new(Some(pool))),
        })
    }

    // -----------------------------------------------------------------------
    // Ingress
    // -----------------------------------------------------------------------

    /// Publish an event and wait until it is admitted (not executed).
    pub async fn submit(&self, event: TriggerEvent) -> Result<Vec<Admission>, EngineError> {
        if self.core.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let (reply, admitted) = oneshot::channel();
        self.inbound
            .send(Inbound {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        admitted.await.map_err(|_| EngineError::ShuttingDown)?
    }

    /// Classify a GET on an automation path.
    pub fn handle_get(
        &self,
        path: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<GetOutcome, EngineError> {
        if self.core.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        self.core.matcher.handle_get(path, query)
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    pub async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRun, EngineError> {
        self.core.ledger.get_run(run_id).await.map_err(|e| match e {
            LedgerError::RunNotFound(id) => EngineError::RunNotFound(id),
            other => other.into(),
        })
    }

    pub async fn list_runs(
        &self,
        automation_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRun>, EngineError> {
        Ok(self.core.ledger.list_runs(automation_id, limit).await?)
    }

    pub fn automations(&self) -> Vec<Arc<Automation>> {
        self.core.matcher.registry().load().automations()
    }

    /// Re-read the source and swap the registry. On error the current
    /// registry stays in place.
    pub async fn reload(&self) -> Result<usize, EngineError> {
        let automations = self.core.source.load().await?;
        let registry = TriggerRegistry::build(automations, self.core.matcher.verifiers())?;
        let count = registry.len();
        self.core.matcher.registry().swap(registry);
        Ok(count)
    }

    /// Cancel a queued or running run. Returns `false` when the run exists
    /// but has already finished.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, EngineError> {
        if let Some(token) = self.core.active.get(&run_id) {
            info!(%run_id, "run cancellation requested");
            token.cancel();
            return Ok(true);
        }
        self.get_run(run_id).await.map(|_| false)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.core.shutdown.is_cancelled()
    }

    /// Stop accepting events and wait for running jobs and background tasks.
    /// Runs still queued when the pool stops stay `pending` in the ledger.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.core.shutdown.cancel();
        if let Some(pool) = self.pool.lock().await.take() {
            pool.shutdown().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        info!("engine stopped");
    }
}

fn spawn_ingress(core: Arc<EngineCore>, mut inbound: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = core.shutdown.cancelled() => break,
                item = inbound.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let result = core.admit(item.event).await;
            match item.reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(e) = result {
                        warn!(error = %e, "listener event not admitted");
                    }
                }
            }
        }

        // Anyone still waiting learns that the engine is going away.
        inbound.close();
        while let Ok(item) = inbound.try_recv() {
            if let Some(reply) = item.reply {
                let _ = reply.send(Err(EngineError::ShuttingDown));
            }
        }
        debug!("ingress loop stopped");
    })
}

impl EngineCore {
    async fn admit(&self, event: TriggerEvent) -> Result<Vec<Admission>, EngineError> {
        let matched = match self.matcher.match_event(event) {
            Ok(matched) => matched,
            Err(e) => {
                info!(error = %e, "trigger event rejected");
                return Err(e);
            }
        };

        // A failure for one automation does not hold back the others an
        // event fans out to.
        let mut admissions = Vec::with_capacity(matched.len());
        let mut first_error = None;
        for m in matched {
            let automation_id = m.automation.id.clone();
            match self.admit_one(m).await {
                Ok(admission) => admissions.push(admission),
                Err(e) => {
                    error!(automation_id = %automation_id, error = %e, "run not admitted");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if admissions.is_empty() => Err(e),
            _ => Ok(admissions),
        }
    }

    /// Give the key back after the run it was reserved for failed to start.
    async fn release_key(&self, key: &str, run_id: Uuid) {
        if let Err(e) = self.idempotency.release(key, run_id).await {
            error!(%run_id, error = %e, "could not release idempotency key");
        }
    }

    /// Reserve the idempotency key, create the pending run and enqueue it.
    async fn admit_one(&self, matched: MatchedEvent) -> Result<Admission, EngineError> {
        let MatchedEvent { automation, event } = matched;
        let key = idempotency_key(&automation.id, &event);
        let run = ExecutionRun::pending(&automation.id, &event, key.clone());
        let respond_immediately = automation.trigger.respond_immediately();

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.idempotency_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let reservation = self
            .idempotency
            .reserve(
                IdempotencyRecord {
                    key,
                    run_id: run.run_id,
                    automation_id: automation.id.clone(),
                    expires_at: now + ttl,
                },
                now,
            )
            .await?;

        if let Reservation::Duplicate(existing) = reservation {
            info!(
                automation_id = %automation.id,
                run_id = %existing.run_id,
                "duplicate delivery, returning existing run"
            );
            let status = match self.ledger.get_run(existing.run_id).await {
                Ok(run) => run.status,
                // Reserved by a concurrent admission that has not created the run yet.
                Err(LedgerError::RunNotFound(_)) => RunStatus::Pending,
                Err(e) => return Err(e.into()),
            };
            return Ok(Admission {
                run: RunSummary {
                    run_id: existing.run_id,
                    automation_id: existing.automation_id,
                    status,
                },
                duplicate: true,
                respond_immediately,
                completion: None,
            });
        }

        if let Err(e) = self.ledger.create_run(&run).await {
            self.release_key(&run.idempotency_key, run.run_id).await;
            return Err(e.into());
        }
        let summary = run.summary();
        let key = run.idempotency_key.clone();
        // Not tied to shutdown: running jobs are allowed to finish.
        let cancel = CancellationToken::new();
        self.active.insert(run.run_id, cancel.clone());

        let (done, completion) = oneshot::channel();
        let job = RunJob {
            automation: automation.clone(),
            run,
            cancel,
            done,
        };
        if let Err(e) = self.queue.submit(job).await {
            error!(run_id = %summary.run_id, error = %e, "could not enqueue run");
            self.active.remove(&summary.run_id);
            if let Err(mark) = self.ledger.update_status(summary.run_id, RunStatus::Failed).await {
                error!(run_id = %summary.run_id, error = %mark, "could not mark run failed");
            }
            self.release_key(&key, summary.run_id).await;
            return Err(EngineError::ShuttingDown);
        }

        info!(
            automation_id = %automation.id,
            run_id = %summary.run_id,
            source = ?event.source,
            "run admitted"
        );
        Ok(Admission {
            run: summary,
            duplicate: false,
            respond_immediately,
            completion: Some(completion),
        })
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct RunWorker {
    executor: Arc<WorkflowExecutor>,
    ledger: Arc<dyn RunLedger>,
    active: Arc<DashMap<Uuid, CancellationToken>>,
}

#[async_trait]
impl JobHandler<RunJob> for RunWorker {
    async fn handle(&self, job: RunJob) {
        let RunJob {
            automation,
            run,
            cancel,
            done,
        } = job;

        let status = if cancel.is_cancelled() {
            info!(run_id = %run.run_id, "run cancelled before it started");
            match self.ledger.update_status(run.run_id, RunStatus::Failed).await {
                Ok(()) => RunStatus::Failed,
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "could not mark run failed");
                    RunStatus::Failed
                }
            }
        } else {
            match self.executor.run(&automation, &run, cancel).await {
                Ok(result) => result.status,
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "run failed in the engine");
                    RunStatus::Failed
                }
            }
        };

        self.active.remove(&run.run_id);
        let _ = done.send(status);
    }
}
