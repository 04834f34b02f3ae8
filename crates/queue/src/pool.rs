//! Bounded in-process worker pool.
//!
//! Jobs go into a bounded `mpsc` channel; `workers` tasks share the receiver
//! and process one job each at a time. Submitting never runs the job inline,
//! so ingress paths stay responsive while slow jobs occupy workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::QueueError;

/// Processes one job. Errors are the handler's own business — a job that
/// fails must record its failure itself.
#[async_trait]
pub trait JobHandler<J>: Send + Sync + 'static {
    async fn handle(&self, job: J);
}

/// Tuning knobs for the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrently running jobs.
    pub workers: usize,
    /// Jobs that may wait for a free worker before `submit` applies back-pressure.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            capacity: 1024,
        }
    }
}

/// Cloneable submission side of a [`WorkerPool`].
pub struct QueueHandle<J> {
    sender: mpsc::Sender<J>,
    shutdown: CancellationToken,
}

impl<J> Clone for QueueHandle<J> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<J: Send + 'static> QueueHandle<J> {
    /// Enqueue a job, waiting for a free slot if the queue is full.
    pub async fn submit(&self, job: J) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        self.sender.send(job).await.map_err(|_| QueueError::Closed)
    }

    /// Enqueue a job without waiting.
    pub fn try_submit(&self, job: J) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

/// A fixed set of workers draining a bounded job queue.
pub struct WorkerPool<J> {
    handle: QueueHandle<J>,
    workers: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn the workers. They stop picking up new jobs once `shutdown` is
    /// cancelled; jobs already running are allowed to finish.
    pub fn start(
        config: PoolConfig,
        handler: Arc<dyn JobHandler<J>>,
        shutdown: CancellationToken,
    ) -> Self {
        let workers_count = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let active = Arc::new(AtomicUsize::new(0));

        info!(workers = workers_count, capacity = config.capacity, "starting worker pool");

        let workers = (0..workers_count)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                let active = active.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = receiver.lock().await;
                            tokio::select! {
                                _ = shutdown.cancelled() => None,
                                job = rx.recv() => job,
                            }
                        };
                        let Some(job) = job else { break };

                        active.fetch_add(1, Ordering::SeqCst);
                        handler.handle(job).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                    debug!(worker_id, "worker stopped");
                })
            })
            .collect();

        Self {
            handle: QueueHandle { sender, shutdown },
            workers,
            active,
        }
    }

    pub fn handle(&self) -> QueueHandle<J> {
        self.handle.clone()
    }

    /// Jobs currently being processed.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and wait for running ones to finish.
    pub async fn shutdown(self) {
        self.handle.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<u32>>,
        peak: AtomicUsize,
        running: AtomicUsize,
        delay: Duration,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                peak: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl JobHandler<u32> for Recorder {
        async fn handle(&self, job: u32) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.seen.lock().await.push(job);
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn processes_every_job_within_the_worker_limit() {
        let recorder = Recorder::new(Duration::from_millis(10));
        let pool = WorkerPool::start(
            PoolConfig { workers: 3, capacity: 32 },
            recorder.clone(),
            CancellationToken::new(),
        );
        let handle = pool.handle();

        for job in 0..12 {
            handle.submit(job).await.unwrap();
        }
        while recorder.seen.lock().await.len() < 12 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(recorder.peak.load(Ordering::SeqCst) <= 3);
        let mut seen = recorder.seen.lock().await.clone();
        seen.sort();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn try_submit_reports_full_queue() {
        let recorder = Recorder::new(Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(
            PoolConfig { workers: 1, capacity: 1 },
            recorder,
            shutdown.clone(),
        );
        let handle = pool.handle();

        handle.submit(1).await.unwrap();
        // Let the single worker pick up job 1 so job 2 sits in the only slot.
        while pool.active() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.try_submit(2).unwrap();

        assert_eq!(handle.try_submit(3), Err(QueueError::Full));
        shutdown.cancel();
        assert_eq!(handle.try_submit(4), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::start(
            PoolConfig::default(),
            Recorder::new(Duration::ZERO),
            CancellationToken::new(),
        );
        let handle = pool.handle();
        pool.shutdown().await;

        assert_eq!(handle.submit(1).await, Err(QueueError::Closed));
    }
}
