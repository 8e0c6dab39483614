use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use textguard_core::{Entity, PredictionId};
use textguard_predictions::PredictionRecord;
use textguard_scoring::{ScoringEngine, ScoringError};

use crate::config::PipelineConfig;
use crate::orchestrator::timed_score;
use crate::queue::{Delivery, QueueError, TaskQueue};
use crate::repository::{PredictionRepository, RepositoryError};
use crate::retry::RetryPolicy;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Scored and completed; the job was acknowledged.
    Completed(PredictionRecord),
    /// Nothing to do (record gone or already terminal); the job was acknowledged.
    Skipped {
        prediction_id: PredictionId,
        reason: &'static str,
    },
    /// Transient failure; the job was requeued for `attempt` after `delay`.
    Retrying {
        prediction_id: PredictionId,
        attempt: u32,
        delay: Duration,
    },
    /// Permanent failure; the record was marked `failed`.
    Failed {
        prediction_id: PredictionId,
        error: ScoringError,
    },
    /// Transient failures used up every attempt; the record was marked `failed`.
    RetryExhausted {
        prediction_id: PredictionId,
        attempts: u32,
        last_error: ScoringError,
    },
}

/// Infrastructure failure while handling a delivery.
///
/// The job is left unacknowledged, so the visibility timeout redelivers it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to stop after its current delivery.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the worker thread to exit.
    pub fn join(mut self) {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) {
        self.request_shutdown();
        self.join();
    }
}

/// A set of workers sharing one queue.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Signal every worker first, then join them all.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.request_shutdown();
        }
        for worker in self.workers {
            worker.join();
        }
    }
}

/// Pulls scoring jobs off the queue and drives records to a terminal status.
///
/// - Delivery is at-least-once; every step is idempotent against the record.
/// - Transient engine failures are retried through the queue with backoff.
/// - Repository failures leave the job unacknowledged.
/// - A timed-out scoring call is abandoned, not cancelled; the global helper
///   thread cap in `score_with_timeout` bounds how many can pile up.
pub struct ScoringWorker<R, Q>
where
    R: PredictionRepository,
    Q: TaskQueue,
{
    repository: R,
    queue: Q,
    engine: Arc<dyn ScoringEngine>,
    retry: RetryPolicy,
    scoring_timeout: Duration,
    poll_interval: Duration,
}

impl<R, Q> ScoringWorker<R, Q>
where
    R: PredictionRepository,
    Q: TaskQueue,
{
    pub fn new(
        repository: R,
        queue: Q,
        engine: Arc<dyn ScoringEngine>,
        retry: RetryPolicy,
        scoring_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repository,
            queue,
            engine,
            retry,
            scoring_timeout,
            poll_interval,
        }
    }

    pub fn from_config(
        repository: R,
        queue: Q,
        engine: Arc<dyn ScoringEngine>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(
            repository,
            queue,
            engine,
            config.retry_policy(),
            config.scoring_timeout(),
            config.poll_interval(),
        )
    }

    /// Handle one delivery end to end.
    #[instrument(
        skip(self, delivery),
        fields(
            prediction_id = %delivery.job.prediction_id,
            attempt = delivery.job.attempt,
            receipt = %delivery.receipt
        )
    )]
    pub fn process_delivery(&self, delivery: &Delivery) -> Result<WorkerOutcome, WorkerError> {
        let job = &delivery.job;
        let id = job.prediction_id;

        let record = match self.repository.find_by_id(id)? {
            Some(record) if !record.is_terminal() => record,
            found => {
                let reason = if found.is_some() {
                    "already terminal"
                } else {
                    "record not found"
                };
                self.queue.acknowledge(delivery)?;
                debug!(reason, "job discarded");
                return Ok(WorkerOutcome::Skipped {
                    prediction_id: id,
                    reason,
                });
            }
        };

        match timed_score(&self.engine, record.text(), self.scoring_timeout) {
            Ok(update) => {
                let completed = self.repository.complete(id, &update)?;
                self.queue.acknowledge(delivery)?;
                info!(
                    toxicity_level = %completed.toxicity_level(),
                    processing_time_ms = completed.processing_time_ms(),
                    "prediction completed"
                );
                Ok(WorkerOutcome::Completed(completed))
            }
            Err(err) if err.is_transient() => {
                let attempts_made = job.attempt + 1;
                if self.retry.should_retry(attempts_made) {
                    let delay = self.retry.delay_for_job(attempts_made, id);
                    let retry_job = job.next_attempt();
                    let attempt = retry_job.attempt;
                    self.queue.requeue(delivery, retry_job, delay)?;
                    warn!(
                        error = %err,
                        next_attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient scoring failure; requeued"
                    );
                    Ok(WorkerOutcome::Retrying {
                        prediction_id: id,
                        attempt,
                        delay,
                    })
                } else {
                    let reason =
                        format!("retries exhausted after {attempts_made} attempts: {err}");
                    self.repository.fail(id, &reason)?;
                    self.queue.acknowledge(delivery)?;
                    warn!(error = %err, attempts = attempts_made, "retries exhausted; prediction failed");
                    Ok(WorkerOutcome::RetryExhausted {
                        prediction_id: id,
                        attempts: attempts_made,
                        last_error: err,
                    })
                }
            }
            Err(err) => {
                self.repository.fail(id, &err.to_string())?;
                self.queue.acknowledge(delivery)?;
                warn!(error = %err, "permanent scoring failure; prediction failed");
                Ok(WorkerOutcome::Failed {
                    prediction_id: id,
                    error: err,
                })
            }
        }
    }

    /// Dequeue and process until shutdown is requested.
    fn run(&self, name: &str, shutdown_rx: mpsc::Receiver<()>) {
        info!(worker = name, "scoring worker started");
        let mut dequeue_failures: u32 = 0;

        loop {
            // Shutdown check (non-blocking)
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            match self.queue.dequeue(self.poll_interval) {
                Ok(Some(delivery)) => {
                    dequeue_failures = 0;
                    if let Err(err) = self.process_delivery(&delivery) {
                        warn!(
                            worker = name,
                            prediction_id = %delivery.job.prediction_id,
                            error = %err,
                            "delivery left unacknowledged"
                        );
                    }
                }
                Ok(None) => dequeue_failures = 0,
                Err(err) => {
                    dequeue_failures = dequeue_failures.saturating_add(1);
                    let backoff = self.retry.delay_for_retry(dequeue_failures);
                    warn!(
                        worker = name,
                        error = %err,
                        failures = dequeue_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "dequeue failed; backing off"
                    );
                    // Sleep, but wake immediately on shutdown.
                    if shutdown_rx.recv_timeout(backoff).is_ok() {
                        break;
                    }
                }
            }
        }

        info!(worker = name, "scoring worker stopped");
    }
}

impl<R, Q> ScoringWorker<R, Q>
where
    R: PredictionRepository,
    Q: TaskQueue,
{
    /// Spawn one worker thread.
    pub fn spawn(self: &Arc<Self>, name: impl Into<String>) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = name.into();
        let worker = Arc::clone(self);

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run(&name, shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    /// Spawn `count` workers named `scoring-worker-<n>`.
    pub fn spawn_pool(self: &Arc<Self>, count: usize) -> std::io::Result<WorkerPool> {
        let mut workers = Vec::with_capacity(count);
        for n in 0..count {
            match self.spawn(format!("scoring-worker-{n}")) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    WorkerPool { workers }.shutdown();
                    return Err(err);
                }
            }
        }
        Ok(WorkerPool { workers })
    }
}
