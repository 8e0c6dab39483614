//! Prediction orchestration (application-level entry point).
//!
//! The `Orchestrator` turns an incoming text into a persisted, idempotent
//! prediction record. It composes the repository, the task queue and the
//! scoring engine; it does no IO itself.
//!
//! ## Submission Flow
//!
//! ```text
//! PredictionRequest
//!   ↓
//! 1. create pending record (keyed on request_id; an existing record is reused)
//!   ↓
//! 2a. Synchronous: score under timeout → complete (or fail) the record
//! 2b. Deferred:    enqueue ScoringJob(attempt = 0) → return JobHandle
//! ```
//!
//! ## Idempotency
//!
//! - A terminal record for the same request id is returned unchanged; the new
//!   text is never scored.
//! - A pending record is reused: the synchronous path scores it, the deferred
//!   path returns its handle without enqueueing a second job.
//!
//! ## Error Semantics
//!
//! - Request validation → `OrchestratorError::Validation`
//! - Scoring failure (synchronous only) → record marked `failed`, `Scoring` returned
//! - Enqueue failure → record marked `failed`, `QueueUnavailable` returned
//! - Repository failure → `Storage`

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};

use textguard_core::{DomainError, Entity, PredictionId, RequestId};
use textguard_predictions::{PredictionRecord, PredictionRequest, ScoreUpdate, ScoringJob};
use textguard_scoring::{live_scoring_threads, score_with_timeout, ScoringEngine, ScoringError};

use crate::config::PipelineConfig;
use crate::queue::{QueueError, TaskQueue};
use crate::repository::{
    CreateOutcome, Page, PageCursor, PredictionRepository, RepositoryError,
};

/// How a submission is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Score inline and return the finished record.
    Synchronous,
    /// Enqueue for a worker and return a handle.
    Deferred,
}

/// Handle for a deferred submission; resolves through [`Orchestrator::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobHandle(PredictionId);

impl JobHandle {
    pub fn prediction_id(&self) -> PredictionId {
        self.0
    }
}

impl core::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The record reached (or already had) a terminal status.
    Finished(PredictionRecord),
    /// A worker will score the record.
    Deferred(JobHandle),
}

impl Submission {
    pub fn prediction_id(&self) -> PredictionId {
        match self {
            Self::Finished(record) => *record.id(),
            Self::Deferred(handle) => handle.prediction_id(),
        }
    }

    pub fn record(&self) -> Option<&PredictionRecord> {
        match self {
            Self::Finished(record) => Some(record),
            Self::Deferred(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("scoring failed: {0}")]
    Scoring(#[from] ScoringError),

    #[error("task queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),

    #[error("storage failure: {0}")]
    Storage(#[from] RepositoryError),
}

impl From<DomainError> for OrchestratorError {
    fn from(value: DomainError) -> Self {
        OrchestratorError::Validation(value.to_string())
    }
}

/// Accepts scoring requests and routes them inline or through the queue.
///
/// ## Generic Parameters
///
/// - `R`: prediction repository
/// - `Q`: task queue
pub struct Orchestrator<R, Q>
where
    R: PredictionRepository,
    Q: TaskQueue,
{
    repository: R,
    queue: Q,
    engine: Arc<dyn ScoringEngine>,
    scoring_timeout: Duration,
}

impl<R, Q> Orchestrator<R, Q>
where
    R: PredictionRepository,
    Q: TaskQueue,
{
    pub fn new(
        repository: R,
        queue: Q,
        engine: Arc<dyn ScoringEngine>,
        scoring_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            queue,
            engine,
            scoring_timeout,
        }
    }

    pub fn from_config(
        repository: R,
        queue: Q,
        engine: Arc<dyn ScoringEngine>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(repository, queue, engine, config.scoring_timeout())
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Submit one request.
    #[instrument(
        skip(self, request),
        fields(request_id = request.request_id().map(RequestId::as_str))
    )]
    pub fn submit(
        &self,
        request: PredictionRequest,
        mode: SubmitMode,
    ) -> Result<Submission, OrchestratorError> {
        let request_id = request
            .request_id()
            .cloned()
            .unwrap_or_else(RequestId::generate);
        let pending = PredictionRecord::pending(&request, request_id, self.engine.model_version());
        let outcome = self.repository.create(pending)?;

        if outcome.record().is_terminal() {
            info!(
                prediction_id = %outcome.record().id(),
                status = %outcome.record().status(),
                "request already processed; returning stored record"
            );
            return Ok(Submission::Finished(outcome.into_record()));
        }

        match mode {
            SubmitMode::Synchronous => self.score_inline(outcome),
            SubmitMode::Deferred => self.defer(outcome),
        }
    }

    /// Validate raw caller input and submit it.
    pub fn submit_text(
        &self,
        text: &str,
        request_id: Option<&str>,
        mode: SubmitMode,
    ) -> Result<Submission, OrchestratorError> {
        let mut request = PredictionRequest::new(text)?;
        if let Some(raw) = request_id {
            request = request.with_request_id(RequestId::new(raw)?);
        }
        self.submit(request, mode)
    }

    /// Submit several requests; each item succeeds or fails on its own.
    pub fn submit_batch(
        &self,
        requests: Vec<PredictionRequest>,
        mode: SubmitMode,
    ) -> Vec<Result<Submission, OrchestratorError>> {
        let results: Vec<_> = requests
            .into_iter()
            .map(|request| self.submit(request, mode))
            .collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            batch_size = results.len(),
            failed,
            mode = ?mode,
            "batch submitted"
        );
        results
    }

    pub fn get(&self, id: PredictionId) -> Result<Option<PredictionRecord>, OrchestratorError> {
        Ok(self.repository.find_by_id(id)?)
    }

    pub fn get_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<PredictionRecord>, OrchestratorError> {
        Ok(self.repository.find_by_request_id(request_id)?)
    }

    /// Newest first; pass the returned `next_cursor` back for the next page.
    pub fn list(
        &self,
        cursor: Option<PageCursor>,
        limit: usize,
    ) -> Result<Page, OrchestratorError> {
        Ok(self.repository.list_paged(cursor, limit)?)
    }

    /// Earlier predictions for exactly this text, newest first.
    pub fn search(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>, OrchestratorError> {
        Ok(self.repository.find_by_text(text, limit)?)
    }

    fn score_inline(&self, outcome: CreateOutcome) -> Result<Submission, OrchestratorError> {
        let created = outcome.was_created();
        let record = outcome.into_record();
        let id = *record.id();

        match timed_score(&self.engine, record.text(), self.scoring_timeout) {
            Ok(update) => {
                let completed = self.repository.complete(id, &update)?;
                info!(
                    prediction_id = %id,
                    toxicity_level = %completed.toxicity_level(),
                    processing_time_ms = completed.processing_time_ms(),
                    "prediction completed"
                );
                Ok(Submission::Finished(completed))
            }
            Err(err) => {
                warn!(prediction_id = %id, error = %err, "synchronous scoring failed");
                // A reused pending record may still be owned by a queued job.
                if created {
                    self.repository.fail(id, &err.to_string())?;
                }
                Err(err.into())
            }
        }
    }

    fn defer(&self, outcome: CreateOutcome) -> Result<Submission, OrchestratorError> {
        let handle = JobHandle(*outcome.record().id());
        if !outcome.was_created() {
            return Ok(Submission::Deferred(handle));
        }

        let job = ScoringJob::for_record(outcome.record());
        match self.queue.enqueue(job) {
            Ok(()) => {
                info!(prediction_id = %handle, "prediction deferred");
                Ok(Submission::Deferred(handle))
            }
            Err(err) => {
                warn!(prediction_id = %handle, error = %err, "enqueue failed; marking record failed");
                if let Err(fail_err) = self
                    .repository
                    .fail(handle.prediction_id(), &format!("enqueue failed: {err}"))
                {
                    warn!(prediction_id = %handle, error = %fail_err, "could not mark record failed");
                }
                Err(err.into())
            }
        }
    }
}

/// Score `text` under `timeout` and time the call.
pub(crate) fn timed_score(
    engine: &Arc<dyn ScoringEngine>,
    text: &str,
    timeout: Duration,
) -> Result<ScoreUpdate, ScoringError> {
    let started = Instant::now();
    let outcome = score_with_timeout(engine, text, timeout).inspect_err(|err| {
        if matches!(err, ScoringError::TimedOut(_)) {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                live_threads = live_scoring_threads(),
                "scoring call abandoned; its thread runs until the engine returns"
            );
        }
    })?;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    ScoreUpdate::new(
        outcome.score,
        outcome.label,
        outcome.confidence,
        elapsed_ms,
        engine.model_version(),
    )
    .map_err(|e| ScoringError::EngineUnavailable(e.to_string()))
}
