//! Test doubles shared by unit and pipeline tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use textguard_core::{PredictionId, RequestId};
use textguard_predictions::{PredictionRecord, ScoreUpdate, ScoringJob};
use textguard_scoring::{LinearTextClassifier, ModelArtifact, ScoreOutcome, ScoringEngine, ScoringError};

use crate::queue::{Delivery, QueueError, TaskQueue};
use crate::repository::{CreateOutcome, Page, PageCursor, PredictionRepository, RepositoryError};

type Script = Box<dyn Fn(&str, usize) -> Result<ScoreOutcome, ScoringError> + Send + Sync>;

/// Engine whose answers are scripted per call; counts every call.
pub struct ScriptedEngine {
    calls: AtomicUsize,
    script: Script,
}

impl ScriptedEngine {
    /// `script(text, call_index)` decides each answer.
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, usize) -> Result<ScoreOutcome, ScoringError> + Send + Sync + 'static,
    {
        Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        }
    }

    pub fn fixed(score: f64) -> Self {
        Self::new(move |_, _| outcome(score))
    }

    pub fn always(err: ScoringError) -> Self {
        Self::new(move |_, _| Err(err.clone()))
    }

    /// Fails with `err` for the first `failures` calls, then scores `score`.
    pub fn flaky(failures: usize, err: ScoringError, score: f64) -> Self {
        Self::new(move |_, call| {
            if call < failures {
                Err(err.clone())
            } else {
                outcome(score)
            }
        })
    }

    /// Sleeps for `delay` before scoring.
    pub fn slow(delay: Duration, score: f64) -> Self {
        Self::new(move |_, _| {
            std::thread::sleep(delay);
            outcome(score)
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ScoringEngine for ScriptedEngine {
    fn model_version(&self) -> &str {
        "scripted-1"
    }

    fn score(&self, text: &str) -> Result<ScoreOutcome, ScoringError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(text, call)
    }
}

pub fn outcome(score: f64) -> Result<ScoreOutcome, ScoringError> {
    let (label, confidence) = if score >= 0.5 {
        ("toxic", score)
    } else {
        ("non_toxic", 1.0 - score)
    };
    ScoreOutcome::new(score, label, confidence)
}

/// Small real classifier: insults push the score up, praise pulls it down.
pub fn lexicon_classifier() -> LinearTextClassifier {
    let weights: HashMap<String, f64> = [
        ("idiot", 4.0),
        ("stupid", 3.5),
        ("hate", 2.5),
        ("wonderful", -1.5),
        ("great", -1.0),
    ]
    .into_iter()
    .map(|(w, v)| (w.to_string(), v))
    .collect();

    LinearTextClassifier::from_artifact(ModelArtifact {
        version: "lexicon-test".to_string(),
        bias: -3.0,
        weights,
        threshold: None,
    })
    .expect("test model is valid")
}

/// Queue whose every operation is unavailable.
pub struct FailingQueue;

impl TaskQueue for FailingQueue {
    fn enqueue(&self, _job: ScoringJob) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    fn dequeue(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    fn acknowledge(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    fn requeue(
        &self,
        _delivery: &Delivery,
        _job: ScoringJob,
        _delay: Duration,
    ) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }
}

/// Queue that fails `dequeue` a fixed number of times before delegating.
pub struct FlakyDequeue<Q> {
    inner: Q,
    remaining_failures: Mutex<usize>,
    pub attempts: AtomicUsize,
}

impl<Q: TaskQueue> FlakyDequeue<Q> {
    pub fn new(inner: Q, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: Mutex::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl<Q: TaskQueue> TaskQueue for FlakyDequeue<Q> {
    fn enqueue(&self, job: ScoringJob) -> Result<(), QueueError> {
        self.inner.enqueue(job)
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut remaining = self.remaining_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(QueueError::Unavailable("broker restarting".to_string()));
        }
        drop(remaining);
        self.inner.dequeue(wait)
    }

    fn acknowledge(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.acknowledge(delivery)
    }

    fn requeue(
        &self,
        delivery: &Delivery,
        job: ScoringJob,
        delay: Duration,
    ) -> Result<(), QueueError> {
        self.inner.requeue(delivery, job, delay)
    }
}

/// Repository whose storage is always down.
pub struct FailingRepository;

fn storage_down() -> RepositoryError {
    RepositoryError::Storage("database is down".to_string())
}

impl PredictionRepository for FailingRepository {
    fn create(&self, _record: PredictionRecord) -> Result<CreateOutcome, RepositoryError> {
        Err(storage_down())
    }

    fn complete(
        &self,
        _id: PredictionId,
        _update: &ScoreUpdate,
    ) -> Result<PredictionRecord, RepositoryError> {
        Err(storage_down())
    }

    fn fail(&self, _id: PredictionId, _reason: &str) -> Result<PredictionRecord, RepositoryError> {
        Err(storage_down())
    }

    fn find_by_id(&self, _id: PredictionId) -> Result<Option<PredictionRecord>, RepositoryError> {
        Err(storage_down())
    }

    fn find_by_request_id(
        &self,
        _request_id: &RequestId,
    ) -> Result<Option<PredictionRecord>, RepositoryError> {
        Err(storage_down())
    }

    fn list_paged(
        &self,
        _cursor: Option<PageCursor>,
        _limit: usize,
    ) -> Result<Page, RepositoryError> {
        Err(storage_down())
    }

    fn find_by_text(
        &self,
        _text: &str,
        _limit: usize,
    ) -> Result<Vec<PredictionRecord>, RepositoryError> {
        Err(storage_down())
    }

    fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        Err(storage_down())
    }
}
