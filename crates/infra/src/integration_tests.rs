//! Integration tests for the full prediction pipeline.
//!
//! Tests: Orchestrator → Repository / TaskQueue → ScoringWorker → Repository
//!
//! Verifies:
//! - Idempotency across synchronous, deferred and redelivered submissions
//! - Retry bound and terminal failure recording
//! - Batch partial failure
//! - Worker recovery from queue outages and lost deliveries

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use textguard_core::RequestId;
    use textguard_predictions::{PredictionRequest, PredictionStatus, ScoringJob, ToxicityLevel};
    use textguard_scoring::{LinearTextClassifier, ModelSlot, ScoreOutcome, ScoringEngine, ScoringError};

    use crate::orchestrator::{Orchestrator, OrchestratorError, SubmitMode, Submission};
    use crate::queue::{InMemoryTaskQueue, TaskQueue};
    use crate::repository::{InMemoryPredictionRepository, PredictionRepository};
    use crate::retry::RetryPolicy;
    use crate::test_support::{lexicon_classifier, outcome, FlakyDequeue, ScriptedEngine};
    use crate::workers::{ScoringWorker, WorkerOutcome};

    type Repo = Arc<InMemoryPredictionRepository>;

    struct Pipeline<Q: TaskQueue> {
        repo: Repo,
        queue: Arc<Q>,
        orchestrator: Orchestrator<Repo, Arc<Q>>,
        worker: Arc<ScoringWorker<Repo, Arc<Q>>>,
    }

    fn pipeline_with<Q: TaskQueue>(
        queue: Q,
        engine: Arc<dyn ScoringEngine>,
        max_attempts: u32,
    ) -> Pipeline<Q> {
        let repo: Repo = Arc::new(InMemoryPredictionRepository::new());
        let queue = Arc::new(queue);
        let orchestrator = Orchestrator::new(
            repo.clone(),
            queue.clone(),
            engine.clone(),
            Duration::from_secs(1),
        );
        let worker = Arc::new(ScoringWorker::new(
            repo.clone(),
            queue.clone(),
            engine,
            RetryPolicy::fixed(max_attempts, Duration::from_millis(5)),
            Duration::from_secs(1),
            Duration::from_millis(10),
        ));
        Pipeline {
            repo,
            queue,
            orchestrator,
            worker,
        }
    }

    fn pipeline(engine: Arc<dyn ScoringEngine>, max_attempts: u32) -> Pipeline<InMemoryTaskQueue> {
        pipeline_with(InMemoryTaskQueue::default(), engine, max_attempts)
    }

    fn request(text: &str, request_id: &str) -> PredictionRequest {
        PredictionRequest::new(text)
            .unwrap()
            .with_request_id(RequestId::new(request_id).unwrap())
    }

    fn wait_for_status(repo: &Repo, request_id: &str, status: PredictionStatus) {
        let request_id = RequestId::new(request_id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let current = repo
                .find_by_request_id(&request_id)
                .unwrap()
                .map(|r| r.status());
            if current == Some(status) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "{request_id} stuck at {current:?}, expected {status}"
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn benign_text_scores_low_and_resubmission_returns_the_original() {
        let p = pipeline(Arc::new(lexicon_classifier()), 3);

        let first = p
            .orchestrator
            .submit(request("you are wonderful", "r1"), SubmitMode::Synchronous)
            .unwrap();
        let record = first.record().unwrap().clone();
        assert_eq!(record.status(), PredictionStatus::Completed);
        assert!(record.toxicity_score() < 0.05);
        assert_eq!(record.toxicity_level(), ToxicityLevel::None);
        assert_eq!(record.model_label(), Some("non_toxic"));
        assert_eq!(record.model_version(), "lexicon-test");

        let again = p
            .orchestrator
            .submit(request("you stupid idiot", "r1"), SubmitMode::Synchronous)
            .unwrap();
        assert_eq!(again, Submission::Finished(record.clone()));
        assert_eq!(again.record().unwrap().text(), "you are wonderful");
        assert_eq!(p.repo.len(), 1);
    }

    #[test]
    fn toxic_text_scores_high() {
        let p = pipeline(Arc::new(lexicon_classifier()), 3);
        let record = p
            .orchestrator
            .submit(request("you stupid idiot", "r2"), SubmitMode::Synchronous)
            .unwrap()
            .record()
            .cloned()
            .unwrap();
        assert_eq!(record.toxicity_level(), ToxicityLevel::High);
        assert_eq!(record.model_label(), Some("toxic"));
        assert!(record.confidence() > 0.9);
    }

    #[test]
    fn text_without_vocabulary_tokens_still_completes() {
        let p = pipeline(Arc::new(lexicon_classifier()), 3);

        for (text, id) in [("Who are you?", "sw1"), ("I am here", "sw2"), ("!!!", "sw3")] {
            let record = p
                .orchestrator
                .submit(request(text, id), SubmitMode::Synchronous)
                .unwrap()
                .record()
                .cloned()
                .unwrap();
            assert_eq!(record.status(), PredictionStatus::Completed, "{text}");
            assert_eq!(record.toxicity_level(), ToxicityLevel::None, "{text}");
        }
    }

    #[test]
    fn worker_records_the_version_of_the_model_that_scored() {
        let slot: Arc<ModelSlot<LinearTextClassifier>> = Arc::new(ModelSlot::new("1.0"));
        let p = pipeline(slot.clone(), 3);

        let submission = p
            .orchestrator
            .submit(request("you are wonderful", "mv1"), SubmitMode::Deferred)
            .unwrap();
        let pending = p.orchestrator.get(submission.prediction_id()).unwrap().unwrap();
        assert_eq!(pending.model_version(), "1.0");

        assert!(slot.install(lexicon_classifier()).is_ok());
        let delivery = p.queue.dequeue(Duration::ZERO).unwrap().unwrap();
        let completed = match p.worker.process_delivery(&delivery).unwrap() {
            WorkerOutcome::Completed(record) => record,
            other => panic!("expected completion, got {other:?}"),
        };

        assert_eq!(completed.model_version(), "lexicon-test");
        let stored = p.orchestrator.get(submission.prediction_id()).unwrap().unwrap();
        assert_eq!(stored.model_version(), "lexicon-test");
    }

    #[test]
    fn batch_items_fail_independently() {
        let engine = Arc::new(ScriptedEngine::new(|text, _| {
            if text == "second" {
                Err(ScoringError::InvalidInput("text is empty".into()))
            } else {
                outcome(0.1)
            }
        }));
        let p = pipeline(engine, 3);

        let results = p.orchestrator.submit_batch(
            vec![
                request("first", "b1"),
                request("second", "b2"),
                request("third", "b3"),
            ],
            SubmitMode::Synchronous,
        );

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(OrchestratorError::Scoring(ScoringError::InvalidInput(_)))
        ));
        assert!(results[2].is_ok());

        let statuses: Vec<PredictionStatus> = ["b1", "b2", "b3"]
            .iter()
            .map(|id| {
                p.repo
                    .find_by_request_id(&RequestId::new(*id).unwrap())
                    .unwrap()
                    .unwrap()
                    .status()
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                PredictionStatus::Completed,
                PredictionStatus::Failed,
                PredictionStatus::Completed
            ]
        );
    }

    #[test]
    fn deferred_submission_is_completed_by_the_worker_pool() {
        let p = pipeline(Arc::new(lexicon_classifier()), 3);
        let pool = p.worker.spawn_pool(2).unwrap();

        let submission = p
            .orchestrator
            .submit(request("i hate this", "d1"), SubmitMode::Deferred)
            .unwrap();
        assert!(matches!(submission, Submission::Deferred(_)));

        wait_for_status(&p.repo, "d1", PredictionStatus::Completed);
        pool.shutdown();

        let record = p.orchestrator.get(submission.prediction_id()).unwrap().unwrap();
        assert!(record.processing_time_ms() < 1_000);
        assert!(p.queue.is_idle());
    }

    #[test]
    fn always_unavailable_engine_is_called_exactly_max_attempts_times() {
        let engine = Arc::new(ScriptedEngine::always(ScoringError::EngineUnavailable(
            "model not loaded".into(),
        )));
        let p = pipeline(engine.clone(), 3);
        let pool = p.worker.spawn_pool(3).unwrap();

        p.orchestrator
            .submit(request("anything", "x1"), SubmitMode::Deferred)
            .unwrap();
        wait_for_status(&p.repo, "x1", PredictionStatus::Failed);
        pool.shutdown();

        assert_eq!(engine.calls(), 3);
        let record = p
            .repo
            .find_by_request_id(&RequestId::new("x1").unwrap())
            .unwrap()
            .unwrap();
        let reason = record.failure_reason().unwrap();
        assert!(reason.contains("after 3 attempts"), "{reason}");
        assert!(reason.contains("model not loaded"), "{reason}");
    }

    #[test]
    fn transient_failures_recover_within_the_attempt_budget() {
        let engine = Arc::new(ScriptedEngine::flaky(
            2,
            ScoringError::TimedOut(Duration::from_secs(5)),
            0.4,
        ));
        let p = pipeline(engine.clone(), 3);
        let pool = p.worker.spawn_pool(1).unwrap();

        p.orchestrator
            .submit(request("eventually fine", "f1"), SubmitMode::Deferred)
            .unwrap();
        wait_for_status(&p.repo, "f1", PredictionStatus::Completed);
        pool.shutdown();

        assert_eq!(engine.calls(), 3);
    }

    #[test]
    fn duplicate_delivery_does_not_rescore_a_terminal_record() {
        let engine = Arc::new(ScriptedEngine::fixed(0.9));
        let p = pipeline(engine.clone(), 3);

        let submission = p
            .orchestrator
            .submit(request("text", "dup"), SubmitMode::Deferred)
            .unwrap();
        let delivery = p.queue.dequeue(Duration::ZERO).unwrap().unwrap();
        let completed = match p.worker.process_delivery(&delivery).unwrap() {
            WorkerOutcome::Completed(record) => record,
            other => panic!("expected completion, got {other:?}"),
        };

        // The broker hands the same job out again.
        let stored = p.repo.find_by_id(submission.prediction_id()).unwrap().unwrap();
        p.queue.enqueue(ScoringJob::for_record(&stored)).unwrap();
        let duplicate = p.queue.dequeue(Duration::ZERO).unwrap().unwrap();
        let outcome = p.worker.process_delivery(&duplicate).unwrap();

        assert!(matches!(outcome, WorkerOutcome::Skipped { .. }));
        assert_eq!(engine.calls(), 1);
        assert_eq!(
            p.repo.find_by_id(submission.prediction_id()).unwrap().unwrap(),
            completed
        );
    }

    #[test]
    fn lost_delivery_is_redelivered_after_visibility_timeout() {
        let engine = Arc::new(ScriptedEngine::fixed(0.2));
        let p = pipeline_with(
            InMemoryTaskQueue::new(Duration::from_millis(30)),
            engine,
            3,
        );

        p.orchestrator
            .submit(request("text", "lost"), SubmitMode::Deferred)
            .unwrap();

        // A worker claims the job and dies without acknowledging it.
        let abandoned = p.queue.dequeue(Duration::ZERO).unwrap();
        assert!(abandoned.is_some());

        let pool = p.worker.spawn_pool(1).unwrap();
        wait_for_status(&p.repo, "lost", PredictionStatus::Completed);
        pool.shutdown();
    }

    #[test]
    fn worker_backs_off_through_queue_outage() {
        let engine: Arc<dyn ScoringEngine> = Arc::new(ScriptedEngine::fixed(0.3));
        let p = pipeline_with(FlakyDequeue::new(InMemoryTaskQueue::default(), 3), engine, 3);
        let pool = p.worker.spawn_pool(1).unwrap();

        p.orchestrator
            .submit(request("text", "outage"), SubmitMode::Deferred)
            .unwrap();
        wait_for_status(&p.repo, "outage", PredictionStatus::Completed);
        pool.shutdown();

        assert!(p.queue.attempts.load(std::sync::atomic::Ordering::SeqCst) >= 4);
    }

    #[test]
    fn slow_engine_times_out_synchronously() {
        let engine = Arc::new(ScriptedEngine::slow(Duration::from_millis(300), 0.1));
        let repo: Repo = Arc::new(InMemoryPredictionRepository::new());
        let orchestrator = Orchestrator::new(
            repo.clone(),
            Arc::new(InMemoryTaskQueue::default()),
            engine,
            Duration::from_millis(20),
        );

        let err = orchestrator
            .submit(request("slow", "t1"), SubmitMode::Synchronous)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Scoring(ScoringError::TimedOut(_))));
        let record = repo
            .find_by_request_id(&RequestId::new("t1").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.status(), PredictionStatus::Failed);
    }

    #[test]
    fn concurrent_submissions_of_one_request_id_converge() {
        let engine = Arc::new(ScriptedEngine::new(|_, call| {
            outcome(if call == 0 { 0.8 } else { 0.1 })
        }));
        let p = Arc::new(pipeline(engine, 3));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                thread::spawn(move || {
                    p.orchestrator
                        .submit(request("same", "shared"), SubmitMode::Synchronous)
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<Submission> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(p.repo.len(), 1);
        let stored = p
            .repo
            .find_by_request_id(&RequestId::new("shared").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(stored.status(), PredictionStatus::Completed);
        for r in results {
            assert_eq!(r.record().unwrap().toxicity_score(), stored.toxicity_score());
        }
    }

    #[test]
    fn scripted_outcomes_are_valid() {
        let o: ScoreOutcome = outcome(0.3).unwrap();
        assert_eq!(o.label, "non_toxic");
        assert!((o.confidence - 0.7).abs() < 1e-9);
    }
}
