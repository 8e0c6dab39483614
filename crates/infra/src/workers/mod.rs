pub mod scoring_worker;

pub use scoring_worker::{ScoringWorker, WorkerError, WorkerHandle, WorkerOutcome, WorkerPool};
