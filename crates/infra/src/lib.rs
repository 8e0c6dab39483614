//! Infrastructure layer: storage, queueing, configuration and the pipeline
//! components built on them.

pub mod config;
pub mod maintenance;
pub mod orchestrator;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod workers;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_support;

pub use config::{ConfigError, PipelineConfig};
pub use maintenance::{MaintenanceSweeper, SweepError, SweeperHandle};
pub use orchestrator::{JobHandle, Orchestrator, OrchestratorError, SubmitMode, Submission};
pub use queue::{Delivery, InMemoryTaskQueue, QueueError, TaskQueue};
#[cfg(feature = "redis")]
pub use queue::RedisTaskQueue;
pub use repository::{
    CreateOutcome, InMemoryPredictionRepository, Page, PageCursor, PostgresPredictionRepository,
    PredictionRepository, RepositoryError,
};
pub use retry::{Backoff, RetryPolicy};
pub use workers::{ScoringWorker, WorkerError, WorkerHandle, WorkerOutcome, WorkerPool};
