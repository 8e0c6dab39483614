//! Task queue carrying scoring jobs from producers to worker threads.
//!
//! ## Delivery semantics
//!
//! - **At-least-once**: a dequeued job stays invisible for the visibility
//!   timeout. If it is neither acknowledged nor requeued in time it becomes
//!   visible again and is redelivered under a new receipt.
//! - **Receipts**: `acknowledge` / `requeue` act only on the delivery whose
//!   receipt is still current. A stale receipt (the job was redelivered
//!   meanwhile) is a no-op.
//! - **No ordering** guarantees across jobs.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use textguard_core::DeliveryId;
use textguard_predictions::ScoringJob;

pub use in_memory::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisTaskQueue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("job serialization error: {0}")]
    Serialization(String),

    #[error("queue state poisoned")]
    Poisoned,
}

/// One delivery of a job to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub receipt: DeliveryId,
    pub job: ScoringJob,
}

pub trait TaskQueue: Send + Sync + 'static {
    /// Make `job` visible to workers immediately.
    fn enqueue(&self, job: ScoringJob) -> Result<(), QueueError>;

    /// Claim the next visible job, waiting up to `wait` for one to appear.
    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivered job for good.
    fn acknowledge(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Replace a delivered job with `job`, visible again after `delay`.
    fn requeue(
        &self,
        delivery: &Delivery,
        job: ScoringJob,
        delay: Duration,
    ) -> Result<(), QueueError>;
}

impl<Q: TaskQueue + ?Sized> TaskQueue for Arc<Q> {
    fn enqueue(&self, job: ScoringJob) -> Result<(), QueueError> {
        (**self).enqueue(job)
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).dequeue(wait)
    }

    fn acknowledge(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).acknowledge(delivery)
    }

    fn requeue(
        &self,
        delivery: &Delivery,
        job: ScoringJob,
        delay: Duration,
    ) -> Result<(), QueueError> {
        (**self).requeue(delivery, job, delay)
    }
}
