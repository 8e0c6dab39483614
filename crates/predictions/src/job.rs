use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use textguard_core::{Entity, PredictionId, RequestId};

use crate::record::PredictionRecord;
use crate::request::Metadata;

/// Queue payload asking a worker to score one pending record.
///
/// Never persisted on its own; the record it points to is the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringJob {
    pub prediction_id: PredictionId,
    pub request_id: RequestId,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Retry counter, starting at 0 for the first delivery
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ScoringJob {
    /// First job for a freshly created pending record.
    pub fn for_record(record: &PredictionRecord) -> Self {
        Self {
            prediction_id: *record.id(),
            request_id: record.request_id().clone(),
            text: record.text().to_string(),
            metadata: record.metadata().clone(),
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The same job, re-enqueued for its next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}
