//! `textguard-predictions`
//!
//! **Responsibility:** the prediction data model.
//!
//! - `PredictionRequest`: what a caller submits (value object)
//! - `PredictionRecord`: what the repository persists (entity)
//! - `ScoringJob`: what travels through the task queue (transient)

pub mod job;
pub mod level;
pub mod record;
pub mod request;

pub use job::ScoringJob;
pub use level::ToxicityLevel;
pub use record::{
    FAILURE_REASON_KEY, MODEL_LABEL_KEY, PredictionRecord, PredictionStatus, ScoreUpdate,
    StoredPrediction,
};
pub use request::{Metadata, PredictionRequest};
