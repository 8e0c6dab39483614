//! `textguard-scoring`
//!
//! **Responsibility:** the scoring engine boundary.
//!
//! The trained model is an opaque, read-only artifact:
//! - It is loaded once and shared across worker threads.
//! - Scoring is pure: no IO, no mutation after load.
//! - Callers bound each call with [`score_with_timeout`].

pub mod classifier;
pub mod engine;
pub mod error;
pub mod preprocess;
pub mod timeout;

pub use classifier::{LinearTextClassifier, ModelArtifact};
pub use engine::{ModelSlot, ScoreOutcome, ScoringEngine};
pub use error::ScoringError;
pub use preprocess::TextPreprocessor;
pub use timeout::{live_scoring_threads, score_with_timeout, MAX_SCORING_THREADS};
