use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::ScoringError;

/// Output of one scoring call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    /// Toxicity score in \[0, 1\]; higher is more toxic.
    pub score: f64,

    /// The classifier's own label (e.g. `toxic` / `non_toxic`).
    pub label: String,

    /// Probability of the predicted label, in \[0, 1\].
    pub confidence: f64,
}

impl ScoreOutcome {
    /// Validates that the engine produced usable numbers.
    ///
    /// A model emitting NaN or out-of-range values is treated as unavailable,
    /// not as bad input.
    pub fn new(score: f64, label: impl Into<String>, confidence: f64) -> Result<Self, ScoringError> {
        for (what, value) in [("score", score), ("confidence", confidence)] {
            if !(value.is_finite() && (0.0..=1.0).contains(&value)) {
                return Err(ScoringError::EngineUnavailable(format!(
                    "model produced {what} outside [0, 1]: {value}"
                )));
            }
        }
        Ok(Self {
            score,
            label: label.into(),
            confidence,
        })
    }
}

/// A read-only toxicity classifier.
///
/// Implementations must be safe to call from many worker threads at once and
/// must not mutate state while scoring.
pub trait ScoringEngine: Send + Sync + 'static {
    /// Version tag written into every record scored by this engine.
    fn model_version(&self) -> &str;

    fn score(&self, text: &str) -> Result<ScoreOutcome, ScoringError>;
}

impl<E: ScoringEngine + ?Sized> ScoringEngine for Arc<E> {
    fn model_version(&self) -> &str {
        (**self).model_version()
    }

    fn score(&self, text: &str) -> Result<ScoreOutcome, ScoringError> {
        (**self).score(text)
    }
}

/// Engine whose model is installed once, possibly after workers start.
///
/// Until [`ModelSlot::install`] succeeds every call fails with
/// `EngineUnavailable`, which workers treat as transient.
#[derive(Debug)]
pub struct ModelSlot<E> {
    fallback_version: String,
    model: OnceLock<E>,
}

impl<E: ScoringEngine> ModelSlot<E> {
    pub fn new(fallback_version: impl Into<String>) -> Self {
        Self {
            fallback_version: fallback_version.into(),
            model: OnceLock::new(),
        }
    }

    pub fn loaded(model: E) -> Self {
        let slot = Self::new(model.model_version().to_string());
        let _ = slot.model.set(model);
        slot
    }

    /// Install the model. A second install is rejected and hands the model back.
    pub fn install(&self, model: E) -> Result<(), E> {
        self.model.set(model)
    }

    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }
}

impl<E: ScoringEngine> ScoringEngine for ModelSlot<E> {
    fn model_version(&self) -> &str {
        self.model
            .get()
            .map(|m| m.model_version())
            .unwrap_or(&self.fallback_version)
    }

    fn score(&self, text: &str) -> Result<ScoreOutcome, ScoringError> {
        match self.model.get() {
            Some(model) => model.score(text),
            None => Err(ScoringError::EngineUnavailable(
                "model is not loaded".to_string(),
            )),
        }
    }
}
