use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{ScoreOutcome, ScoringEngine};
use crate::error::ScoringError;
use crate::preprocess::TextPreprocessor;

pub const TOXIC_LABEL: &str = "toxic";
pub const NON_TOXIC_LABEL: &str = "non_toxic";

/// On-disk form of a trained linear model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    pub bias: f64,
    pub weights: HashMap<String, f64>,
    /// Decision threshold for the `toxic` label (default 0.5).
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Bag-of-words logistic classifier.
///
/// Model:
/// - Preprocess the text into tokens (lowercase, stop words removed).
/// - Sum the weight of every token occurrence plus the bias.
/// - Squash with the logistic function to get P(toxic).
///
/// Tokens missing from the vocabulary contribute nothing.
#[derive(Debug, Clone)]
pub struct LinearTextClassifier {
    version: String,
    bias: f64,
    weights: HashMap<String, f64>,
    threshold: f64,
    max_chars: usize,
    preprocessor: TextPreprocessor,
}

impl LinearTextClassifier {
    pub const DEFAULT_THRESHOLD: f64 = 0.5;
    pub const DEFAULT_MAX_CHARS: usize = 10_000;

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ScoringError> {
        let threshold = artifact.threshold.unwrap_or(Self::DEFAULT_THRESHOLD);
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(ScoringError::EngineUnavailable(format!(
                "model threshold must be in (0, 1), got {threshold}"
            )));
        }
        if !artifact.bias.is_finite() || artifact.weights.values().any(|w| !w.is_finite()) {
            return Err(ScoringError::EngineUnavailable(
                "model contains non-finite weights".to_string(),
            ));
        }

        Ok(Self {
            version: artifact.version,
            bias: artifact.bias,
            weights: artifact.weights,
            threshold,
            max_chars: Self::DEFAULT_MAX_CHARS,
            preprocessor: TextPreprocessor::new(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ScoringError> {
        let artifact: ModelArtifact = serde_json::from_str(json).map_err(|e| {
            ScoringError::EngineUnavailable(format!("model artifact is malformed: {e}"))
        })?;
        Self::from_artifact(artifact)
    }

    /// Load the artifact from disk. Called once at startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScoringError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ScoringError::EngineUnavailable(format!(
                "cannot read model artifact {}: {e}",
                path.display()
            ))
        })?;
        let model = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            version = %model.version,
            vocabulary = model.weights.len(),
            "model loaded"
        );
        Ok(model)
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    fn logit(&self, tokens: &[String]) -> f64 {
        tokens
            .iter()
            .filter_map(|t| self.weights.get(t))
            .fold(self.bias, |acc, w| acc + w)
    }
}

impl ScoringEngine for LinearTextClassifier {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn score(&self, text: &str) -> Result<ScoreOutcome, ScoringError> {
        if text.trim().is_empty() {
            return Err(ScoringError::InvalidInput("text is empty".to_string()));
        }
        let chars = text.chars().count();
        if chars > self.max_chars {
            return Err(ScoringError::InvalidInput(format!(
                "text is {chars} characters; the model accepts at most {}",
                self.max_chars
            )));
        }

        // Only stop words or punctuation leaves no tokens; that scores as the bias.
        let tokens = self.preprocessor.tokens(text);
        let p_toxic = sigmoid(self.logit(&tokens));
        let (label, confidence) = if p_toxic >= self.threshold {
            (TOXIC_LABEL, p_toxic)
        } else {
            (NON_TOXIC_LABEL, 1.0 - p_toxic)
        };

        ScoreOutcome::new(p_toxic, label, confidence)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
