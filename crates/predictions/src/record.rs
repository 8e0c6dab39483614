use core::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use textguard_core::{DomainError, DomainResult, Entity, PredictionId, RequestId};

use crate::level::ToxicityLevel;
use crate::request::{Metadata, PredictionRequest};

/// Metadata key holding the classifier's own label.
pub const MODEL_LABEL_KEY: &str = "model_label";

/// Metadata key holding the reason a record ended `failed`.
pub const FAILURE_REASON_KEY: &str = "failure_reason";

/// Processing status of a prediction record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    /// Accepted, not yet scored
    Pending,
    /// Scored successfully (terminal)
    Completed,
    /// Scoring gave up (terminal)
    Failed,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl core::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!(
                "unknown prediction status: {other}"
            ))),
        }
    }
}

/// Result of one successful scoring call, ready to be written to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub score: f64,
    pub label: String,
    pub confidence: f64,
    pub processing_time_ms: u64,
    /// Version of the engine that produced this score.
    pub model_version: String,
}

impl ScoreUpdate {
    pub fn new(
        score: f64,
        label: impl Into<String>,
        confidence: f64,
        processing_time_ms: u64,
        model_version: impl Into<String>,
    ) -> DomainResult<Self> {
        check_unit_interval("toxicity score", score)?;
        check_unit_interval("confidence", confidence)?;
        Ok(Self {
            score,
            label: label.into(),
            confidence,
            processing_time_ms,
            model_version: model_version.into(),
        })
    }
}

fn check_unit_interval(what: &str, value: f64) -> DomainResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DomainError::validation(format!(
            "{what} must be within [0.0, 1.0], got {value}"
        )))
    }
}

/// Persisted outcome of scoring one text.
///
/// `toxicity_level` is always derived from `toxicity_score`; there is no
/// setter for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    id: PredictionId,
    request_id: RequestId,
    text: String,
    toxicity_score: f64,
    toxicity_level: ToxicityLevel,
    model_version: String,
    confidence: f64,
    processing_time_ms: u64,
    metadata: Metadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: PredictionStatus,
}

/// Raw column values used to rebuild a record read back from storage.
#[derive(Debug, Clone)]
pub struct StoredPrediction {
    pub id: PredictionId,
    pub request_id: RequestId,
    pub text: String,
    pub toxicity_score: f64,
    pub model_version: String,
    pub confidence: f64,
    pub processing_time_ms: u64,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: PredictionStatus,
}

impl PredictionRecord {
    /// New `pending` record for a request the orchestrator has committed to.
    pub fn pending(
        request: &PredictionRequest,
        request_id: RequestId,
        model_version: impl Into<String>,
    ) -> Self {
        // Storage keeps microseconds; truncate so cursors compare exactly.
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id: PredictionId::new(),
            request_id,
            text: request.text().to_string(),
            toxicity_score: 0.0,
            toxicity_level: ToxicityLevel::None,
            model_version: model_version.into(),
            confidence: 0.0,
            processing_time_ms: 0,
            metadata: request.metadata().clone(),
            created_at: now,
            updated_at: now,
            status: PredictionStatus::Pending,
        }
    }

    pub fn restore(stored: StoredPrediction) -> DomainResult<Self> {
        check_unit_interval("toxicity score", stored.toxicity_score)?;
        check_unit_interval("confidence", stored.confidence)?;
        Ok(Self {
            id: stored.id,
            request_id: stored.request_id,
            text: stored.text,
            toxicity_score: stored.toxicity_score,
            toxicity_level: ToxicityLevel::from_score(stored.toxicity_score),
            model_version: stored.model_version,
            confidence: stored.confidence,
            processing_time_ms: stored.processing_time_ms,
            metadata: stored.metadata,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            status: stored.status,
        })
    }

    /// Override the creation time (backfills and retention tests).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        let created_at = created_at.trunc_subsecs(6);
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// `pending → completed`. Returns `false` (and changes nothing) when the
    /// record is already terminal.
    pub fn apply_score(&mut self, update: &ScoreUpdate, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.toxicity_score = update.score;
        self.toxicity_level = ToxicityLevel::from_score(update.score);
        self.confidence = update.confidence;
        self.processing_time_ms = update.processing_time_ms;
        self.model_version = update.model_version.clone();
        self.metadata.insert(
            MODEL_LABEL_KEY.to_string(),
            JsonValue::String(update.label.clone()),
        );
        self.status = PredictionStatus::Completed;
        self.updated_at = at;
        true
    }

    /// `pending → failed`. Returns `false` when the record is already terminal.
    pub fn apply_failure(&mut self, reason: &str, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.metadata.insert(
            FAILURE_REASON_KEY.to_string(),
            JsonValue::String(reason.to_string()),
        );
        self.status = PredictionStatus::Failed;
        self.updated_at = at;
        true
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn toxicity_score(&self) -> f64 {
        self.toxicity_score
    }

    pub fn toxicity_level(&self) -> ToxicityLevel {
        self.toxicity_level
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn processing_time_ms(&self) -> u64 {
        self.processing_time_ms
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn status(&self) -> PredictionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.metadata.get(FAILURE_REASON_KEY).and_then(JsonValue::as_str)
    }

    pub fn model_label(&self) -> Option<&str> {
        self.metadata.get(MODEL_LABEL_KEY).and_then(JsonValue::as_str)
    }
}

impl Entity for PredictionRecord {
    type Id = PredictionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_record() -> PredictionRecord {
        let request = PredictionRequest::new("you are wonderful").unwrap();
        PredictionRecord::pending(&request, RequestId::new("r1").unwrap(), "1.0")
    }

    #[test]
    fn pending_record_starts_empty() {
        let record = pending_record();
        assert_eq!(record.status(), PredictionStatus::Pending);
        assert_eq!(record.toxicity_level(), ToxicityLevel::None);
        assert_eq!(record.processing_time_ms(), 0);
        assert!(!record.is_terminal());
    }

    #[test]
    fn score_sets_derived_level_and_label() {
        let mut record = pending_record();
        let update = ScoreUpdate::new(0.8, "toxic", 0.8, 12, "lexicon-v2").unwrap();

        assert!(record.apply_score(&update, Utc::now()));
        assert_eq!(record.status(), PredictionStatus::Completed);
        assert_eq!(record.toxicity_level(), ToxicityLevel::High);
        assert_eq!(record.model_label(), Some("toxic"));
        assert_eq!(record.processing_time_ms(), 12);
        assert_eq!(record.model_version(), "lexicon-v2");
    }

    #[test]
    fn terminal_record_ignores_later_transitions() {
        let mut record = pending_record();
        let first = ScoreUpdate::new(0.1, "non_toxic", 0.9, 3, "lexicon-v2").unwrap();
        assert!(record.apply_score(&first, Utc::now()));

        let second = ScoreUpdate::new(0.9, "toxic", 0.9, 3, "lexicon-v3").unwrap();
        assert!(!record.apply_score(&second, Utc::now()));
        assert!(!record.apply_failure("late failure", Utc::now()));

        assert_eq!(record.status(), PredictionStatus::Completed);
        assert_eq!(record.toxicity_score(), 0.1);
        assert_eq!(record.model_version(), "lexicon-v2");
        assert!(record.failure_reason().is_none());
    }

    #[test]
    fn identity_survives_completion() {
        let mut record = pending_record();
        let before = *record.id();
        let update = ScoreUpdate::new(0.4, "non_toxic", 0.6, 7, "lexicon-v2").unwrap();
        assert!(record.apply_score(&update, Utc::now()));
        assert_eq!(*record.id(), before);
    }

    #[test]
    fn failure_records_reason() {
        let mut record = pending_record();
        assert!(record.apply_failure("engine unavailable", Utc::now()));
        assert_eq!(record.status(), PredictionStatus::Failed);
        assert_eq!(record.failure_reason(), Some("engine unavailable"));
    }

    #[test]
    fn score_update_rejects_out_of_range_values() {
        assert!(ScoreUpdate::new(1.01, "toxic", 0.5, 0, "1.0").is_err());
        assert!(ScoreUpdate::new(0.5, "toxic", -0.1, 0, "1.0").is_err());
        assert!(ScoreUpdate::new(f64::NAN, "toxic", 0.5, 0, "1.0").is_err());
    }

    #[test]
    fn restore_recomputes_level() {
        let now = Utc::now();
        let record = PredictionRecord::restore(StoredPrediction {
            id: PredictionId::new(),
            request_id: RequestId::new("r9").unwrap(),
            text: "text".into(),
            toxicity_score: 0.6,
            model_version: "1.0".into(),
            confidence: 0.6,
            processing_time_ms: 4,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            status: PredictionStatus::Completed,
        })
        .unwrap();
        assert_eq!(record.toxicity_level(), ToxicityLevel::Medium);
    }

    #[test]
    fn status_parses_its_own_names() {
        for status in [
            PredictionStatus::Pending,
            PredictionStatus::Completed,
            PredictionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<PredictionStatus>().unwrap(), status);
        }
    }
}
