use core::str::FromStr;

use serde::{Deserialize, Serialize};

use textguard_core::{DomainError, ValueObject};

/// Category derived from a toxicity score.
///
/// Thresholds (lower bound inclusive):
/// - `none`: [0.00, 0.25)
/// - `low`: [0.25, 0.50)
/// - `medium`: [0.50, 0.75)
/// - `high`: [0.75, 1.00]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToxicityLevel {
    None,
    Low,
    Medium,
    High,
}

impl ValueObject for ToxicityLevel {}

impl ToxicityLevel {
    pub const LOW_THRESHOLD: f64 = 0.25;
    pub const MEDIUM_THRESHOLD: f64 = 0.5;
    pub const HIGH_THRESHOLD: f64 = 0.75;

    /// Map a score to its level. NaN maps to `None`.
    pub fn from_score(score: f64) -> Self {
        if score >= Self::HIGH_THRESHOLD {
            Self::High
        } else if score >= Self::MEDIUM_THRESHOLD {
            Self::Medium
        } else if score >= Self::LOW_THRESHOLD {
            Self::Low
        } else {
            Self::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl core::fmt::Display for ToxicityLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToxicityLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(DomainError::validation(format!(
                "unknown toxicity level: {other}"
            ))),
        }
    }
}
