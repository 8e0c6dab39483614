use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoringError {
    /// Empty or oversized text. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The model cannot be evaluated right now (e.g. not loaded yet).
    #[error("scoring engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The call did not finish within its deadline.
    #[error("scoring timed out after {0:?}")]
    TimedOut(Duration),
}

impl ScoringError {
    /// Transient failures are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EngineUnavailable(_) | Self::TimedOut(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_input_errors_are_permanent() {
        assert!(!ScoringError::InvalidInput("empty".into()).is_transient());
        assert!(ScoringError::EngineUnavailable("not loaded".into()).is_transient());
        assert!(ScoringError::TimedOut(Duration::from_secs(1)).is_transient());
    }
}
