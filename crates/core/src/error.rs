//! Validation errors for requests and identifiers.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic input failures. Retrying never helps.
///
/// Scoring, queue and storage failures have their own error types in the
/// crates that own those concerns.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Text, metadata or a score fell outside what the model accepts.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An id could not be parsed or was blank / too long.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(
            DomainError::validation("text must not be empty").to_string(),
            "validation failed: text must not be empty"
        );
        assert_eq!(
            DomainError::invalid_id("RequestId: must not be empty").to_string(),
            "invalid identifier: RequestId: must not be empty"
        );
    }
}
