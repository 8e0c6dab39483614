use serde::Serialize;

use textguard_core::{DomainError, DomainResult, RequestId, ValueObject};

/// Opaque key/value bag carried alongside a prediction.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A caller's request to score one text.
///
/// Validated on construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRequest {
    text: String,
    request_id: Option<RequestId>,
    metadata: Metadata,
}

impl ValueObject for PredictionRequest {}

impl PredictionRequest {
    /// Upper bound on accepted text length, in characters.
    pub const MAX_TEXT_CHARS: usize = 10_000;

    pub fn new(text: impl Into<String>) -> DomainResult<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(DomainError::validation("text must not be empty"));
        }
        let chars = text.chars().count();
        if chars > Self::MAX_TEXT_CHARS {
            return Err(DomainError::validation(format!(
                "text is {chars} characters; the limit is {}",
                Self::MAX_TEXT_CHARS
            )));
        }
        Ok(Self {
            text,
            request_id: None,
            metadata: Metadata::new(),
        })
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}
