//! Prediction repository: the single source of truth for prediction records.
//!
//! ## Contract
//!
//! - `create` is keyed on `request_id`: a second create for the same key returns
//!   the stored record instead of inserting.
//! - `complete` / `fail` only transition `pending` records. On a terminal record
//!   they are no-ops that return the stored record, so duplicate deliveries and
//!   concurrent writers converge on the first terminal write.
//! - `list_paged` is keyset-paginated on `(created_at, id)` descending.

pub mod in_memory;
pub mod postgres;

use core::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use textguard_core::{DomainError, Entity, PredictionId, RequestId};
use textguard_predictions::{PredictionRecord, ScoreUpdate};

pub use in_memory::InMemoryPredictionRepository;
pub use postgres::PostgresPredictionRepository;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepositoryError {
    #[error("prediction not found: {0}")]
    NotFound(PredictionId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of [`PredictionRepository::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The record was inserted.
    Created(PredictionRecord),
    /// A record with the same request id already existed; it is returned as stored.
    Existing(PredictionRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &PredictionRecord {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> PredictionRecord {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Keyset position: the last `(created_at, id)` seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: PredictionId,
}

impl PageCursor {
    pub fn after(record: &PredictionRecord) -> Self {
        Self {
            created_at: record.created_at(),
            id: *record.id(),
        }
    }

    /// Whether `record` sorts strictly after this cursor in newest-first order.
    pub fn precedes(&self, record: &PredictionRecord) -> bool {
        (record.created_at(), *record.id()) < (self.created_at, self.id)
    }
}

/// Opaque string form: `<unix-micros>:<uuid>`.
impl core::fmt::Display for PageCursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.created_at.timestamp_micros(), self.id)
    }
}

impl FromStr for PageCursor {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (micros, id) = s
            .split_once(':')
            .ok_or_else(|| DomainError::invalid_id(format!("PageCursor: {s}")))?;
        let micros: i64 = micros
            .parse()
            .map_err(|_| DomainError::invalid_id(format!("PageCursor: bad timestamp in {s}")))?;
        let created_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or_else(|| DomainError::invalid_id(format!("PageCursor: timestamp out of range in {s}")))?;
        Ok(Self {
            created_at,
            id: id.parse()?,
        })
    }
}

impl Serialize for PageCursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PageCursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One page of records, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub records: Vec<PredictionRecord>,
    /// Pass back to get the next page; `None` on the last page.
    pub next_cursor: Option<PageCursor>,
}

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

pub fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

/// Durable store of prediction records.
pub trait PredictionRepository: Send + Sync + 'static {
    /// Insert a `pending` record unless its request id is already stored.
    fn create(&self, record: PredictionRecord) -> Result<CreateOutcome, RepositoryError>;

    /// `pending → completed`; no-op on terminal records.
    fn complete(
        &self,
        id: PredictionId,
        update: &ScoreUpdate,
    ) -> Result<PredictionRecord, RepositoryError>;

    /// `pending → failed` with `reason` kept in metadata; no-op on terminal records.
    fn fail(&self, id: PredictionId, reason: &str) -> Result<PredictionRecord, RepositoryError>;

    fn find_by_id(&self, id: PredictionId) -> Result<Option<PredictionRecord>, RepositoryError>;

    fn find_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<PredictionRecord>, RepositoryError>;

    fn list_paged(&self, cursor: Option<PageCursor>, limit: usize) -> Result<Page, RepositoryError>;

    /// Records whose text equals `text` exactly, newest first, at most
    /// `clamp_limit(limit)` of them.
    fn find_by_text(&self, text: &str, limit: usize)
        -> Result<Vec<PredictionRecord>, RepositoryError>;

    /// Delete every record created strictly before `cutoff`; returns how many.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

impl<R: PredictionRepository + ?Sized> PredictionRepository for Arc<R> {
    fn create(&self, record: PredictionRecord) -> Result<CreateOutcome, RepositoryError> {
        (**self).create(record)
    }

    fn complete(
        &self,
        id: PredictionId,
        update: &ScoreUpdate,
    ) -> Result<PredictionRecord, RepositoryError> {
        (**self).complete(id, update)
    }

    fn fail(&self, id: PredictionId, reason: &str) -> Result<PredictionRecord, RepositoryError> {
        (**self).fail(id, reason)
    }

    fn find_by_id(&self, id: PredictionId) -> Result<Option<PredictionRecord>, RepositoryError> {
        (**self).find_by_id(id)
    }

    fn find_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<PredictionRecord>, RepositoryError> {
        (**self).find_by_request_id(request_id)
    }

    fn list_paged(&self, cursor: Option<PageCursor>, limit: usize) -> Result<Page, RepositoryError> {
        (**self).list_paged(cursor, limit)
    }

    fn find_by_text(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>, RepositoryError> {
        (**self).find_by_text(text, limit)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        (**self).delete_older_than(cutoff)
    }
}
