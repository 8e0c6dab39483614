use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use textguard_core::{Entity, PredictionId, RequestId};
use textguard_predictions::{PredictionRecord, ScoreUpdate};

use super::{
    clamp_limit, CreateOutcome, Page, PageCursor, PredictionRepository, RepositoryError,
};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<PredictionId, PredictionRecord>,
    by_request_id: HashMap<RequestId, PredictionId>,
}

/// In-memory prediction repository.
///
/// Intended for tests/dev. One lock guards both the records and the
/// request-id index so `create` is atomic with respect to the unique key.
#[derive(Debug, Default)]
pub struct InMemoryPredictionRepository {
    tables: RwLock<Tables>,
}

impl InMemoryPredictionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition<F>(&self, id: PredictionId, apply: F) -> Result<PredictionRecord, RepositoryError>
    where
        F: FnOnce(&mut PredictionRecord),
    {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let record = tables
            .records
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound(id))?;
        apply(record);
        Ok(record.clone())
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::Storage("lock poisoned".to_string())
}

impl PredictionRepository for InMemoryPredictionRepository {
    fn create(&self, record: PredictionRecord) -> Result<CreateOutcome, RepositoryError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;

        if let Some(existing) = tables
            .by_request_id
            .get(record.request_id())
            .and_then(|id| tables.records.get(id))
        {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }

        let id = *record.id();
        tables.by_request_id.insert(record.request_id().clone(), id);
        tables.records.insert(id, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    fn complete(
        &self,
        id: PredictionId,
        update: &ScoreUpdate,
    ) -> Result<PredictionRecord, RepositoryError> {
        self.transition(id, |record| {
            record.apply_score(update, Utc::now());
        })
    }

    fn fail(&self, id: PredictionId, reason: &str) -> Result<PredictionRecord, RepositoryError> {
        self.transition(id, |record| {
            record.apply_failure(reason, Utc::now());
        })
    }

    fn find_by_id(&self, id: PredictionId) -> Result<Option<PredictionRecord>, RepositoryError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.records.get(&id).cloned())
    }

    fn find_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<PredictionRecord>, RepositoryError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .by_request_id
            .get(request_id)
            .and_then(|id| tables.records.get(id))
            .cloned())
    }

    fn list_paged(&self, cursor: Option<PageCursor>, limit: usize) -> Result<Page, RepositoryError> {
        let limit = clamp_limit(limit);
        let tables = self.tables.read().map_err(|_| poisoned())?;

        let mut matching: Vec<&PredictionRecord> = tables
            .records
            .values()
            .filter(|r| cursor.as_ref().is_none_or(|c| c.precedes(r)))
            .collect();
        matching.sort_by(|a, b| {
            (b.created_at(), b.id()).cmp(&(a.created_at(), a.id()))
        });

        let has_more = matching.len() > limit;
        let records: Vec<PredictionRecord> =
            matching.into_iter().take(limit).cloned().collect();
        let next_cursor = if has_more {
            records.last().map(PageCursor::after)
        } else {
            None
        };

        Ok(Page {
            records,
            next_cursor,
        })
    }

    fn find_by_text(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>, RepositoryError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let mut matching: Vec<&PredictionRecord> =
            tables.records.values().filter(|r| r.text() == text).collect();
        matching.sort_by(|a, b| {
            (b.created_at(), b.id()).cmp(&(a.created_at(), a.id()))
        });
        Ok(matching.into_iter().take(clamp_limit(limit)).cloned().collect())
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let Tables {
            records,
            by_request_id,
        } = &mut *tables;

        let before = records.len();
        records.retain(|_, r| r.created_at() >= cutoff);
        by_request_id.retain(|_, id| records.contains_key(id));
        Ok((before - records.len()) as u64)
    }
}
