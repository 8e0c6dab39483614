//! Postgres-backed prediction repository.
//!
//! The reference schema lives in `migrations/0001_predictions.sql`.
//!
//! ## Idempotency
//!
//! - `create` uses `INSERT ... ON CONFLICT (request_id) DO NOTHING RETURNING`,
//!   falling back to a `SELECT` of the stored row when the insert was skipped.
//! - `complete` / `fail` are `UPDATE ... WHERE status = 'pending' RETURNING`.
//!   When no row is updated the stored row is returned unchanged (or
//!   `NotFound` when it does not exist).
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError |
//! |------------|-----------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed / Io / Tls / timeouts | `Storage` |
//! | Row decode failures | `Storage` |
//!
//! ## Runtime
//!
//! The repository trait is synchronous. Each call blocks on the tokio runtime
//! handle captured at construction, so it must be called from a thread that is
//! not itself driving that runtime (worker threads, `spawn_blocking`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{instrument, Span};

use textguard_core::{Entity, PredictionId, RequestId};
use textguard_predictions::{
    Metadata, PredictionRecord, PredictionStatus, ScoreUpdate, StoredPrediction, ToxicityLevel,
    FAILURE_REASON_KEY, MODEL_LABEL_KEY,
};

use super::{
    clamp_limit, CreateOutcome, Page, PageCursor, PredictionRepository, RepositoryError,
};

const SELECT_COLUMNS: &str = r#"
    id,
    request_id,
    text,
    toxicity_score,
    model_version,
    confidence,
    processing_time_ms,
    metadata,
    status,
    created_at,
    updated_at
"#;

/// Postgres-backed prediction repository.
///
/// Uses an SQLx connection pool, which is `Send + Sync`, so one instance can be
/// shared by the orchestrator, every worker thread and the sweeper.
#[derive(Debug, Clone)]
pub struct PostgresPredictionRepository {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresPredictionRepository {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect a small pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    async fn select_by_request_id(
        pool: &PgPool,
        request_id: &str,
    ) -> Result<Option<PredictionRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM predictions WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| map_sqlx_error("select_by_request_id", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn select_by_id(
        pool: &PgPool,
        id: PredictionId,
    ) -> Result<Option<PredictionRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM predictions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(pool)
        .await
        .map_err(|e| map_sqlx_error("select_by_id", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Row after a conditional update, or the untouched stored row.
    async fn updated_or_stored(
        pool: &PgPool,
        id: PredictionId,
        updated: Option<PgRow>,
    ) -> Result<PredictionRecord, RepositoryError> {
        match updated {
            Some(row) => record_from_row(&row),
            None => Self::select_by_id(pool, id)
                .await?
                .ok_or(RepositoryError::NotFound(id)),
        }
    }
}

impl PredictionRepository for PostgresPredictionRepository {
    #[instrument(
        skip(self, record),
        fields(
            prediction_id = %record.id(),
            request_id = %record.request_id()
        ),
        err
    )]
    fn create(&self, record: PredictionRecord) -> Result<CreateOutcome, RepositoryError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            let inserted = sqlx::query(&format!(
                r#"
                INSERT INTO predictions (
                    id,
                    request_id,
                    text,
                    toxicity_score,
                    toxicity_level,
                    model_version,
                    confidence,
                    processing_time_ms,
                    metadata,
                    status,
                    created_at,
                    updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (request_id) DO NOTHING
                RETURNING {SELECT_COLUMNS}
                "#
            ))
            .bind(record.id().as_uuid())
            .bind(record.request_id().as_str())
            .bind(record.text())
            .bind(record.toxicity_score())
            .bind(record.toxicity_level().as_str())
            .bind(record.model_version())
            .bind(record.confidence())
            .bind(to_db_millis(record.processing_time_ms()))
            .bind(JsonValue::Object(record.metadata().clone()))
            .bind(record.status().as_str())
            .bind(record.created_at())
            .bind(record.updated_at())
            .fetch_optional(&*pool)
            .await
            .map_err(|e| map_sqlx_error("create", e))?;

            if let Some(row) = inserted {
                return record_from_row(&row).map(CreateOutcome::Created);
            }

            Self::select_by_request_id(&pool, record.request_id().as_str())
                .await?
                .map(CreateOutcome::Existing)
                .ok_or_else(|| {
                    RepositoryError::Storage(format!(
                        "request id {} conflicted but no row is stored",
                        record.request_id()
                    ))
                })
        })
    }

    #[instrument(skip(self, update), fields(prediction_id = %id, score = update.score), err)]
    fn complete(
        &self,
        id: PredictionId,
        update: &ScoreUpdate,
    ) -> Result<PredictionRecord, RepositoryError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            let updated = sqlx::query(&format!(
                r#"
                UPDATE predictions
                SET
                    toxicity_score = $2,
                    toxicity_level = $3,
                    confidence = $4,
                    processing_time_ms = $5,
                    metadata = metadata || jsonb_build_object('{MODEL_LABEL_KEY}', $6::text),
                    model_version = $7,
                    status = 'completed',
                    updated_at = NOW()
                WHERE id = $1 AND status = 'pending'
                RETURNING {SELECT_COLUMNS}
                "#
            ))
            .bind(id.as_uuid())
            .bind(update.score)
            .bind(ToxicityLevel::from_score(update.score).as_str())
            .bind(update.confidence)
            .bind(to_db_millis(update.processing_time_ms))
            .bind(&update.label)
            .bind(&update.model_version)
            .fetch_optional(&*pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;

            Self::updated_or_stored(&pool, id, updated).await
        })
    }

    #[instrument(skip(self), fields(prediction_id = %id), err)]
    fn fail(&self, id: PredictionId, reason: &str) -> Result<PredictionRecord, RepositoryError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            let updated = sqlx::query(&format!(
                r#"
                UPDATE predictions
                SET
                    metadata = metadata || jsonb_build_object('{FAILURE_REASON_KEY}', $2::text),
                    status = 'failed',
                    updated_at = NOW()
                WHERE id = $1 AND status = 'pending'
                RETURNING {SELECT_COLUMNS}
                "#
            ))
            .bind(id.as_uuid())
            .bind(reason)
            .fetch_optional(&*pool)
            .await
            .map_err(|e| map_sqlx_error("fail", e))?;

            Self::updated_or_stored(&pool, id, updated).await
        })
    }

    #[instrument(skip(self), fields(prediction_id = %id), err)]
    fn find_by_id(&self, id: PredictionId) -> Result<Option<PredictionRecord>, RepositoryError> {
        let pool = self.pool.clone();
        self.runtime
            .block_on(async move { Self::select_by_id(&pool, id).await })
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    fn find_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<PredictionRecord>, RepositoryError> {
        let pool = self.pool.clone();
        self.runtime
            .block_on(async move { Self::select_by_request_id(&pool, request_id.as_str()).await })
    }

    #[instrument(skip(self), fields(record_count = tracing::field::Empty), err)]
    fn list_paged(&self, cursor: Option<PageCursor>, limit: usize) -> Result<Page, RepositoryError> {
        let limit = clamp_limit(limit);
        let pool = self.pool.clone();

        let page = self.runtime.block_on(async move {
            // One extra row tells us whether another page exists.
            let fetch = (limit + 1) as i64;
            let rows = match cursor {
                Some(c) => {
                    sqlx::query(&format!(
                        r#"
                        SELECT {SELECT_COLUMNS}
                        FROM predictions
                        WHERE (created_at, id) < ($1, $2)
                        ORDER BY created_at DESC, id DESC
                        LIMIT $3
                        "#
                    ))
                    .bind(c.created_at)
                    .bind(c.id.as_uuid())
                    .bind(fetch)
                    .fetch_all(&*pool)
                    .await
                }
                None => {
                    sqlx::query(&format!(
                        r#"
                        SELECT {SELECT_COLUMNS}
                        FROM predictions
                        ORDER BY created_at DESC, id DESC
                        LIMIT $1
                        "#
                    ))
                    .bind(fetch)
                    .fetch_all(&*pool)
                    .await
                }
            }
            .map_err(|e| map_sqlx_error("list_paged", e))?;

            let has_more = rows.len() > limit;
            let records = rows
                .iter()
                .take(limit)
                .map(record_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            let next_cursor = if has_more {
                records.last().map(PageCursor::after)
            } else {
                None
            };
            Ok::<_, RepositoryError>(Page {
                records,
                next_cursor,
            })
        })?;

        Span::current().record("record_count", page.records.len());
        Ok(page)
    }

    #[instrument(
        skip(self, text),
        fields(text_len = text.len(), record_count = tracing::field::Empty),
        err
    )]
    fn find_by_text(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>, RepositoryError> {
        let limit = clamp_limit(limit) as i64;
        let pool = self.pool.clone();
        let text = text.to_owned();

        let records = self.runtime.block_on(async move {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {SELECT_COLUMNS}
                FROM predictions
                WHERE text = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
                "#
            ))
            .bind(&text)
            .bind(limit)
            .fetch_all(&*pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_text", e))?;

            rows.iter().map(record_from_row).collect::<Result<Vec<_>, _>>()
        })?;

        Span::current().record("record_count", records.len());
        Ok(records)
    }

    #[instrument(skip(self), fields(cutoff = %cutoff), err)]
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            let result = sqlx::query("DELETE FROM predictions WHERE created_at < $1")
                .bind(cutoff)
                .execute(&*pool)
                .await
                .map_err(|e| map_sqlx_error("delete_older_than", e))?;
            Ok::<_, RepositoryError>(result.rows_affected())
        })
    }
}

fn to_db_millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn record_from_row(row: &PgRow) -> Result<PredictionRecord, RepositoryError> {
    stored_from_row(row)
        .map_err(|e| RepositoryError::Storage(format!("failed to decode prediction row: {e}")))
        .and_then(|stored| {
            PredictionRecord::restore(stored)
                .map_err(|e| RepositoryError::Storage(format!("invalid stored prediction: {e}")))
        })
}

fn stored_from_row(row: &PgRow) -> Result<StoredPrediction, String> {
    let get_err = |e: sqlx::Error| e.to_string();

    let request_id: String = row.try_get("request_id").map_err(get_err)?;
    let processing_time_ms: i64 = row.try_get("processing_time_ms").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let metadata = match row.try_get::<JsonValue, _>("metadata").map_err(get_err)? {
        JsonValue::Object(map) => map,
        JsonValue::Null => Metadata::new(),
        other => return Err(format!("metadata is not a JSON object: {other}")),
    };

    Ok(StoredPrediction {
        id: PredictionId::from_uuid(row.try_get("id").map_err(get_err)?),
        request_id: RequestId::new(request_id).map_err(|e| e.to_string())?,
        text: row.try_get("text").map_err(get_err)?,
        toxicity_score: row.try_get("toxicity_score").map_err(get_err)?,
        model_version: row.try_get("model_version").map_err(get_err)?,
        confidence: row.try_get("confidence").map_err(get_err)?,
        processing_time_ms: u64::try_from(processing_time_ms)
            .map_err(|_| format!("negative processing_time_ms {processing_time_ms}"))?,
        metadata,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        status: status
            .parse::<PredictionStatus>()
            .map_err(|e| e.to_string())?,
    })
}

/// Map SQLx errors to `RepositoryError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => RepositoryError::Storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("?"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            RepositoryError::Storage(format!("connection pool timed out in {operation}"))
        }
        other => RepositoryError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
