use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::{StoreError, StoreResult};
use crate::job_store::{DeleteOutcome, JobStore, ListFilter, Mutator, Update};
use crate::types_jobs::{JobKind, JobRecord, JobState};

/// Job records as JSONB rows; `state` and `labels` are denormalized for queries.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    record: Json<JobRecord>,
}

fn check_kind(kind: JobKind, rec: &JobRecord) -> StoreResult<()> {
    if rec.kind() != kind {
        return Err(StoreError::Corrupt(format!(
            "row for {kind} {:?} holds a {} spec",
            rec.metadata.name,
            rec.kind()
        )));
    }
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, record: JobRecord) -> StoreResult<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO image_jobs (kind, name, state, labels, record, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, name) DO NOTHING
            "#,
        )
        .bind(record.kind().as_str())
        .bind(&record.metadata.name)
        .bind(record.status.state.as_str())
        .bind(Json(&record.metadata.labels))
        .bind(Json(&record))
        .bind(record.metadata.creation_timestamp)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                kind: record.kind().as_str(),
                name: record.metadata.name,
            });
        }
        Ok(())
    }

    async fn get(&self, kind: JobKind, name: &str) -> StoreResult<Option<JobRecord>> {
        let row: Option<RecordRow> =
            sqlx::query_as(r#"SELECT record FROM image_jobs WHERE kind = $1 AND name = $2"#)
                .bind(kind.as_str())
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(r) => {
                check_kind(kind, &r.record.0)?;
                Ok(Some(r.record.0))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, kind: JobKind, filter: &ListFilter) -> StoreResult<Vec<JobRecord>> {
        let states: Vec<String> = filter.states.iter().map(|s| s.as_str().to_string()).collect();
        let limit = filter.limit.map(|l| l as i64);
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT record
            FROM image_jobs
            WHERE kind = $1
              AND (cardinality($2::text[]) = 0 OR state = ANY($2))
              AND labels @> $3
            ORDER BY created_at ASC, seq ASC
            LIMIT $4
            "#,
        )
        .bind(kind.as_str())
        .bind(&states)
        .bind(Json(&filter.labels))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.record.0).collect())
    }

    async fn count(&self, kind: JobKind, state: JobState) -> StoreResult<usize> {
        let n: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*)::bigint FROM image_jobs WHERE kind = $1 AND state = $2"#,
        )
        .bind(kind.as_str())
        .bind(state.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(n.max(0) as usize)
    }

    async fn update(&self, kind: JobKind, name: &str, mutate: Mutator<'_>) -> StoreResult<Update> {
        let mut tx = self.pool.begin().await?;

        let row: Option<RecordRow> = sqlx::query_as(
            r#"SELECT record FROM image_jobs WHERE kind = $1 AND name = $2 FOR UPDATE"#,
        )
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(RecordRow { record: Json(mut record) }) = row else {
            tx.commit().await?;
            return Ok(Update::Missing);
        };
        check_kind(kind, &record)?;

        let previous = record.status.state;
        if !mutate(&mut record) {
            tx.commit().await?;
            return Ok(Update::Unchanged(record));
        }

        sqlx::query(
            r#"
            UPDATE image_jobs
            SET record = $3,
                state = $4,
                labels = $5,
                updated_at = NOW()
            WHERE kind = $1 AND name = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(Json(&record))
        .bind(record.status.state.as_str())
        .bind(Json(&record.metadata.labels))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Update::Applied { previous, record })
    }

    async fn delete(&self, kind: JobKind, name: &str) -> StoreResult<DeleteOutcome> {
        let active: Vec<String> = JobState::ACTIVE.iter().map(|s| s.as_str().to_string()).collect();
        let deleted: Option<RecordRow> = sqlx::query_as(
            r#"
            DELETE FROM image_jobs
            WHERE kind = $1 AND name = $2 AND NOT (state = ANY($3))
            RETURNING record
            "#,
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(&active)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(r) = deleted {
            return Ok(DeleteOutcome::Deleted(r.record.0));
        }

        let state: Option<String> =
            sqlx::query_scalar(r#"SELECT state FROM image_jobs WHERE kind = $1 AND name = $2"#)
                .bind(kind.as_str())
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        match state {
            None => Ok(DeleteOutcome::Missing),
            Some(s) => {
                let state = s.parse::<JobState>().map_err(StoreError::Corrupt)?;
                Ok(DeleteOutcome::Active(state))
            }
        }
    }

    async fn save_logs(&self, kind: JobKind, name: &str, logs: &str) -> StoreResult<()> {
        sqlx::query(r#"UPDATE image_jobs SET logs = $3 WHERE kind = $1 AND name = $2"#)
            .bind(kind.as_str())
            .bind(name)
            .bind(logs)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_logs(&self, kind: JobKind, name: &str) -> StoreResult<Option<String>> {
        let logs: Option<Option<String>> =
            sqlx::query_scalar(r#"SELECT logs FROM image_jobs WHERE kind = $1 AND name = $2"#)
                .bind(kind.as_str())
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(logs.flatten())
    }
}
