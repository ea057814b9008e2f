//! PostgreSQL-backed job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::errors::StoreError;
use crate::schema::{Job, JobStatus};
use crate::store::JobStore;

const JOB_COLUMNS: &str = "id, job_type, queue, status, progress, data, result, message, \
                           enqueued_at, started_at, ended_at, claimed_by, retry_count";

/// Run the bundled migrations against `pool`.
///
/// Creates the `jobs` table and its claim index. Idempotent.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// A [`JobStore`] backed by a PostgreSQL `jobs` table.
///
/// Claiming is a single conditional `UPDATE` over a `FOR UPDATE SKIP LOCKED`
/// subselect, so concurrent claimants never block each other and never win
/// the same row.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn status_of(&self, id: i64) -> Result<JobStatus, StoreError> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .ok_or(StoreError::NotFound)?;
        parse_status(&status)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create(&self, job_type: &str, queue: &str, data: Value) -> Result<Job, StoreError> {
        let query = format!(
            "INSERT INTO jobs (job_type, queue, data) VALUES ($1, $2, $3) RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_type)
            .bind(queue)
            .bind(data)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        row.try_into()
    }

    async fn claim_next(&self, queue: &str, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let query = format!(
            r"
            UPDATE jobs
            SET status = 'started', claimed_by = $2, started_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'new' AND queue = $1
                ORDER BY enqueued_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'new'
            RETURNING {JOB_COLUMNS}
            "
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(queue)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.map(Job::try_from).transpose()
    }

    async fn update_progress(&self, id: i64, pct: i16) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE jobs SET progress = $2 WHERE id = $1 AND status = 'started'")
                .bind(id)
                .bind(pct.clamp(0, 100))
                .execute(&self.pool)
                .await
                .map_err(store_error)?;

        if result.rows_affected() == 0 {
            // Either the job is already terminal (a benign race) or the id
            // does not exist at all.
            self.status_of(id).await?;
        }
        Ok(())
    }

    async fn finish(&self, id: i64, result: Value) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'finished', result = $2, ended_at = NOW() \
             WHERE id = $1 AND status = 'started'",
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if updated.rows_affected() == 0 {
            match self.status_of(id).await? {
                JobStatus::Finished => {}
                actual => return Err(StoreError::conflict("finish", actual)),
            }
        }
        Ok(())
    }

    async fn fail(&self, id: i64, message: String) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'failed', message = $2, ended_at = NOW() \
             WHERE id = $1 AND status = 'started'",
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if updated.rows_affected() == 0 {
            match self.status_of(id).await? {
                JobStatus::Failed => {}
                actual => return Err(StoreError::conflict("fail", actual)),
            }
        }
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Job, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .ok_or(StoreError::NotFound)?;
        row.try_into()
    }

    async fn requeue(&self, id: i64) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'new', claimed_by = NULL, progress = NULL, started_at = NULL,
                ended_at = NULL, result = NULL, message = NULL, retry_count = retry_count + 1
            WHERE id = $1 AND status IN ('started', 'failed')
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if updated.rows_affected() == 0 {
            let actual = self.status_of(id).await?;
            return Err(StoreError::conflict("requeue", actual));
        }
        Ok(())
    }

    async fn stale_started(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'started' AND started_at < $1 ORDER BY id ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows.into_iter().map(Job::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    job_type: String,
    queue: String,
    status: String,
    progress: Option<i16>,
    data: Value,
    result: Option<Value>,
    message: Option<String>,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    retry_count: i32,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            queue: row.queue,
            status: parse_status(&row.status)?,
            progress: row.progress,
            data: row.data,
            result: row.result,
            message: row.message,
            enqueued_at: row.enqueued_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            claimed_by: row.claimed_by,
            retry_count: row.retry_count,
        })
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse()
        .map_err(|error| StoreError::Unavailable(format!("corrupt job row: {error}")))
}

fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Unavailable(other.to_string()),
    }
}
