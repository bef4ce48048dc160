//! Postgres-backed job and execution store.
//!
//! Two tables, created by [`PostgresJobStore::ensure_schema`]:
//!
//! - `jobs`: one row per configured job, keyed by name. `version` only ever
//!   grows, `last_enqueued_at` only ever moves forward (`GREATEST`). Upserts
//!   run in a transaction holding the row lock (`FOR UPDATE`), so the compare
//!   and the version bump cannot interleave with another worker's upsert.
//! - `job_executions`: one row per logical run, keyed by the queue item id.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use platform_core::{ExecutionId, TenantId};
use platform_jobs::{
    ExecutionStatus, Job, JobChange, JobDefinition, JobExecution, JobOptions, JobStore,
    JobStoreError, UpsertedJob,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    name TEXT PRIMARY KEY,
    queue TEXT NOT NULL,
    schedule TEXT,
    options JSONB NOT NULL,
    single_running_job_globally BOOLEAN NOT NULL DEFAULT FALSE,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    version BIGINT NOT NULL DEFAULT 1 CHECK (version >= 1),
    last_enqueued_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS job_executions (
    id UUID PRIMARY KEY,
    job_name TEXT NOT NULL,
    queue TEXT NOT NULL,
    job_version BIGINT NOT NULL,
    tenant_id UUID,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    correlation_key TEXT,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS job_executions_by_job
    ON job_executions (job_name, created_at DESC);

CREATE INDEX IF NOT EXISTS job_executions_finished
    ON job_executions (finished_at)
    WHERE finished_at IS NOT NULL;
"#;

const JOB_COLUMNS: &str = "name, queue, schedule, options, single_running_job_globally, \
     enabled, version, last_enqueued_at, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, job_name, queue, job_version, tenant_id, status, attempts, \
     max_attempts, correlation_key, error, created_at, started_at, finished_at, updated_at";

/// Postgres-backed [`JobStore`].
///
/// Every write is a single statement, so concurrent replicas never need an
/// explicit transaction: version bumps and enqueue markers are resolved by
/// the database.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` with a default pool.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the tables if they do not exist yet. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, definition), fields(job = %definition.name), err)]
    async fn upsert_job(
        &self,
        definition: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<UpsertedJob, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("upsert_job", e))?;

        let insert = format!(
            r#"
            INSERT INTO jobs (name, queue, schedule, options, single_running_job_globally,
                              enabled, version, last_enqueued_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 1, NULL, $7, $7)
            ON CONFLICT (name) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = sqlx::query(&insert)
            .bind(&definition.name)
            .bind(&definition.queue)
            .bind(&definition.schedule)
            .bind(Json(&definition.options))
            .bind(definition.single_running_job_globally)
            .bind(definition.enabled)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_job", e))?;

        let upserted = match inserted {
            Some(row) => UpsertedJob {
                job: job_from_row(&row)?,
                change: JobChange::Created,
            },
            None => {
                let select = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = $1 FOR UPDATE");
                let row = sqlx::query(&select)
                    .bind(&definition.name)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("upsert_job", e))?;
                let mut job = job_from_row(&row)?;
                let change = job.apply(definition, now);
                if change != JobChange::Unchanged {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET queue = $2, schedule = $3, options = $4,
                            single_running_job_globally = $5, enabled = $6,
                            version = $7, updated_at = $8
                        WHERE name = $1
                        "#,
                    )
                    .bind(&job.name)
                    .bind(&job.queue)
                    .bind(&job.schedule)
                    .bind(Json(&job.options))
                    .bind(job.single_running_job_globally)
                    .bind(job.enabled)
                    .bind(to_i64(job.version, "version")?)
                    .bind(job.updated_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("upsert_job", e))?;
                }
                UpsertedJob { job, change }
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("upsert_job", e))?;
        if upserted.change == JobChange::Updated {
            debug!(version = upserted.job.version, "job definition changed, version bumped");
        }
        Ok(upserted)
    }

    async fn load_job(&self, name: &str) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = $1");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY name ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn bump_version(&self, name: &str, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET version = version + 1, updated_at = $2
            WHERE name = $1
            RETURNING version
            "#,
        )
        .bind(name)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("bump_version", e))?;

        let version = version.ok_or_else(|| JobStoreError::NotFound(name.to_string()))?;
        debug!(job = name, version, "job version bumped");
        to_u64(version, "version")
    }

    async fn record_enqueue(
        &self,
        name: &str,
        boundary: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        // GREATEST ignores NULL, so the first boundary always lands.
        let result = sqlx::query(
            "UPDATE jobs SET last_enqueued_at = GREATEST(last_enqueued_at, $2) WHERE name = $1",
        )
        .bind(name)
        .bind(boundary)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_enqueue", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id), err)]
    async fn create_execution(&self, execution: &JobExecution) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_executions (id, job_name, queue, job_version, tenant_id, status,
                                        attempts, max_attempts, correlation_key, error,
                                        created_at, started_at, finished_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(&execution.job_name)
        .bind(&execution.queue)
        .bind(to_i64(execution.job_version, "job_version")?)
        .bind(execution.tenant_id.map(|t| *t.as_uuid()))
        .bind(execution.status.as_str())
        .bind(to_i32(execution.attempts, "attempts")?)
        .bind(to_i32(execution.max_attempts, "max_attempts")?)
        .bind(&execution.correlation_key)
        .bind(&execution.error)
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("create_execution", e) {
            JobStoreError::AlreadyExists(_) => JobStoreError::AlreadyExists(execution.id.to_string()),
            other => other,
        })?;
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, JobStoreError> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_execution", e))?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions SET
                job_version = $2,
                tenant_id = $3,
                status = $4,
                attempts = $5,
                max_attempts = $6,
                correlation_key = $7,
                error = $8,
                started_at = $9,
                finished_at = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(to_i64(execution.job_version, "job_version")?)
        .bind(execution.tenant_id.map(|t| *t.as_uuid()))
        .bind(execution.status.as_str())
        .bind(to_i32(execution.attempts, "attempts")?)
        .bind(to_i32(execution.max_attempts, "max_attempts")?)
        .bind(&execution.correlation_key)
        .bind(&execution.error)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_execution", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(execution.id.to_string()));
        }
        Ok(())
    }

    async fn update_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE job_executions SET status = $2, error = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_execution_status", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_executions(
        &self,
        job_name: &str,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> Result<Vec<JobExecution>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM job_executions
            WHERE job_name = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(job_name)
            .bind(status.map(|s| s.as_str()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_executions", e))?;
        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn prune_executions(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM job_executions WHERE finished_at IS NOT NULL AND finished_at < $1",
        )
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_executions", e))?;
        Ok(result.rows_affected())
    }
}

struct JobRow {
    name: String,
    queue: String,
    schedule: Option<String>,
    options: Json<JobOptions>,
    single_running_job_globally: bool,
    enabled: bool,
    version: i64,
    last_enqueued_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            name: row.try_get("name")?,
            queue: row.try_get("queue")?,
            schedule: row.try_get("schedule")?,
            options: row.try_get("options")?,
            single_running_job_globally: row.try_get("single_running_job_globally")?,
            enabled: row.try_get("enabled")?,
            version: row.try_get("version")?,
            last_enqueued_at: row.try_get("last_enqueued_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            name: row.name,
            queue: row.queue,
            schedule: row.schedule,
            options: row.options.0,
            single_running_job_globally: row.single_running_job_globally,
            enabled: row.enabled,
            version: to_u64(row.version, "version")?,
            last_enqueued_at: row.last_enqueued_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct ExecutionRow {
    id: uuid::Uuid,
    job_name: String,
    queue: String,
    job_version: i64,
    tenant_id: Option<uuid::Uuid>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    correlation_key: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ExecutionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ExecutionRow {
            id: row.try_get("id")?,
            job_name: row.try_get("job_name")?,
            queue: row.try_get("queue")?,
            job_version: row.try_get("job_version")?,
            tenant_id: row.try_get("tenant_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            correlation_key: row.try_get("correlation_key")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ExecutionRow> for JobExecution {
    type Error = JobStoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ExecutionStatus>()
            .map_err(JobStoreError::Storage)?;
        Ok(JobExecution {
            id: ExecutionId::from_uuid(row.id),
            job_name: row.job_name,
            queue: row.queue,
            job_version: to_u64(row.job_version, "job_version")?,
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
            status,
            attempts: to_u32(row.attempts, "attempts")?,
            max_attempts: to_u32(row.max_attempts, "max_attempts")?,
            correlation_key: row.correlation_key,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?;
    row.try_into()
}

fn execution_from_row(row: &PgRow) -> Result<JobExecution, JobStoreError> {
    let row = ExecutionRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode execution row: {e}")))?;
    row.try_into()
}

fn to_u64(value: i64, column: &str) -> Result<u64, JobStoreError> {
    u64::try_from(value).map_err(|_| JobStoreError::Storage(format!("negative {column}: {value}")))
}

fn to_u32(value: i32, column: &str) -> Result<u32, JobStoreError> {
    u32::try_from(value).map_err(|_| JobStoreError::Storage(format!("negative {column}: {value}")))
}

fn to_i64(value: u64, column: &str) -> Result<i64, JobStoreError> {
    i64::try_from(value).map_err(|_| JobStoreError::Storage(format!("{column} out of range: {value}")))
}

fn to_i32(value: u32, column: &str) -> Result<i32, JobStoreError> {
    i32::try_from(value).map_err(|_| JobStoreError::Storage(format!("{column} out of range: {value}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::AlreadyExists(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use platform_jobs::{JobOptions, QueueItem};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    fn definition(name: &str) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            queue: "maintenance".to_string(),
            schedule: Some("every:60s".to_string()),
            options: JobOptions::default(),
            single_running_job_globally: true,
            enabled: true,
        }
    }

    /// Connects to `DATABASE_URL` in a scratch schema, or skips when unset.
    async fn store() -> Option<PostgresJobStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .after_connect(|conn: &mut sqlx::PgConnection, _| {
                Box::pin(async move {
                    sqlx::Executor::execute(
                        &mut *conn,
                        sqlx::raw_sql(
                            "CREATE SCHEMA IF NOT EXISTS jobs_test; SET search_path TO jobs_test",
                        ),
                    )
                    .await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .ok()?;
        let store = PostgresJobStore::new(pool);
        store.ensure_schema().await.ok()?;
        sqlx::raw_sql("TRUNCATE jobs, job_executions")
            .execute(store.pool())
            .await
            .ok()?;
        Some(store)
    }

    #[test]
    fn closed_pool_maps_to_storage_error() {
        let err = map_sqlx_error("create_execution", sqlx::Error::PoolClosed);
        assert!(matches!(err, JobStoreError::Storage(msg) if msg.contains("create_execution")));
    }

    #[test]
    fn negative_columns_are_rejected() {
        assert!(to_u64(-1, "version").is_err());
        assert_eq!(to_u32(3, "attempts").unwrap(), 3);
        assert!(to_i32(u32::MAX, "attempts").is_err());
    }

    #[tokio::test]
    async fn versions_and_enqueue_markers_only_move_forward() {
        let Some(store) = store().await else {
            return;
        };

        let created = store.upsert_job(definition("cleanup"), at(0)).await.unwrap();
        assert_eq!(created.change, JobChange::Created);
        assert_eq!(created.job.version, 1);
        assert_eq!(store.bump_version("cleanup", at(1)).await.unwrap(), 2);

        // Re-upserting the same definition keeps the version.
        let same = store.upsert_job(definition("cleanup"), at(2)).await.unwrap();
        assert_eq!(same.change, JobChange::Unchanged);
        assert_eq!(same.job.version, 2);

        let mut moved = definition("cleanup");
        moved.queue = "other".to_string();
        let updated = store.upsert_job(moved.clone(), at(3)).await.unwrap();
        assert_eq!(updated.change, JobChange::Updated);
        assert_eq!(updated.job.version, 3);
        assert_eq!(store.upsert_job(moved, at(4)).await.unwrap().change, JobChange::Unchanged);
        assert_eq!(store.load_job("cleanup").await.unwrap().unwrap().version, 3);

        store.record_enqueue("cleanup", at(5)).await.unwrap();
        store.record_enqueue("cleanup", at(3)).await.unwrap();
        let job = store.load_job("cleanup").await.unwrap().unwrap();
        assert_eq!(job.last_enqueued_at, Some(at(5)));

        assert!(matches!(
            store.bump_version("ghost", at(1)).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn executions_round_trip_and_prune() {
        let Some(store) = store().await else {
            return;
        };
        store.upsert_job(definition("cleanup"), at(0)).await.unwrap();

        let item = QueueItem::new("cleanup", 1, at(1));
        let mut execution = JobExecution::pending(&item, "maintenance", 3, at(1));
        store.create_execution(&execution).await.unwrap();
        assert!(matches!(
            store.create_execution(&execution).await,
            Err(JobStoreError::AlreadyExists(_))
        ));

        execution.mark_running(1, at(2));
        execution.mark_completed(at(3));
        store.update_execution(&execution).await.unwrap();

        let loaded = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.attempts, 1);

        let completed = store
            .list_executions("cleanup", Some(ExecutionStatus::Completed), 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);

        assert_eq!(store.prune_executions(at(4)).await.unwrap(), 1);
        assert!(store.get_execution(execution.id).await.unwrap().is_none());
    }
}
