//! Persistence of job definitions and execution records.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use platform_core::ExecutionId;

use crate::types::{ExecutionStatus, Job, JobChange, JobDefinition, JobExecution};

/// Row written by [`JobStore::upsert_job`] and what the write changed.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertedJob {
    pub job: Job,
    pub change: JobChange,
}

/// Job store abstraction.
///
/// Execution rows are keyed by their own id; concurrent writers to the same
/// row resolve last-write-wins.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a definition at version 1, or overwrite the configured fields of
    /// an existing row as [`Job::apply`] does. Comparing, overwriting and
    /// bumping the version happen in one atomic write, so concurrent upserts
    /// of the same definition bump at most once. `last_enqueued_at` is never
    /// touched.
    async fn upsert_job(
        &self,
        definition: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<UpsertedJob, JobStoreError>;

    async fn load_job(&self, name: &str) -> Result<Option<Job>, JobStoreError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Atomically increment the version and return the new value.
    async fn bump_version(&self, name: &str, now: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Remember the latest boundary enqueued for a job. Older boundaries
    /// never overwrite newer ones.
    async fn record_enqueue(&self, name: &str, boundary: DateTime<Utc>)
    -> Result<(), JobStoreError>;

    async fn create_execution(&self, execution: &JobExecution) -> Result<(), JobStoreError>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, JobStoreError>;

    /// Replace a whole execution row.
    async fn update_execution(&self, execution: &JobExecution) -> Result<(), JobStoreError>;

    async fn update_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Executions of a job, newest first.
    async fn list_executions(
        &self,
        job_name: &str,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> Result<Vec<JobExecution>, JobStoreError>;

    /// Delete finished executions that finished before `before`.
    async fn prune_executions(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

pub type SharedJobStore = Arc<dyn JobStore>;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    executions: RwLock<HashMap<ExecutionId, JobExecution>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert_job(
        &self,
        definition: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<UpsertedJob, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let upserted = match jobs.get_mut(&definition.name) {
            Some(existing) => {
                let change = existing.apply(definition, now);
                UpsertedJob {
                    job: existing.clone(),
                    change,
                }
            }
            None => {
                let job = Job::new(definition, now);
                jobs.insert(job.name.clone(), job.clone());
                UpsertedJob {
                    job,
                    change: JobChange::Created,
                }
            }
        };
        Ok(upserted)
    }

    async fn load_job(&self, name: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(name).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<_> = self.jobs.read().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn bump_version(&self, name: &str, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| JobStoreError::NotFound(name.to_string()))?;
        job.version += 1;
        job.updated_at = now;
        Ok(job.version)
    }

    async fn record_enqueue(
        &self,
        name: &str,
        boundary: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| JobStoreError::NotFound(name.to_string()))?;
        if job.last_enqueued_at.is_none_or(|last| last < boundary) {
            job.last_enqueued_at = Some(boundary);
        }
        Ok(())
    }

    async fn create_execution(&self, execution: &JobExecution) -> Result<(), JobStoreError> {
        let mut executions = self.executions.write().unwrap();
        if executions.contains_key(&execution.id) {
            return Err(JobStoreError::AlreadyExists(execution.id.to_string()));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, JobStoreError> {
        Ok(self.executions.read().unwrap().get(&id).cloned())
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<(), JobStoreError> {
        let mut executions = self.executions.write().unwrap();
        if !executions.contains_key(&execution.id) {
            return Err(JobStoreError::NotFound(execution.id.to_string()));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut executions = self.executions.write().unwrap();
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        execution.status = status;
        execution.error = error;
        execution.updated_at = now;
        Ok(())
    }

    async fn list_executions(
        &self,
        job_name: &str,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> Result<Vec<JobExecution>, JobStoreError> {
        let executions = self.executions.read().unwrap();
        let mut matching: Vec<_> = executions
            .values()
            .filter(|e| e.job_name == job_name)
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn prune_executions(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut executions = self.executions.write().unwrap();
        let len = executions.len();
        executions.retain(|_, e| e.finished_at.is_none_or(|finished| finished >= before));
        Ok((len - executions.len()) as u64)
    }
}
