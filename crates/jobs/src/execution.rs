//! Execution lifecycle bookkeeping.
//!
//! `PENDING -> RUNNING -> {COMPLETED | FAILED | STALLED}`, with `FAILED` and
//! `STALLED` looping back to `RUNNING` on redelivery until the run is
//! finished. Persisted status is observability only; the distributed lock is
//! what enforces singleton execution.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use platform_core::{ExecutionId, SharedClock, sub_std};

use crate::store::{JobStoreError, SharedJobStore};
use crate::types::{ExecutionStatus, JobExecution, QueueItem, STALL_LIMIT_ERROR};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("execution {id} already finished as {status}")]
    AlreadyFinished {
        id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Clone)]
pub struct JobExecutionService {
    store: SharedJobStore,
    clock: SharedClock,
}

impl JobExecutionService {
    pub fn new(store: SharedJobStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Record a freshly enqueued run. A second call for the same item returns
    /// the existing record.
    pub async fn record_pending(
        &self,
        item: &QueueItem,
        queue: &str,
        max_attempts: u32,
    ) -> Result<JobExecution, ExecutionError> {
        let execution = JobExecution::pending(item, queue, max_attempts, self.clock.now());
        match self.store.create_execution(&execution).await {
            Ok(()) => Ok(execution),
            Err(JobStoreError::AlreadyExists(_)) => self.load(item.id).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Start an attempt. Creates the record when the enqueue side did not.
    #[instrument(skip(self), fields(job = %job_name, execution_id = %execution_id))]
    pub async fn record_start(
        &self,
        job_name: &str,
        version: u64,
        execution_id: ExecutionId,
    ) -> Result<JobExecution, ExecutionError> {
        let mut execution = match self.store.get_execution(execution_id).await? {
            Some(execution) => execution,
            None => self.create_missing(job_name, version, execution_id).await?,
        };

        self.check(&execution, ExecutionStatus::Running)?;
        execution.mark_running(version, self.clock.now());
        self.store.update_execution(&execution).await?;
        debug!(attempt = execution.attempts, "execution started");
        Ok(execution)
    }

    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn record_success(
        &self,
        execution_id: ExecutionId,
    ) -> Result<JobExecution, ExecutionError> {
        let mut execution = self.load(execution_id).await?;
        self.check(&execution, ExecutionStatus::Completed)?;
        execution.mark_completed(self.clock.now());
        self.store.update_execution(&execution).await?;
        Ok(execution)
    }

    /// Record a failed attempt; the run finishes once its attempts are used up.
    #[instrument(skip(self, error), fields(execution_id = %execution_id))]
    pub async fn record_failure(
        &self,
        execution_id: ExecutionId,
        error: &str,
    ) -> Result<JobExecution, ExecutionError> {
        let mut execution = self.load(execution_id).await?;
        self.check(&execution, ExecutionStatus::Failed)?;
        execution.mark_failed(error.to_string(), self.clock.now());
        self.store.update_execution(&execution).await?;
        if execution.is_finished() {
            warn!(attempts = execution.attempts, error, "execution failed terminally");
        }
        Ok(execution)
    }

    /// Mark a run whose worker vanished. It stays eligible for redelivery.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn record_stalled(&self, execution_id: ExecutionId) -> Result<(), ExecutionError> {
        let execution = self.load(execution_id).await?;
        self.check(&execution, ExecutionStatus::Stalled)?;
        self.store
            .update_execution_status(
                execution_id,
                ExecutionStatus::Stalled,
                execution.error,
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    /// Terminally fail a run that stalled more often than its queue allows.
    pub async fn record_stall_limit_reached(
        &self,
        execution_id: ExecutionId,
    ) -> Result<JobExecution, ExecutionError> {
        self.record_exhausted(execution_id, STALL_LIMIT_ERROR).await
    }

    /// Make sure a run the queue gave up on reads as terminally failed.
    /// Already finished runs are returned unchanged.
    pub async fn record_exhausted(
        &self,
        execution_id: ExecutionId,
        error: &str,
    ) -> Result<JobExecution, ExecutionError> {
        let mut execution = self.load(execution_id).await?;
        if execution.is_finished() {
            return Ok(execution);
        }
        execution.mark_abandoned(error.to_string(), self.clock.now());
        self.store.update_execution(&execution).await?;
        warn!(job = %execution.job_name, %execution_id, error, "execution abandoned");
        Ok(execution)
    }

    pub async fn get(&self, execution_id: ExecutionId) -> Result<Option<JobExecution>, ExecutionError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    /// Executions of a job, newest first.
    pub async fn history(
        &self,
        job_name: &str,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> Result<Vec<JobExecution>, ExecutionError> {
        Ok(self.store.list_executions(job_name, status, limit).await?)
    }

    /// Delete finished executions older than `retention`.
    pub async fn prune(&self, retention: Duration) -> Result<u64, ExecutionError> {
        let before = sub_std(self.clock.now(), retention);
        let pruned = self.store.prune_executions(before).await?;
        debug!(pruned, %before, "pruned finished executions");
        Ok(pruned)
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<JobExecution, ExecutionError> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or(ExecutionError::NotFound(execution_id))
    }

    async fn create_missing(
        &self,
        job_name: &str,
        version: u64,
        execution_id: ExecutionId,
    ) -> Result<JobExecution, ExecutionError> {
        let job = self
            .store
            .load_job(job_name)
            .await?
            .ok_or_else(|| ExecutionError::UnknownJob(job_name.to_string()))?;

        let now = self.clock.now();
        let mut item = QueueItem::new(job_name, version, now);
        item.id = execution_id;
        let execution = JobExecution::pending(&item, &job.queue, job.options.retry.max_attempts, now);

        match self.store.create_execution(&execution).await {
            Ok(()) => Ok(execution),
            // Raced with the enqueue side.
            Err(JobStoreError::AlreadyExists(_)) => self.load(execution_id).await,
            Err(e) => Err(e.into()),
        }
    }

    fn check(&self, execution: &JobExecution, next: ExecutionStatus) -> Result<(), ExecutionError> {
        if execution.is_finished() {
            return Err(ExecutionError::AlreadyFinished {
                id: execution.id,
                status: execution.status,
            });
        }
        if !execution.can_transition_to(next) {
            return Err(ExecutionError::InvalidTransition {
                id: execution.id,
                from: execution.status,
                to: next,
            });
        }
        Ok(())
    }
}
