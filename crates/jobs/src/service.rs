//! On-demand enqueueing of jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use platform_core::{SharedClock, TenantId, add_std};

use crate::error::{JobsError, JobsResult};
use crate::execution::JobExecutionService;
use crate::queue::{EnqueueOptions, EnqueueOutcome, SharedJobQueue};
use crate::registry::JobRegistry;
use crate::store::SharedJobStore;
use crate::types::QueueItem;

/// A request to run a job once.
#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    pub job_name: String,
    pub payload: serde_json::Value,
    pub tenant_id: Option<TenantId>,
    /// Collapses repeated triggers within the queue's dedup window.
    pub dedup_key: Option<String>,
    pub delay: Option<Duration>,
}

impl TriggerRequest {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Clone)]
pub struct JobService {
    registry: Arc<JobRegistry>,
    store: SharedJobStore,
    queue: SharedJobQueue,
    executions: JobExecutionService,
    clock: SharedClock,
}

impl JobService {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: SharedJobStore,
        queue: SharedJobQueue,
        executions: JobExecutionService,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            executions,
            clock,
        }
    }

    /// Enqueue one run of a job at its current version.
    #[instrument(skip(self, request), fields(job = %request.job_name))]
    pub async fn trigger(&self, request: TriggerRequest) -> JobsResult<EnqueueOutcome> {
        if self.registry.get(&request.job_name).is_none() {
            return Err(JobsError::UnknownJob(request.job_name));
        }
        let job = self
            .store
            .load_job(&request.job_name)
            .await?
            .ok_or_else(|| JobsError::UnknownJob(request.job_name.clone()))?;
        if !job.enabled {
            return Err(JobsError::JobDisabled(job.name));
        }

        let scheduled_at = add_std(self.clock.now(), request.delay.unwrap_or_default());
        let mut item = QueueItem::new(job.name.clone(), job.version, scheduled_at)
            .with_payload(request.payload);
        item.tenant_id = request.tenant_id;
        item.dedup_key = request.dedup_key.clone();

        let options = EnqueueOptions {
            dedup_key: request.dedup_key,
            delay: request.delay,
            retry: job.options.retry.clone(),
        };
        let outcome = self.queue.enqueue(&job.queue, item.clone(), options).await?;

        match &outcome {
            EnqueueOutcome::Enqueued(id) => {
                info!(execution_id = %id, version = job.version, "job triggered");
                if let Err(e) = self
                    .executions
                    .record_pending(&item, &job.queue, job.options.retry.max_attempts)
                    .await
                {
                    warn!(execution_id = %id, error = %e, "failed to record pending execution");
                }
            }
            EnqueueOutcome::Duplicate { dedup_key } => {
                info!(%dedup_key, "trigger collapsed into an earlier enqueue");
            }
        }
        Ok(outcome)
    }
}
