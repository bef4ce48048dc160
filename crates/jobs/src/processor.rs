//! Processing of a single delivered queue item.
//!
//! Order per item: version check, singleton lock, `record_start`, handler,
//! `record_success`/`record_failure`, lock release. The version is validated
//! before the lock is taken, so stale items never cause lock churn.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, interval_at};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::SchedulerConfig;
use crate::execution::{ExecutionError, JobExecutionService};
use crate::handler::JobContext;
use crate::lock::{LockError, LockGuard, SharedLockProvider};
use crate::queue::{Delivery, SharedJobQueue};
use crate::registry::JobRegistry;
use crate::store::{JobStoreError, SharedJobStore};
use crate::types::Job;
use crate::version::{JobVersionService, VersionError};

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// How an item was dealt with, short of a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Enqueued against a superseded job version; discarded.
    SkippedStale { enqueued: u64, current: u64 },
    /// Another worker holds the singleton lock.
    SkippedLocked,
    SkippedDisabled,
    SkippedUnknownJob,
    /// A redelivery of a run that already finished.
    AlreadyFinished,
    /// The handler outlived its timeout and was cancelled. The delivery is no
    /// longer heartbeated, so the stall monitor redelivers it.
    TimedOut,
}

/// A failed attempt; the queue's retry policy takes over.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Generic per-item pipeline, parameterized by the registry's descriptors.
#[derive(Clone)]
pub struct JobProcessor {
    registry: Arc<JobRegistry>,
    store: SharedJobStore,
    versions: JobVersionService,
    locks: SharedLockProvider,
    executions: JobExecutionService,
    queue: SharedJobQueue,
    config: SchedulerConfig,
}

impl JobProcessor {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: SharedJobStore,
        versions: JobVersionService,
        locks: SharedLockProvider,
        executions: JobExecutionService,
        queue: SharedJobQueue,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            versions,
            locks,
            executions,
            queue,
            config,
        }
    }

    /// TTL of the singleton lock for `job`.
    pub fn lock_ttl(&self, job: &Job) -> Duration {
        job.options.timeout + self.config.lock_safety_margin()
    }

    pub async fn process(&self, delivery: &Delivery) -> Result<ProcessOutcome, ProcessError> {
        let span = info_span!(
            "process",
            job = %delivery.item.job_name,
            execution_id = %delivery.item.id,
            queue = %delivery.queue,
            attempt = delivery.attempt,
        );
        self.process_inner(delivery).instrument(span).await
    }

    async fn process_inner(&self, delivery: &Delivery) -> Result<ProcessOutcome, ProcessError> {
        let item = &delivery.item;
        let Some(descriptor) = self.registry.get(&item.job_name) else {
            warn!("no handler registered for job, discarding item");
            return Ok(ProcessOutcome::SkippedUnknownJob);
        };
        let Some(job) = self.store.load_job(&item.job_name).await? else {
            warn!("job not initialized, discarding item");
            return Ok(ProcessOutcome::SkippedUnknownJob);
        };
        if !job.enabled {
            info!("job disabled, discarding item");
            return Ok(ProcessOutcome::SkippedDisabled);
        }

        if !self.versions.is_current(&job.name, item.job_version).await? {
            let current = self.versions.get_version(&job.name).await?;
            warn!(
                enqueued_version = item.job_version,
                current_version = current,
                "stale job version, discarding item"
            );
            self.discard_stale(delivery, current).await;
            return Ok(ProcessOutcome::SkippedStale {
                enqueued: item.job_version,
                current,
            });
        }

        let lock = if job.single_running_job_globally {
            match LockGuard::acquire(self.locks.clone(), &job.lock_key(), self.lock_ttl(&job)).await? {
                Some(guard) => Some(guard),
                None => {
                    info!("singleton job already running elsewhere, skipping");
                    return Ok(ProcessOutcome::SkippedLocked);
                }
            }
        } else {
            None
        };

        let execution = match self
            .executions
            .record_start(&job.name, item.job_version, item.id)
            .await
        {
            Ok(execution) => execution,
            Err(ExecutionError::AlreadyFinished { status, .. }) => {
                info!(%status, "execution already finished, acknowledging redelivery");
                release(lock).await;
                return Ok(ProcessOutcome::AlreadyFinished);
            }
            Err(e) => {
                release(lock).await;
                return Err(e.into());
            }
        };

        let ctx = JobContext {
            execution_id: item.id,
            job_name: job.name.clone(),
            queue: delivery.queue.clone(),
            job_version: item.job_version,
            attempt: execution.attempts,
            scheduled_at: item.scheduled_at,
            tenant_id: item.tenant_id,
            payload: item.payload.clone(),
        };

        let timeout = job.options.timeout;
        let run = tokio::time::timeout(timeout, descriptor.handler.run(ctx));
        tokio::pin!(run);

        let heartbeat_every = self
            .registry
            .queue(&delivery.queue)
            .map(|q| q.options.stalled_interval / 2)
            .unwrap_or(timeout)
            .max(MIN_TIMER_PERIOD);
        let renew_every = lock
            .as_ref()
            .map_or(timeout, |guard| guard.ttl() / 3)
            .max(MIN_TIMER_PERIOD);
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let mut renew = interval_at(Instant::now() + renew_every, renew_every);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.heartbeat(delivery).await {
                        warn!(error = %e, "queue heartbeat failed");
                    }
                }
                _ = renew.tick(), if lock.is_some() => {
                    if let Some(guard) = &lock {
                        match guard.extend().await {
                            Ok(true) => debug!("singleton lock extended"),
                            Ok(false) => warn!("singleton lock lost while running"),
                            Err(e) => warn!(error = %e, "failed to extend singleton lock"),
                        }
                    }
                }
            }
        };

        let outcome = match result {
            Ok(Ok(())) => {
                if let Err(e) = self.executions.record_success(item.id).await {
                    error!(error = %e, "failed to record execution success");
                }
                debug!("job completed");
                Ok(ProcessOutcome::Completed)
            }
            Ok(Err(e)) => {
                let message = format!("{e:#}");
                warn!(error = %message, "job handler failed");
                self.record_failure(delivery, &message).await;
                Err(ProcessError::Handler(message))
            }
            Err(_) => {
                warn!(?timeout, "job handler timed out, leaving delivery to stall");
                Ok(ProcessOutcome::TimedOut)
            }
        };

        release(lock).await;
        outcome
    }

    async fn record_failure(&self, delivery: &Delivery, message: &str) {
        if let Err(e) = self.executions.record_failure(delivery.item.id, message).await {
            error!(error = %e, "failed to record execution failure");
        }
    }

    async fn discard_stale(&self, delivery: &Delivery, current: u64) {
        let reason = format!(
            "discarded: enqueued for job version {} but current is {current}",
            delivery.item.job_version
        );
        match self.executions.record_exhausted(delivery.item.id, &reason).await {
            Ok(_) | Err(ExecutionError::NotFound(_)) => {}
            Err(e) => warn!(error = %e, "failed to record discarded execution"),
        }
    }
}

async fn release(lock: Option<LockGuard>) {
    let Some(guard) = lock else {
        return;
    };
    match guard.release().await {
        Ok(true) => {}
        Ok(false) => warn!("singleton lock had already expired"),
        Err(e) => warn!(error = %e, "failed to release singleton lock"),
    }
}
