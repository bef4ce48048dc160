//! Scheduling of system jobs.
//!
//! Each tick enqueues at most one item per job and due boundary. The dedup
//! key is derived from the job name and the boundary, so ticks racing on
//! several scheduler replicas collapse into a single enqueue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use platform_core::{SharedClock, sub_std};

use crate::config::SchedulerConfig;
use crate::execution::JobExecutionService;
use crate::queue::{EnqueueOptions, EnqueueOutcome, SharedJobQueue};
use crate::registry::{JobDescriptor, JobRegistry};
use crate::store::{JobStoreError, SharedJobStore};
use crate::types::QueueItem;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulingError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// What a tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub enqueued: usize,
    /// Boundaries another scheduler instance already enqueued.
    pub collapsed: usize,
    /// Enqueues that errored; retried on the next tick.
    pub failed: usize,
}

/// Dedup key of the run due at `boundary`.
pub fn dedup_key(job_name: &str, boundary: DateTime<Utc>) -> String {
    format!("{job_name}:{}", boundary.timestamp_millis())
}

#[derive(Clone)]
pub struct SchedulingJobService {
    registry: Arc<JobRegistry>,
    store: SharedJobStore,
    queue: SharedJobQueue,
    executions: JobExecutionService,
    clock: SharedClock,
    config: SchedulerConfig,
}

impl SchedulingJobService {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: SharedJobStore,
        queue: SharedJobQueue,
        executions: JobExecutionService,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            executions,
            clock,
            config,
        }
    }

    pub async fn tick(&self) -> Result<TickReport, SchedulingError> {
        self.tick_at(self.clock.now()).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulingError> {
        let mut report = TickReport::default();
        for descriptor in self.registry.system_jobs() {
            self.schedule_job(descriptor, now, &mut report).await?;
        }
        if report.enqueued > 0 || report.failed > 0 {
            info!(
                enqueued = report.enqueued,
                collapsed = report.collapsed,
                failed = report.failed,
                "scheduler tick"
            );
        }
        Ok(report)
    }

    async fn schedule_job(
        &self,
        descriptor: &JobDescriptor,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulingError> {
        let Some(schedule) = descriptor.schedule() else {
            return Ok(());
        };
        let Some(job) = self.store.load_job(&descriptor.name).await? else {
            warn!(job = %descriptor.name, "system job not initialized, skipping");
            return Ok(());
        };
        if !job.enabled {
            return Ok(());
        }

        let floor = sub_std(now, self.config.catch_up_window());
        let reference = job.last_enqueued_at.unwrap_or(job.created_at).max(floor);
        let Some(boundary) = schedule.latest_due(reference, now) else {
            return Ok(());
        };

        let key = dedup_key(&job.name, boundary);
        let item = QueueItem::new(job.name.clone(), job.version, boundary).with_dedup_key(key.clone());
        let options = EnqueueOptions {
            dedup_key: Some(key.clone()),
            delay: None,
            retry: job.options.retry.clone(),
        };

        match self.queue.enqueue(&job.queue, item.clone(), options).await {
            Ok(EnqueueOutcome::Enqueued(id)) => {
                report.enqueued += 1;
                debug!(job = %job.name, execution_id = %id, %boundary, version = job.version, "system job enqueued");
                if let Err(e) = self
                    .executions
                    .record_pending(&item, &job.queue, job.options.retry.max_attempts)
                    .await
                {
                    warn!(job = %job.name, execution_id = %id, error = %e, "failed to record pending execution");
                }
            }
            Ok(EnqueueOutcome::Duplicate { .. }) => {
                report.collapsed += 1;
                debug!(job = %job.name, dedup_key = %key, "boundary already enqueued elsewhere");
            }
            Err(e) => {
                report.failed += 1;
                error!(job = %job.name, queue = %job.queue, error = %e, "failed to enqueue system job");
                return Ok(());
            }
        }

        self.store.record_enqueue(&job.name, boundary).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use platform_core::{Clock, ManualClock};

    use crate::config::{JobConfig, JobsConfig, QueueConfig};
    use crate::handler::JobContext;
    use crate::queue::{InMemoryJobQueue, JobQueue};
    use crate::schedule::ScheduleSpec;
    use crate::store::{InMemoryJobStore, JobStore};

    struct Fixture {
        clock: ManualClock,
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryJobQueue>,
        scheduler: SchedulingJobService,
    }

    fn noop(_: JobContext) -> std::future::Ready<anyhow::Result<()>> {
        std::future::ready(Ok(()))
    }

    async fn fixture() -> Fixture {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap();
        let clock = ManualClock::new(start);
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let config = JobsConfig {
            queues: vec![QueueConfig::new("maintenance")],
            system_jobs: vec![
                JobConfig::new("cleanup", "maintenance").with_schedule(ScheduleSpec::EverySecs(60)),
            ],
            ..Default::default()
        };
        let registry = Arc::new(
            JobRegistry::builder(config.clone())
                .handler("cleanup", noop)
                .build()
                .unwrap(),
        );

        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryJobQueue::with_clock(shared_clock.clone()));
        for q in registry.queues() {
            queue.declare_queue(&q.name, q.options.clone()).await.unwrap();
        }
        for descriptor in registry.jobs() {
            store.upsert_job(descriptor.definition(), start).await.unwrap();
        }

        let executions = JobExecutionService::new(store.clone(), shared_clock.clone());
        let scheduler = SchedulingJobService::new(
            registry,
            store.clone(),
            queue.clone(),
            executions,
            shared_clock,
            config.scheduler,
        );
        Fixture {
            clock,
            store,
            queue,
            scheduler,
        }
    }

    #[tokio::test]
    async fn nothing_is_due_before_the_first_boundary() {
        let f = fixture().await;
        assert_eq!(f.scheduler.tick().await.unwrap(), TickReport::default());
        assert_eq!(f.queue.waiting_len("maintenance"), 0);
    }

    #[tokio::test]
    async fn enqueues_once_per_boundary() {
        let f = fixture().await;
        f.clock.advance(chrono::Duration::seconds(40));

        let first = f.scheduler.tick().await.unwrap();
        assert_eq!(first.enqueued, 1);
        let second = f.scheduler.tick().await.unwrap();
        assert_eq!(second, TickReport::default());
        assert_eq!(f.queue.waiting_len("maintenance"), 1);

        let job = f.store.load_job("cleanup").await.unwrap().unwrap();
        assert_eq!(
            job.last_enqueued_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 1, 0).unwrap())
        );

        let pending = f.store.list_executions("cleanup", None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_key.as_deref(), Some("cleanup:1709287260000"));
    }

    #[tokio::test]
    async fn missed_boundaries_collapse_into_one_run() {
        let f = fixture().await;
        f.clock.advance(chrono::Duration::minutes(10));

        let report = f.scheduler.tick().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(f.queue.waiting_len("maintenance"), 1);
    }

    #[tokio::test]
    async fn disabled_jobs_are_not_scheduled() {
        let f = fixture().await;
        let mut definition = f.store.load_job("cleanup").await.unwrap().unwrap().definition();
        definition.enabled = false;
        f.store.upsert_job(definition, f.clock.now()).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(f.scheduler.tick().await.unwrap().enqueued, 0);
    }

    #[tokio::test]
    async fn enqueue_failures_are_retried_next_tick() {
        let f = fixture().await;
        f.clock.advance(chrono::Duration::minutes(1));

        // An undeclared queue stands in for an unreachable transport.
        let mut definition = f.store.load_job("cleanup").await.unwrap().unwrap().definition();
        definition.queue = "gone".into();
        f.store.upsert_job(definition.clone(), f.clock.now()).await.unwrap();

        let report = f.scheduler.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(f.store.load_job("cleanup").await.unwrap().unwrap().last_enqueued_at.is_none());

        definition.queue = "maintenance".into();
        f.store.upsert_job(definition, f.clock.now()).await.unwrap();
        assert_eq!(f.scheduler.tick().await.unwrap().enqueued, 1);
    }
}
