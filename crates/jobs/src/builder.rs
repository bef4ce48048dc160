//! Explicit wiring of the job subsystem.
//!
//! Assembly order: registry, version service, lock provider, execution
//! service, scheduling service, processor. The registry is validated before
//! any queue is declared.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use platform_core::{SharedClock, SystemClock};

use crate::config::JobsConfig;
use crate::context::JobsContext;
use crate::error::JobsResult;
use crate::execution::JobExecutionService;
use crate::handler::{JobHandler, SharedHandler};
use crate::initialization::{JobInitializationService, ReconcileReport};
use crate::lock::{InMemoryLockProvider, SharedLockProvider};
use crate::processor::JobProcessor;
use crate::queue::{EnqueueOutcome, InMemoryJobQueue, SharedJobQueue};
use crate::registry::JobRegistry;
use crate::scheduling::SchedulingJobService;
use crate::service::{JobService, TriggerRequest};
use crate::store::{InMemoryJobStore, SharedJobStore};
use crate::version::JobVersionService;
use crate::worker::{JobsHandle, Worker};

/// Builder for [`Jobs`]. Collaborators not supplied default to the
/// in-memory implementations driven by the configured clock.
pub struct JobsBuilder {
    config: JobsConfig,
    handlers: Vec<(String, SharedHandler)>,
    store: Option<SharedJobStore>,
    locks: Option<SharedLockProvider>,
    queue: Option<SharedJobQueue>,
    clock: Option<SharedClock>,
    worker_id: Option<String>,
}

impl JobsBuilder {
    pub fn new(config: JobsConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            store: None,
            locks: None,
            queue: None,
            clock: None,
            worker_id: None,
        }
    }

    pub fn handler<H>(mut self, job_name: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.push((job_name.into(), Arc::new(handler)));
        self
    }

    pub fn store(mut self, store: SharedJobStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn locks(mut self, locks: SharedLockProvider) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn queue(mut self, queue: SharedJobQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Validate the configuration, declare the queues and assemble services.
    pub async fn build(self) -> JobsResult<Jobs> {
        let mut registry = JobRegistry::builder(self.config.clone());
        for (name, handler) in self.handlers {
            registry = registry.shared_handler(name, handler);
        }
        let registry = Arc::new(registry.build()?);

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let context = JobsContext {
            config: Arc::new(self.config),
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryJobStore::new())),
            locks: self
                .locks
                .unwrap_or_else(|| Arc::new(InMemoryLockProvider::with_clock(clock.clone()))),
            queue: self
                .queue
                .unwrap_or_else(|| Arc::new(InMemoryJobQueue::with_clock(clock.clone()))),
            clock,
            worker_id: self
                .worker_id
                .unwrap_or_else(|| format!("worker-{}-{}", std::process::id(), Uuid::now_v7().simple())),
        };

        for queue in registry.queues() {
            context
                .queue
                .declare_queue(&queue.name, queue.options.clone())
                .await?;
        }

        let versions = JobVersionService::new(context.store.clone(), context.clock.clone());
        let executions = JobExecutionService::new(context.store.clone(), context.clock.clone());
        let scheduler = SchedulingJobService::new(
            registry.clone(),
            context.store.clone(),
            context.queue.clone(),
            executions.clone(),
            context.clock.clone(),
            context.config.scheduler.clone(),
        );
        let processor = JobProcessor::new(
            registry.clone(),
            context.store.clone(),
            versions.clone(),
            context.locks.clone(),
            executions.clone(),
            context.queue.clone(),
            context.config.scheduler.clone(),
        );
        let service = JobService::new(
            registry.clone(),
            context.store.clone(),
            context.queue.clone(),
            executions.clone(),
            context.clock.clone(),
        );
        let initialization = JobInitializationService::new(
            registry.clone(),
            context.store.clone(),
            context.clock.clone(),
        );

        info!(
            worker_id = %context.worker_id,
            queues = registry.queues().len(),
            jobs = registry.jobs().count(),
            "job subsystem assembled"
        );

        Ok(Jobs {
            context,
            registry,
            versions,
            executions,
            scheduler,
            processor,
            service,
            initialization,
        })
    }
}

/// The assembled job subsystem.
pub struct Jobs {
    context: JobsContext,
    registry: Arc<JobRegistry>,
    versions: JobVersionService,
    executions: JobExecutionService,
    scheduler: SchedulingJobService,
    processor: JobProcessor,
    service: JobService,
    initialization: JobInitializationService,
}

impl Jobs {
    pub fn builder(config: JobsConfig) -> JobsBuilder {
        JobsBuilder::new(config)
    }

    /// Reconcile configured jobs with persisted rows. Run before [`Jobs::start`].
    pub async fn initialize(&self) -> JobsResult<ReconcileReport> {
        Ok(self.initialization.reconcile().await?)
    }

    /// Spawn the worker loops.
    pub fn start(&self, run_scheduler: bool) -> JobsHandle {
        self.worker().spawn(run_scheduler)
    }

    /// A worker bound to this subsystem, for driving deliveries by hand.
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.context.worker_id.clone(),
            self.registry.clone(),
            self.context.queue.clone(),
            self.processor.clone(),
            self.scheduler.clone(),
            self.executions.clone(),
            self.context.config.scheduler.clone(),
        )
    }

    pub async fn trigger(&self, request: TriggerRequest) -> JobsResult<EnqueueOutcome> {
        self.service.trigger(request).await
    }

    pub fn context(&self) -> &JobsContext {
        &self.context
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn versions(&self) -> &JobVersionService {
        &self.versions
    }

    pub fn executions(&self) -> &JobExecutionService {
        &self.executions
    }

    pub fn scheduler(&self) -> &SchedulingJobService {
        &self.scheduler
    }

    pub fn processor(&self) -> &JobProcessor {
        &self.processor
    }
}
