//! `platform-jobs` — distributed, versioned, queue-backed job runner.
//!
//! - **Registry**: static queue/job declarations validated at startup
//! - **Versions**: queued items carrying a superseded job version are discarded
//! - **Locks**: singleton jobs run at most once at a time across all workers
//! - **Executions**: per-run lifecycle records (`PENDING` to a terminal state)
//! - **Scheduling**: system jobs enqueue once per due boundary, across replicas
//! - **Worker**: bounded per-queue consumers, stall monitor, graceful shutdown
//!
//! Persistence, locking and transport are traits; in-memory implementations
//! live here, Postgres and Redis ones in `platform-infra`.
//!
//! ```no_run
//! # async fn run(config: platform_jobs::JobsConfig) -> Result<(), platform_jobs::JobsError> {
//! use platform_jobs::{JobContext, Jobs};
//!
//! let jobs = Jobs::builder(config)
//!     .handler("cleanup", |ctx: JobContext| async move {
//!         tracing::info!(execution_id = %ctx.execution_id, "cleaning up");
//!         Ok::<_, anyhow::Error>(())
//!     })
//!     .build()
//!     .await?;
//! jobs.initialize().await?;
//! let handle = jobs.start(true);
//! // ...
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod handler;
pub mod initialization;
pub mod lock;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod scheduling;
pub mod service;
pub mod store;
pub mod types;
pub mod version;
pub mod worker;

pub use builder::{Jobs, JobsBuilder};
pub use config::{JobConfig, JobsConfig, QueueConfig, SchedulerConfig};
pub use context::JobsContext;
pub use error::{ConfigError, JobsError, JobsResult};
pub use execution::{ExecutionError, JobExecutionService};
pub use handler::{JobContext, JobHandler, SharedHandler};
pub use initialization::{JobInitializationService, ReconcileReport};
pub use lock::{
    InMemoryLockProvider, LockError, LockGuard, LockHandle, LockProvider, SharedLockProvider,
};
pub use processor::{JobProcessor, ProcessError, ProcessOutcome};
pub use queue::{
    Delivery, EnqueueOptions, EnqueueOutcome, FailOutcome, FailedItem, InMemoryJobQueue, JobQueue,
    QueueError, QueueOptions, SharedJobQueue, StallReport,
};
pub use registry::{JobDescriptor, JobKind, JobRegistry, RegisteredQueue, register_queues};
pub use schedule::{Schedule, ScheduleSpec};
pub use scheduling::{SchedulingError, SchedulingJobService, TickReport};
pub use service::{JobService, TriggerRequest};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, SharedJobStore, UpsertedJob};
pub use types::{
    BackoffStrategy, ExecutionStatus, Job, JobChange, JobDefinition, JobExecution, JobOptions, QueueItem,
    RetryPolicy, STALL_LIMIT_ERROR,
};
pub use version::{JobVersionService, VersionError};
pub use worker::{JobsHandle, Worker, WorkerStats};
