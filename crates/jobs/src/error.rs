//! Error model of the job subsystem.

use thiserror::Error;

use crate::execution::ExecutionError;
use crate::lock::LockError;
use crate::processor::ProcessError;
use crate::queue::QueueError;
use crate::scheduling::SchedulingError;
use crate::store::JobStoreError;
use crate::version::VersionError;

/// Invalid queue/job declarations. Fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no queues declared")]
    EmptyQueueList,

    #[error("queue name must not be blank")]
    BlankQueueName,

    #[error("queue declared more than once: {0}")]
    DuplicateQueue(String),

    #[error("queue {0} is declared but no job uses it")]
    QueueWithoutJobs(String),

    #[error("job {job} references undeclared queue {queue}")]
    UndeclaredQueue { job: String, queue: String },

    #[error("job name must not be blank")]
    BlankJobName,

    #[error("job declared more than once: {0}")]
    DuplicateJob(String),

    #[error("no handler registered for job {0}")]
    MissingHandler(String),

    #[error("handler registered for unknown job {0}")]
    UnknownHandler(String),

    #[error("system job {0} has no schedule")]
    MissingSchedule(String),

    #[error("job {0} is user-triggered and must not carry a schedule")]
    UnexpectedSchedule(String),

    #[error("invalid schedule for job {job}: {reason}")]
    InvalidSchedule { job: String, reason: String },

    #[error("invalid {field} for {owner}: {reason}")]
    InvalidOption {
        owner: String,
        field: &'static str,
        reason: String,
    },
}

/// Umbrella error for callers driving the whole subsystem.
#[derive(Debug, Error)]
pub enum JobsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job is disabled: {0}")]
    JobDisabled(String),
}

pub type JobsResult<T> = Result<T, JobsError>;
