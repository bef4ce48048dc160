//! Static job registry.
//!
//! Built once at startup from [`JobsConfig`] plus one handler per job, and
//! validated eagerly. Nothing here touches a queue or a connection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::config::{JobConfig, JobsConfig, QueueConfig};
use crate::error::ConfigError;
use crate::handler::{JobHandler, SharedHandler};
use crate::queue::QueueOptions;
use crate::schedule::Schedule;
use crate::types::{JobDefinition, JobOptions};

/// A validated queue declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredQueue {
    pub name: String,
    pub options: QueueOptions,
}

/// Check the declared queue names on their own.
pub fn validate_queue_names(queues: &[QueueConfig]) -> Result<(), ConfigError> {
    if queues.is_empty() {
        return Err(ConfigError::EmptyQueueList);
    }
    let mut seen = HashSet::new();
    for queue in queues {
        if queue.name.trim().is_empty() {
            return Err(ConfigError::BlankQueueName);
        }
        if !seen.insert(queue.name.as_str()) {
            return Err(ConfigError::DuplicateQueue(queue.name.clone()));
        }
    }
    Ok(())
}

fn validate_queue_options(queue: &QueueConfig) -> Result<(), ConfigError> {
    let invalid = |field, reason: &str| ConfigError::InvalidOption {
        owner: format!("queue {}", queue.name),
        field,
        reason: reason.to_string(),
    };
    if queue.concurrency == 0 {
        return Err(invalid("concurrency", "must be at least 1"));
    }
    if queue.stalled_interval_ms == 0 {
        return Err(invalid("stalled_interval_ms", "must be positive"));
    }
    Ok(())
}

fn validate_job_options(job: &JobConfig) -> Result<(), ConfigError> {
    let invalid = |field, reason: &str| ConfigError::InvalidOption {
        owner: format!("job {}", job.name),
        field,
        reason: reason.to_string(),
    };
    if job.timeout_ms == 0 {
        return Err(invalid("timeout_ms", "must be positive"));
    }
    if job.retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts", "must be at least 1"));
    }
    if !(0.0..=1.0).contains(&job.retry.jitter) {
        return Err(invalid("retry.jitter", "must be within 0.0 and 1.0"));
    }
    Ok(())
}

/// Validate the queue/job wiring and return the queues to declare.
///
/// Pure over `config`: calling it twice with the same input yields the same
/// result.
pub fn register_queues(config: &JobsConfig) -> Result<Vec<RegisteredQueue>, ConfigError> {
    validate_queue_names(&config.queues)?;
    for queue in &config.queues {
        validate_queue_options(queue)?;
    }

    let declared: HashSet<&str> = config.queues.iter().map(|q| q.name.as_str()).collect();
    let mut used = HashSet::new();
    let mut names = HashSet::new();
    for job in config.all_jobs() {
        if job.name.trim().is_empty() {
            return Err(ConfigError::BlankJobName);
        }
        if !names.insert(job.name.as_str()) {
            return Err(ConfigError::DuplicateJob(job.name.clone()));
        }
        if !declared.contains(job.queue.as_str()) {
            return Err(ConfigError::UndeclaredQueue {
                job: job.name.clone(),
                queue: job.queue.clone(),
            });
        }
        used.insert(job.queue.as_str());
    }

    if let Some(idle) = config.queues.iter().find(|q| !used.contains(q.name.as_str())) {
        return Err(ConfigError::QueueWithoutJobs(idle.name.clone()));
    }

    Ok(config
        .queues
        .iter()
        .map(|q| RegisteredQueue {
            name: q.name.clone(),
            options: QueueOptions::from(q),
        })
        .collect())
}

/// How a job gets onto its queue.
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Enqueued by the scheduler on every due boundary.
    System { schedule: Schedule },
    /// Enqueued on demand through [`crate::JobService::trigger`].
    Triggered,
}

/// A job known to this process, with its handler.
#[derive(Clone)]
pub struct JobDescriptor {
    pub name: String,
    pub queue: String,
    pub kind: JobKind,
    pub options: JobOptions,
    pub single_running_job_globally: bool,
    pub enabled: bool,
    pub handler: SharedHandler,
}

impl JobDescriptor {
    pub fn is_system(&self) -> bool {
        matches!(self.kind, JobKind::System { .. })
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        match &self.kind {
            JobKind::System { schedule } => Some(schedule),
            JobKind::Triggered => None,
        }
    }

    /// The persisted shape of this descriptor.
    pub fn definition(&self) -> JobDefinition {
        JobDefinition {
            name: self.name.clone(),
            queue: self.queue.clone(),
            schedule: self.schedule().map(ToString::to_string),
            options: self.options.clone(),
            single_running_job_globally: self.single_running_job_globally,
            enabled: self.enabled,
        }
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("kind", &self.kind)
            .field("options", &self.options)
            .field("single_running_job_globally", &self.single_running_job_globally)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Validated set of queues and jobs.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    queues: Vec<RegisteredQueue>,
    jobs: BTreeMap<String, JobDescriptor>,
}

impl JobRegistry {
    pub fn builder(config: JobsConfig) -> JobRegistryBuilder {
        JobRegistryBuilder {
            config,
            handlers: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&JobDescriptor> {
        self.jobs.get(name)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.values()
    }

    pub fn system_jobs(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.values().filter(|job| job.is_system())
    }

    pub fn queues(&self) -> &[RegisteredQueue] {
        &self.queues
    }

    pub fn queue(&self, name: &str) -> Option<&RegisteredQueue> {
        self.queues.iter().find(|q| q.name == name)
    }
}

pub struct JobRegistryBuilder {
    config: JobsConfig,
    handlers: HashMap<String, SharedHandler>,
}

impl JobRegistryBuilder {
    pub fn handler<H>(self, job_name: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.shared_handler(job_name, Arc::new(handler))
    }

    pub fn shared_handler(mut self, job_name: impl Into<String>, handler: SharedHandler) -> Self {
        self.handlers.insert(job_name.into(), handler);
        self
    }

    pub fn build(mut self) -> Result<JobRegistry, ConfigError> {
        let queues = register_queues(&self.config)?;

        let mut jobs = BTreeMap::new();
        for (job, system) in self
            .config
            .system_jobs
            .iter()
            .map(|j| (j, true))
            .chain(self.config.jobs.iter().map(|j| (j, false)))
        {
            validate_job_options(job)?;

            let kind = match (&job.schedule, system) {
                (Some(spec), true) => {
                    let schedule =
                        Schedule::parse(spec).map_err(|reason| ConfigError::InvalidSchedule {
                            job: job.name.clone(),
                            reason,
                        })?;
                    JobKind::System { schedule }
                }
                (None, true) => return Err(ConfigError::MissingSchedule(job.name.clone())),
                (Some(_), false) => return Err(ConfigError::UnexpectedSchedule(job.name.clone())),
                (None, false) => JobKind::Triggered,
            };

            let handler = self
                .handlers
                .remove(&job.name)
                .ok_or_else(|| ConfigError::MissingHandler(job.name.clone()))?;

            jobs.insert(
                job.name.clone(),
                JobDescriptor {
                    name: job.name.clone(),
                    queue: job.queue.clone(),
                    kind,
                    options: job.options(),
                    single_running_job_globally: job.single_running_job_globally,
                    enabled: job.enabled,
                    handler,
                },
            );
        }

        if let Some(extra) = self.handlers.keys().min() {
            return Err(ConfigError::UnknownHandler(extra.clone()));
        }

        Ok(JobRegistry { queues, jobs })
    }
}
