//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use platform_core::{ExecutionId, TenantId};

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (1 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay cap
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Default execution options of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum wall time of one handler invocation.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// The part of a job that comes from static configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub queue: String,
    /// Rendered schedule; `None` means the job is never auto-scheduled.
    pub schedule: Option<String>,
    pub options: JobOptions,
    pub single_running_job_globally: bool,
    pub enabled: bool,
}

impl JobDefinition {
    /// Whether `other` changes how the job runs (queue, schedule, options or
    /// exclusivity). Toggling `enabled` alone does not count.
    pub fn changes_semantics(&self, other: &JobDefinition) -> bool {
        self.queue != other.queue
            || self.schedule != other.schedule
            || self.options != other.options
            || self.single_running_job_globally != other.single_running_job_globally
    }
}

/// What writing a definition did to the persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobChange {
    Created,
    /// Semantics changed; the version was bumped in the same write.
    Updated,
    /// Only the enabled flag changed.
    Toggled,
    Unchanged,
}

/// Persisted job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub queue: String,
    pub schedule: Option<String>,
    pub options: JobOptions,
    pub single_running_job_globally: bool,
    pub enabled: bool,
    /// Monotonic; starts at 1 and grows on every semantic change.
    pub version: u64,
    /// Latest due boundary an item was enqueued for.
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// First registration of a definition.
    pub fn new(definition: JobDefinition, now: DateTime<Utc>) -> Self {
        Self {
            name: definition.name,
            queue: definition.queue,
            schedule: definition.schedule,
            options: definition.options,
            single_running_job_globally: definition.single_running_job_globally,
            enabled: definition.enabled,
            version: 1,
            last_enqueued_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn definition(&self) -> JobDefinition {
        JobDefinition {
            name: self.name.clone(),
            queue: self.queue.clone(),
            schedule: self.schedule.clone(),
            options: self.options.clone(),
            single_running_job_globally: self.single_running_job_globally,
            enabled: self.enabled,
        }
    }

    /// Overwrite the configured fields and bump the version when their
    /// semantics changed. Schedule state is kept.
    pub fn apply(&mut self, definition: JobDefinition, now: DateTime<Utc>) -> JobChange {
        let current = self.definition();
        if current == definition {
            return JobChange::Unchanged;
        }
        let change = if current.changes_semantics(&definition) {
            self.version += 1;
            JobChange::Updated
        } else {
            JobChange::Toggled
        };
        self.queue = definition.queue;
        self.schedule = definition.schedule;
        self.options = definition.options;
        self.single_running_job_globally = definition.single_running_job_globally;
        self.enabled = definition.enabled;
        self.updated_at = now;
        change
    }

    /// Key of the distributed lock guarding singleton runs.
    pub fn lock_key(&self) -> String {
        lock_key(&self.name)
    }
}

pub fn lock_key(job_name: &str) -> String {
    format!("job-lock:{job_name}")
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Enqueued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Handler failed; terminal once attempts are exhausted
    Failed,
    /// Worker vanished without reporting; awaiting redelivery
    Stalled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Stalled => "STALLED",
        }
    }
}

impl core::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "STALLED" => Ok(ExecutionStatus::Stalled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Message reported when an execution stalled too often.
pub const STALL_LIMIT_ERROR: &str = "job stalled more than allowable limit";

/// One logical run of a job, across all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_name: String,
    pub queue: String,
    /// Job version the run was scheduled against.
    pub job_version: u64,
    pub tenant_id: Option<TenantId>,
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Dedup/correlation key of the enqueue that created the run.
    pub correlation_key: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set once the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobExecution {
    /// A freshly enqueued run.
    pub fn pending(item: &QueueItem, queue: &str, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: item.id,
            job_name: item.job_name.clone(),
            queue: queue.to_string(),
            job_version: item.job_version,
            tenant_id: item.tenant_id,
            status: ExecutionStatus::Pending,
            attempts: 0,
            max_attempts,
            correlation_key: item.dedup_key.clone(),
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Finished runs never move again; `Completed` is only reachable from
    /// `Running`. Everything else is last-write-wins.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        if self.is_finished() {
            return false;
        }
        match next {
            ExecutionStatus::Pending => false,
            ExecutionStatus::Completed => self.status == ExecutionStatus::Running,
            ExecutionStatus::Running | ExecutionStatus::Failed | ExecutionStatus::Stalled => true,
        }
    }

    /// Start a new attempt. Resuming a stalled run does not use up one.
    pub fn mark_running(&mut self, job_version: u64, now: DateTime<Utc>) {
        if self.status != ExecutionStatus::Stalled || self.attempts == 0 {
            self.attempts += 1;
        }
        self.status = ExecutionStatus::Running;
        self.job_version = job_version;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        // finished_at never precedes started_at, even with a skewed clock
        let finished = self.started_at.map_or(now, |started| started.max(now));
        self.status = ExecutionStatus::Completed;
        self.error = None;
        self.finished_at = Some(finished);
        self.updated_at = now;
    }

    /// Record a failed attempt; terminal once `max_attempts` is reached.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self.updated_at = now;
        if self.attempts >= self.max_attempts {
            self.finished_at = Some(now);
        }
    }

    /// Force a terminal failure regardless of the attempt count.
    pub fn mark_abandoned(&mut self, error: String, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_stalled(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Stalled;
        self.updated_at = now;
    }
}

/// Work item carried by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Doubles as the execution id of the run.
    pub id: ExecutionId,
    pub job_name: String,
    /// Job version at enqueue time.
    pub job_version: u64,
    /// Due boundary (system jobs) or trigger time.
    pub scheduled_at: DateTime<Utc>,
    pub dedup_key: Option<String>,
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QueueItem {
    pub fn new(job_name: impl Into<String>, job_version: u64, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::new(),
            job_name: job_name.into(),
            job_version,
            scheduled_at,
            dedup_key: None,
            tenant_id: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
