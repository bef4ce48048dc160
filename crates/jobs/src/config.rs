//! Static job configuration.
//!
//! Deserialized from the worker's TOML file and validated by
//! [`crate::registry::JobRegistry`] before any queue is declared.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleSpec;
use crate::types::{JobOptions, RetryPolicy};

fn default_concurrency() -> usize {
    50
}

fn default_max_stalled_count() -> u32 {
    10
}

fn default_stalled_interval_ms() -> u64 {
    30_000
}

fn default_dedup_window_ms() -> u64 {
    3_600_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_enabled() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_lock_safety_margin_ms() -> u64 {
    5_000
}

fn default_catch_up_window_ms() -> u64 {
    86_400_000
}

fn default_fetch_wait_ms() -> u64 {
    1_000
}

/// Whole job-subsystem configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    /// User-triggered jobs.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    /// Auto-scheduled jobs; each must carry a schedule.
    #[serde(default)]
    pub system_jobs: Vec<JobConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl JobsConfig {
    /// All job entries, system jobs first.
    pub fn all_jobs(&self) -> impl Iterator<Item = &JobConfig> {
        self.system_jobs.iter().chain(self.jobs.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Parallel handler invocations per worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Redeliveries after a stall before the item is failed for good.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
    /// A delivery without heartbeat for this long is considered stalled.
    #[serde(default = "default_stalled_interval_ms")]
    pub stalled_interval_ms: u64,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: default_concurrency(),
            max_stalled_count: default_max_stalled_count(),
            stalled_interval_ms: default_stalled_interval_ms(),
            dedup_window_ms: default_dedup_window_ms(),
        }
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub queue: String,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub single_running_job_globally: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl JobConfig {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            schedule: None,
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
            single_running_job_globally: false,
            enabled: true,
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn singleton(mut self) -> Self {
        self.single_running_job_globally = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn options(&self) -> JobOptions {
        JobOptions {
            timeout: self.timeout(),
            retry: self.retry.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Added to a job's timeout to form its lock TTL.
    #[serde(default = "default_lock_safety_margin_ms")]
    pub lock_safety_margin_ms: u64,
    /// How far back missed boundaries are still honoured.
    #[serde(default = "default_catch_up_window_ms")]
    pub catch_up_window_ms: u64,
    /// Upper bound on a single blocking fetch.
    #[serde(default = "default_fetch_wait_ms")]
    pub fetch_wait_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            lock_safety_margin_ms: default_lock_safety_margin_ms(),
            catch_up_window_ms: default_catch_up_window_ms(),
            fetch_wait_ms: default_fetch_wait_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lock_safety_margin(&self) -> Duration {
        Duration::from_millis(self.lock_safety_margin_ms)
    }

    pub fn catch_up_window(&self) -> Duration {
        Duration::from_millis(self.catch_up_window_ms)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: JobsConfig = serde_json::from_value(serde_json::json!({
            "queues": [{"name": "maintenance"}],
            "system_jobs": [{
                "name": "cleanup",
                "queue": "maintenance",
                "schedule": {"every_secs": 60}
            }]
        }))
        .unwrap();

        let queue = &config.queues[0];
        assert_eq!(queue.concurrency, 50);
        assert_eq!(queue.stalled_interval(), Duration::from_secs(30));

        let job = &config.system_jobs[0];
        assert_eq!(job.schedule, Some(ScheduleSpec::EverySecs(60)));
        assert_eq!(job.timeout(), Duration::from_secs(60));
        assert!(job.enabled);
        assert!(!job.single_running_job_globally);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn all_jobs_lists_system_jobs_first() {
        let config = JobsConfig {
            queues: vec![QueueConfig::new("q")],
            jobs: vec![JobConfig::new("user", "q")],
            system_jobs: vec![JobConfig::new("sys", "q").with_schedule(ScheduleSpec::EverySecs(5))],
            scheduler: SchedulerConfig::default(),
        };

        let names: Vec<_> = config.all_jobs().map(|j| j.name.as_str()).collect();
        assert_eq!(names, ["sys", "user"]);
    }
}
