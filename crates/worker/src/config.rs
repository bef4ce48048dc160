//! Worker process configuration, loaded from TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use platform_jobs::JobsConfig;
use platform_observability::LogFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_execution_retention_days() -> u64 {
    30
}

/// Execution history housekeeping.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetentionConfig {
    /// Finished executions older than this are pruned.
    #[serde(default = "default_execution_retention_days")]
    pub execution_retention_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            execution_retention_days: default_execution_retention_days(),
        }
    }
}

impl RetentionConfig {
    pub fn execution_retention(&self) -> Duration {
        Duration::from_secs(self.execution_retention_days.saturating_mul(86_400))
    }
}

/// Everything the worker binary reads at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    /// Postgres store. In-memory when absent.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Redis locks and queues. In-memory when absent.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Key prefix for Redis locks and queues.
    #[serde(default)]
    pub redis_prefix: Option<String>,
    /// Leave scheduling to other replicas.
    #[serde(default)]
    pub disable_scheduler: bool,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(flatten)]
    pub jobs: JobsConfig,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use platform_jobs::ScheduleSpec;

    #[test]
    fn empty_config_uses_defaults() {
        let config = WorkerConfig::load_str("").unwrap();
        assert!(config.database_url.is_none());
        assert!(!config.disable_scheduler);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.retention.execution_retention(),
            Duration::from_secs(30 * 86_400)
        );
        assert!(config.jobs.queues.is_empty());
    }

    #[test]
    fn jobs_sections_are_read_alongside_worker_settings() {
        let content = r#"
            database_url = "postgres://localhost/jobs"
            log_format = "pretty"

            [retention]
            execution_retention_days = 7

            [scheduler]
            tick_interval_ms = 500

            [[queues]]
            name = "maintenance"
            concurrency = 2

            [[system_jobs]]
            name = "execution-retention"
            queue = "maintenance"
            schedule = { cron = "0 0 3 * * *" }
            single_running_job_globally = true

            [[jobs]]
            name = "heartbeat"
            queue = "maintenance"
            timeout_ms = 5000
        "#;
        let config = WorkerConfig::load_str(content).unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.retention.execution_retention_days, 7);
        assert_eq!(config.jobs.scheduler.tick_interval_ms, 500);
        assert_eq!(config.jobs.queues[0].concurrency, 2);

        let retention = &config.jobs.system_jobs[0];
        assert_eq!(retention.schedule, Some(ScheduleSpec::Cron("0 0 3 * * *".into())));
        assert!(retention.single_running_job_globally);
        assert_eq!(config.jobs.jobs[0].timeout_ms, 5000);
    }

    #[test]
    fn shipped_config_declares_valid_queues() {
        let config = WorkerConfig::load_str(include_str!("../../../config/jobs.toml")).unwrap();
        let queues = platform_jobs::register_queues(&config.jobs).unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(config.jobs.jobs[0].retry.max_attempts, 3);
    }

    #[test]
    fn missing_files_and_bad_toml_are_errors() {
        assert!(matches!(
            WorkerConfig::load(Path::new("/nonexistent/jobs.toml")),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            WorkerConfig::load_str("queues = [unclosed"),
            Err(ConfigError::Parse(_))
        ));
    }
}
